//! ordsync — keep a work tracker reconciled with ingested order data.
//!
//! # Usage
//!
//! ```text
//! ordsync run [--since 12h | --batch <id>] [--online] [--force <order>...]
//! ordsync status [--project <key>] [--order <id>] [--json]
//! ordsync resolve <project> <order> [--story <n>] [--ignore-cache]
//! ordsync invalidate <project> <order>
//! ```

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    invalidate::InvalidateArgs, resolve::ResolveArgs, run::RunArgs, status::StatusArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "ordsync",
    version,
    about = "Reconcile tracker epics/stories with ingested order data",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a reconciliation pass over a window or batch of order data.
    Run(RunArgs),

    /// Inspect the engine's durable state (identities, fingerprints,
    /// checkpoints).
    Status(StatusArgs),

    /// Resolve one logical item against the cache and the remote tracker.
    Resolve(ResolveArgs),

    /// Drop an order's cached identity mappings (disaster recovery).
    Invalidate(InvalidateArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("ORDSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Single-entry runtime for the async commands.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Resolve(args) => args.run(),
        Commands::Invalidate(args) => args.run(),
    }
}
