//! `ordsync run` — one reconciliation pass.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tokio::sync::watch;

use ordsync_client::{HttpTracker, TrackerConfig};
use ordsync_core::fieldmap::FieldMap;
use ordsync_core::registry::ProductRegistry;
use ordsync_core::types::OrderId;
use ordsync_engine::pipeline::{Pipeline, RunOptions, RunScope};
use ordsync_engine::report::RunReport;
use ordsync_engine::source::JsonSpoolSource;
use ordsync_engine::state::StateStore;

use crate::config::Config;

/// Arguments for `ordsync run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the config file (default: ~/.ordsync/config.yaml).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Trailing window of source rows to consider (e.g. 12h, 3d).
    #[arg(long, default_value = "7d", conflicts_with = "batch")]
    pub since: String,

    /// Process a single named ingestion batch instead of a window.
    #[arg(long)]
    pub batch: Option<String>,

    /// Actually write to the tracker. Without this the run is a dry run.
    #[arg(long)]
    pub online: bool,

    /// Force a dry run even when --online is given.
    #[arg(long)]
    pub dry_run: bool,

    /// Reprocess these orders regardless of fingerprint/checkpoint.
    #[arg(long = "force", value_name = "ORDER")]
    pub force: Vec<String>,

    /// Override the configured worker count.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Resolve every item by remote lookup, ignoring the identity cache.
    #[arg(long)]
    pub ignore_cache: bool,

    /// Write the full JSON report here.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Write the text summary here.
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Print the full report as JSON instead of the summary.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;
        let runtime = crate::runtime()?;
        let report = runtime.block_on(self.execute(&config))?;

        if let Some(path) = &self.report {
            std::fs::write(path, serde_json::to_string_pretty(&report)?)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
        }
        if let Some(path) = &self.summary {
            std::fs::write(path, report.summary_text())
                .with_context(|| format!("failed to write summary to {}", path.display()))?;
        }

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_summary(&report);
        }

        if report.totals.failures > 0 {
            bail!("{} order(s) failed; see report for details", report.totals.failures);
        }
        Ok(())
    }

    async fn execute(&self, config: &Config) -> Result<RunReport> {
        let dry_run = !self.online || self.dry_run;

        let registry = ProductRegistry::load(&config.registry_path)?;
        let fieldmap = FieldMap::load(&config.fieldmap_path)?;
        let store = Arc::new(StateStore::open(&config.data_dir));
        let source = Arc::new(JsonSpoolSource::new(&config.spool_dir));

        let tracker = config.tracker()?;
        let api_token = if dry_run {
            // Dry runs still resolve against the remote; a missing token is
            // only fatal when we cannot reach the tracker at all.
            config.api_token().unwrap_or_default()
        } else {
            config.api_token()?
        };
        let mut tracker_config = TrackerConfig::new(&tracker.base_url, api_token);
        tracker_config.timeout_secs = tracker.timeout_secs;
        let api = Arc::new(HttpTracker::new(tracker_config)?);

        let pipeline = Pipeline::new(source, registry, fieldmap, store, api);

        let scope = match &self.batch {
            Some(batch) => RunScope::Batch(batch.clone()),
            None => RunScope::Window {
                since: parse_window(&self.since)?,
            },
        };
        let opts = RunOptions {
            scope,
            force: self
                .force
                .iter()
                .map(|o| OrderId::from(o.as_str()))
                .collect::<BTreeSet<_>>(),
            dry_run,
            workers: self.workers.unwrap_or(config.workers),
            ignore_identity_cache: self.ignore_cache,
            retry: config.retry_policy(),
        };

        // Ctrl-c stops picking up new orders; in-flight orders reach their
        // commit point first.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received; finishing in-flight orders");
                let _ = cancel_tx.send(true);
            }
        });

        Ok(pipeline.run(opts, cancel_rx).await?)
    }
}

/// Parse a trailing-window spec: `12h`, `3d`, or a bare day count.
fn parse_window(spec: &str) -> Result<chrono::Duration> {
    let spec = spec.trim();
    if let Some(hours) = spec.strip_suffix('h') {
        let hours: i64 = hours.parse().context("invalid hour count")?;
        return Ok(chrono::Duration::hours(hours));
    }
    if let Some(days) = spec.strip_suffix('d') {
        let days: i64 = days.parse().context("invalid day count")?;
        return Ok(chrono::Duration::days(days));
    }
    if let Ok(days) = spec.parse::<i64>() {
        return Ok(chrono::Duration::days(days));
    }
    bail!("invalid window '{spec}'; expected e.g. 12h or 3d")
}

fn print_summary(report: &RunReport) {
    let mode = if report.dry_run {
        "dry-run".yellow().bold()
    } else {
        "online".green().bold()
    };
    println!("Reconciliation {} [{mode}]", report.run_id);
    println!(
        "  orders={} changed={} {} {} unchanged={} warnings={} {}",
        report.totals.orders,
        report.totals.changed,
        format!("created={}", report.totals.created).green(),
        format!("updated={}", report.totals.updated).cyan(),
        report.totals.unchanged_items,
        report.totals.warnings,
        if report.totals.failures > 0 {
            format!("failures={}", report.totals.failures).red().bold().to_string()
        } else {
            "failures=0".to_string()
        },
    );
    for product in &report.products {
        let project = product
            .project
            .as_ref()
            .map(|p| p.0.clone())
            .unwrap_or_else(|| "unmapped".to_string());
        println!(
            "  - {} [{}]: orders={} changed={}",
            product.product, project, product.orders_seen, product.changed,
        );
        for warning in &product.warnings {
            println!("      {} {}", "warn:".yellow(), warning);
        }
        for order in &product.orders {
            for warning in &order.warnings {
                println!("      {} {}", "warn:".yellow(), warning);
            }
            if let Some(failure) = &order.failure {
                println!(
                    "      {} {} stage={:?} {}{}",
                    "fail:".red().bold(),
                    order.order,
                    failure.stage,
                    failure.reason,
                    failure
                        .field
                        .as_ref()
                        .map(|f| format!(" (field {f})"))
                        .unwrap_or_default(),
                );
            }
        }
    }
}
