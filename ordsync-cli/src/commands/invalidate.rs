//! `ordsync invalidate` — drop an order's cached identity mappings.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use ordsync_core::types::{OrderId, ProjectKey};
use ordsync_engine::state::StateStore;

use crate::config::Config;

/// Arguments for `ordsync invalidate`.
#[derive(Args, Debug)]
pub struct InvalidateArgs {
    /// Path to the config file (default: ~/.ordsync/config.yaml).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Target project key.
    pub project: String,

    /// Order identifier whose mappings should be dropped.
    pub order: String,
}

impl InvalidateArgs {
    pub fn run(self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;
        let runtime = crate::runtime()?;
        runtime.block_on(async {
            let store = StateStore::open(&config.data_dir);
            let removed = store
                .invalidate_order(
                    &ProjectKey::from(self.project.as_str()),
                    &OrderId::from(self.order.as_str()),
                )
                .await?;
            println!(
                "dropped {removed} identity mapping(s) for {}/{}; the next run will re-resolve or re-create",
                self.project, self.order,
            );
            Ok(())
        })
    }
}
