//! `ordsync resolve` — exercise the identity resolver for one item.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use ordsync_client::{HttpTracker, TrackerConfig};
use ordsync_core::fieldmap::FieldMap;
use ordsync_core::types::{OrderId, ProjectKey};
use ordsync_engine::resolver::{subject_for, IdentityResolver, Resolution};
use ordsync_engine::state::{IdentityKey, StateStore};

use crate::config::Config;

/// Arguments for `ordsync resolve`.
#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Path to the config file (default: ~/.ordsync/config.yaml).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Target project key.
    pub project: String,

    /// Order identifier.
    pub order: String,

    /// Resolve this story index instead of the epic.
    #[arg(long)]
    pub story: Option<u32>,

    /// Product name, used for the epic's subject-based fallback lookup.
    #[arg(long, default_value = "")]
    pub product: String,

    /// Skip the identity cache and resolve by remote lookup only.
    #[arg(long)]
    pub ignore_cache: bool,
}

impl ResolveArgs {
    pub fn run(self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;
        let runtime = crate::runtime()?;
        runtime.block_on(self.execute(&config))
    }

    async fn execute(&self, config: &Config) -> Result<()> {
        let tracker = config.tracker()?;
        let mut tracker_config = TrackerConfig::new(&tracker.base_url, config.api_token()?);
        tracker_config.timeout_secs = tracker.timeout_secs;
        let api = Arc::new(HttpTracker::new(tracker_config)?);

        let fieldmap = FieldMap::load(&config.fieldmap_path)?;
        let store = Arc::new(StateStore::open(&config.data_dir));
        let resolver = IdentityResolver::new(
            api,
            store,
            fieldmap.order_id_field().map(|spec| spec.remote_id.clone()),
        );

        let project = ProjectKey::from(self.project.as_str());
        let order = OrderId::from(self.order.as_str());
        let key = match self.story {
            Some(index) => IdentityKey::story(order, index),
            None => IdentityKey::epic(order),
        };
        let subject = subject_for(&key, &self.product);

        match resolver
            .resolve(&project, &key, &subject, self.ignore_cache)
            .await
        {
            Ok(Resolution::Found { item }) => {
                println!("found: {} (subject '{}')", item.id, item.subject);
            }
            Ok(Resolution::FoundStale { dropped }) => {
                println!("stale: cached identifier {dropped} was dropped; no remote replacement");
            }
            Ok(Resolution::NotFound) => {
                println!("not found: no identity anywhere; a run would create it");
            }
            Err(err) => {
                println!("resolution failed: {err}");
            }
        }
        Ok(())
    }
}
