//! `ordsync status` — inspect the engine's durable state.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use ordsync_core::types::{OrderId, ProjectKey};
use ordsync_engine::state::StateStore;

use crate::config::Config;

/// Arguments for `ordsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Path to the config file (default: ~/.ordsync/config.yaml).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Restrict to one project.
    #[arg(long)]
    pub project: Option<String>,

    /// Show everything stored for one order (requires --project).
    #[arg(long, requires = "project")]
    pub order: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct OrderRow {
    project: String,
    order: String,
    identities: usize,
    fingerprint: Option<String>,
    checkpoint: Option<String>,
}

#[derive(Tabled)]
struct OrderTableRow {
    #[tabled(rename = "project")]
    project: String,
    #[tabled(rename = "order")]
    order: String,
    #[tabled(rename = "identities")]
    identities: usize,
    #[tabled(rename = "fingerprint")]
    fingerprint: String,
    #[tabled(rename = "checkpoint")]
    checkpoint: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;
        let runtime = crate::runtime()?;
        runtime.block_on(self.execute(&config))
    }

    async fn execute(&self, config: &Config) -> Result<()> {
        let store = StateStore::open(&config.data_dir);

        // Drill-down: one order's full stored state.
        if let (Some(project), Some(order)) = (&self.project, &self.order) {
            let state = store
                .order_state(&ProjectKey::from(project.as_str()), &OrderId::from(order.as_str()))
                .await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            return Ok(());
        }

        let projects = match &self.project {
            Some(project) => vec![ProjectKey::from(project.as_str())],
            None => list_projects(&config.data_dir)?,
        };

        let mut rows = Vec::new();
        for project in &projects {
            for order in store.orders(project).await? {
                let state = store.order_state(project, &order).await?;
                rows.push(OrderRow {
                    project: project.0.clone(),
                    order: order.0,
                    identities: state.identities.len(),
                    fingerprint: state.fingerprint.map(|h| h.chars().take(12).collect()),
                    checkpoint: state.checkpoint.map(|ts| ts.to_rfc3339()),
                });
            }
        }

        if self.json {
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(());
        }

        if rows.is_empty() {
            println!("No reconciliation state recorded.");
            return Ok(());
        }
        let table_rows: Vec<OrderTableRow> = rows
            .into_iter()
            .map(|row| OrderTableRow {
                project: row.project,
                order: row.order,
                identities: row.identities,
                fingerprint: row.fingerprint.unwrap_or_else(|| "-".into()),
                checkpoint: row.checkpoint.unwrap_or_else(|| "-".into()),
            })
            .collect();
        let mut table = Table::new(table_rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

/// Projects with a state document on disk.
fn list_projects(data_dir: &Path) -> Result<Vec<ProjectKey>> {
    let state_dir = data_dir.join("state");
    if !state_dir.exists() {
        return Ok(vec![]);
    }
    let mut projects: Vec<ProjectKey> = std::fs::read_dir(&state_dir)
        .with_context(|| format!("failed to read {}", state_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_suffix(".json").map(ProjectKey::from)
        })
        .collect();
    projects.sort();
    Ok(projects)
}
