//! Reconciliation pipeline: the canonical run entrypoint shared by the CLI
//! and any embedding process.
//!
//! Control flow per product group: registry lookup (warn-and-skip when
//! unmapped) → change detection → bundle compilation → apply through the
//! worker pool. One order's failure never aborts the run; only an
//! unreadable raw store or total tracker connectivity loss is fatal.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use ordsync_client::TrackerApi;
use ordsync_core::fieldmap::FieldMap;
use ordsync_core::registry::ProductRegistry;
use ordsync_core::types::OrderId;

use crate::compiler;
use crate::error::EngineError;
use crate::executor::{ApplyExecutor, ExecutorOptions, OrderWork, RetryPolicy};
use crate::fingerprint::detect_changed;
use crate::report::{ProductReport, RunReport, Totals};
use crate::resolver::IdentityResolver;
use crate::source::{group_rows, RecordSource};
use crate::state::StateStore;

pub use crate::source::RunScope;

/// Options for one reconciliation run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub scope: RunScope,
    /// Operational override: orders reprocessed regardless of fingerprint
    /// and checkpoint. Commit semantics are identical to naturally
    /// detected orders.
    pub force: BTreeSet<OrderId>,
    pub dry_run: bool,
    pub workers: usize,
    pub ignore_identity_cache: bool,
    pub retry: RetryPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            scope: RunScope::Window {
                since: chrono::Duration::days(7),
            },
            force: BTreeSet::new(),
            dry_run: true,
            workers: 5,
            ignore_identity_cache: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// The assembled engine.
pub struct Pipeline {
    source: Arc<dyn RecordSource>,
    registry: ProductRegistry,
    fieldmap: FieldMap,
    store: Arc<StateStore>,
    api: Arc<dyn TrackerApi>,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn RecordSource>,
        registry: ProductRegistry,
        fieldmap: FieldMap,
        store: Arc<StateStore>,
        api: Arc<dyn TrackerApi>,
    ) -> Self {
        Self {
            source,
            registry,
            fieldmap,
            store,
            api,
        }
    }

    /// Run one reconciliation pass. `cancel` is observed between orders;
    /// flip it to `true` to stop picking up new work while letting
    /// in-flight orders reach their commit point.
    pub async fn run(
        &self,
        opts: RunOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunReport, EngineError> {
        let started_at = Utc::now();
        let run_id = RunReport::new_run_id(started_at);
        tracing::info!(%run_id, dry_run = opts.dry_run, "reconciliation run starting");

        let rows = self.source.fetch(&opts.scope)?;
        let grouped = group_rows(rows);
        if grouped.skipped_rows > 0 {
            tracing::warn!(skipped = grouped.skipped_rows, "rows without an order id were skipped");
        }

        let resolver = Arc::new(IdentityResolver::new(
            self.api.clone(),
            self.store.clone(),
            self.fieldmap
                .order_id_field()
                .map(|spec| spec.remote_id.clone()),
        ));
        let executor = Arc::new(ApplyExecutor::new(
            self.api.clone(),
            self.store.clone(),
            resolver,
            ExecutorOptions {
                workers: opts.workers,
                dry_run: opts.dry_run,
                ignore_identity_cache: opts.ignore_identity_cache,
                retry: opts.retry.clone(),
            },
        ));

        // Connectivity probe before touching any order: a dead tracker is
        // fatal to the run, not a per-order failure. No checkpoint has been
        // committed yet, so re-running is safe.
        if !opts.dry_run {
            if let Some(project) = grouped
                .products
                .iter()
                .find_map(|group| compiler::assign_project(&self.registry, &group.product))
            {
                if let Err(err) = self.api.check_access(project).await {
                    if err.is_transient() {
                        return Err(EngineError::Unreachable(err));
                    }
                    tracing::warn!(%project, error = %err, "access probe failed; continuing");
                }
            }
        }

        let mut products = Vec::new();
        for group in grouped.products {
            if *cancel.borrow() {
                tracing::info!(product = %group.product, "run cancelled; remaining products skipped");
                break;
            }

            let orders_seen = group.orders.len();
            let Some(project) = compiler::assign_project(&self.registry, &group.product) else {
                tracing::warn!(product = %group.product, orders = orders_seen, "no project mapping; skipping product");
                products.push(ProductReport {
                    product: group.product.clone(),
                    project: None,
                    orders_seen,
                    changed: 0,
                    unchanged: 0,
                    warnings: vec![format!(
                        "no project mapping for product '{}' ({orders_seen} orders skipped)",
                        group.product,
                    )],
                    orders: vec![],
                });
                continue;
            };
            let project = project.clone();

            let marks = self.store.marks(&project).await?;
            let detected = detect_changed(group.orders, &marks, &opts.force, opts.scope.is_windowed());
            let changed = detected.changed.len();
            tracing::info!(product = %group.product, %project, orders = orders_seen, changed, "change detection complete");

            let mut warnings = Vec::new();
            let mut work = Vec::new();
            for (record, fingerprint) in detected.changed {
                match compiler::compile_order(&project, &record, &self.fieldmap) {
                    Ok(compiled) => work.push(OrderWork {
                        bundle: compiled.bundle,
                        fingerprint,
                        checkpoint: record.recorded_at,
                        warnings: compiled.warnings,
                    }),
                    Err(warning) => {
                        tracing::warn!(order = %record.id, %warning, "order not compiled");
                        warnings.push(warning);
                    }
                }
            }

            let orders = Arc::clone(&executor)
                .apply_project(&project, work, &cancel)
                .await;
            products.push(ProductReport {
                product: group.product,
                project: Some(project),
                orders_seen,
                changed,
                unchanged: detected.unchanged,
                warnings,
                orders,
            });
        }

        let mut report = RunReport {
            run_id,
            dry_run: opts.dry_run,
            started_at,
            finished_at: Utc::now(),
            skipped_rows: grouped.skipped_rows,
            products,
            totals: Totals::default(),
        };
        report.compute_totals();
        tracing::info!(
            created = report.totals.created,
            updated = report.totals.updated,
            failures = report.totals.failures,
            "reconciliation run finished"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests live in tests/reconcile.rs: pipeline behavior is only meaningful
// against a populated spool, store, and tracker fake.
// ---------------------------------------------------------------------------
