//! Run report: per-order and aggregate outcomes of one reconciliation run.
//!
//! The report is the engine's contract with the external reporting and
//! notification collaborators; everything is serde-serializable. Every
//! apply call lands in exactly one tagged disposition — nothing is
//! silently dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;

use ordsync_client::ApiError;
use ordsync_core::types::{ItemKind, OrderId, ProjectKey, RemoteId};

/// Where in the apply sequence a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStage {
    Resolve,
    CreateEpic,
    UpdateEpic,
    CreateStory,
    UpdateStory,
    Commit,
}

/// A per-order failure with enough detail to drive manual remediation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderFailure {
    pub stage: ApplyStage,
    pub reason: String,
    /// The offending field, when the remote named one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl OrderFailure {
    pub fn from_api(stage: ApplyStage, err: &ApiError) -> Self {
        let field = match err {
            ApiError::Validation { field, .. } => field.clone(),
            _ => None,
        };
        Self {
            stage,
            reason: err.to_string(),
            field,
        }
    }
}

/// What happened to one planned item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemDisposition {
    Created,
    Updated,
    Unchanged,
    /// Dry-run: the item would have been created.
    WouldCreate,
    /// Dry-run: the item would have been updated.
    WouldUpdate,
}

/// Outcome of one epic or story apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub kind: ItemKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RemoteId>,
    pub disposition: ItemDisposition,
    /// Remote field ids touched by an update.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patched_fields: Vec<String>,
}

/// Outcome of one order's full bundle apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderOutcome {
    pub order: OrderId,
    /// Whether identities + fingerprint + checkpoint were committed.
    pub committed: bool,
    pub retries: u32,
    pub items: Vec<ItemOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<OrderFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl OrderOutcome {
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    fn count(&self, disposition: ItemDisposition) -> usize {
        self.items
            .iter()
            .filter(|i| i.disposition == disposition)
            .count()
    }
}

/// Per-product section of the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductReport {
    pub product: String,
    /// `None` when the product has no project mapping (the whole group was
    /// skipped with a warning).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectKey>,
    pub orders_seen: usize,
    pub changed: usize,
    pub unchanged: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub orders: Vec<OrderOutcome>,
}

/// Aggregate counters across the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub orders: usize,
    pub changed: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged_items: usize,
    pub warnings: usize,
    pub failures: usize,
    pub retries: u32,
}

/// The full run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Raw rows dropped for having a blank order identifier.
    pub skipped_rows: usize,
    pub products: Vec<ProductReport>,
    pub totals: Totals,
}

impl RunReport {
    /// Timestamp-derived run identifier.
    pub fn new_run_id(started_at: DateTime<Utc>) -> String {
        started_at.format("%Y%m%dT%H%M%SZ").to_string()
    }

    /// Recompute aggregate totals from the per-product sections.
    pub fn compute_totals(&mut self) {
        let mut totals = Totals::default();
        for product in &self.products {
            totals.orders += product.orders_seen;
            totals.changed += product.changed;
            totals.warnings += product.warnings.len();
            for order in &product.orders {
                totals.created += order.count(ItemDisposition::Created);
                totals.updated += order.count(ItemDisposition::Updated);
                totals.unchanged_items += order.count(ItemDisposition::Unchanged);
                totals.warnings += order.warnings.len();
                totals.retries += order.retries;
                if order.is_failure() {
                    totals.failures += 1;
                }
            }
        }
        self.totals = totals;
    }

    /// Compact one-paragraph summary for logs and notification bodies.
    pub fn summary_text(&self) -> String {
        let mode = if self.dry_run { "dry-run" } else { "online" };
        let mut lines = vec![
            format!("Reconciliation {} mode={mode}", self.run_id),
            format!(
                "Totals: orders={} changed={} created={} updated={} unchanged={} warnings={} failures={} retries={}",
                self.totals.orders,
                self.totals.changed,
                self.totals.created,
                self.totals.updated,
                self.totals.unchanged_items,
                self.totals.warnings,
                self.totals.failures,
                self.totals.retries,
            ),
        ];
        for product in &self.products {
            let project = product
                .project
                .as_ref()
                .map(|p| p.0.as_str())
                .unwrap_or("unmapped");
            lines.push(format!(
                "- {} [{}]: orders={} changed={} warnings={} failures={}",
                product.product,
                project,
                product.orders_seen,
                product.changed,
                product.warnings.len() + product
                    .orders
                    .iter()
                    .map(|o| o.warnings.len())
                    .sum::<usize>(),
                product.orders.iter().filter(|o| o.is_failure()).count(),
            ));
        }
        for product in &self.products {
            for order in &product.orders {
                if let Some(failure) = &order.failure {
                    lines.push(format!(
                        "  ! {} stage={:?} reason={}{}",
                        order.order,
                        failure.stage,
                        failure.reason,
                        failure
                            .field
                            .as_ref()
                            .map(|f| format!(" field={f}"))
                            .unwrap_or_default(),
                    ));
                }
            }
        }
        lines.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
