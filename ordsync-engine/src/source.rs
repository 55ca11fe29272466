//! Raw record reader.
//!
//! The ingestion side (external) drops one JSON batch file per upload into
//! a spool directory:
//!
//! ```text
//! <spool>/
//!   20240111T0800.json   (batch id = file stem)
//!   20240112T0800.json
//! ```
//!
//! Each file is a JSON array of [`SourceRow`]s. The reader scopes rows to a
//! run window or a single batch, then groups them into [`OrderRecord`]s:
//! order-level fields take the first non-empty value across the order's
//! rows, each row becomes one line item, and `recorded_at` is the latest
//! row timestamp. Rows with a blank order id are counted and skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use ordsync_core::types::{LineItem, OrderId, OrderRecord, SourceRow};

use crate::error::{io_err, EngineError};

/// Scope of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScope {
    /// Rows recorded within the trailing window.
    Window { since: chrono::Duration },
    /// Rows from a single named ingestion batch.
    Batch(String),
}

impl RunScope {
    /// Whether the scope is time-bounded (enables the checkpoint gate).
    pub fn is_windowed(&self) -> bool {
        matches!(self, RunScope::Window { .. })
    }
}

/// Source of raw order rows. The production implementation reads the spool
/// directory; tests substitute an in-memory source.
pub trait RecordSource: Send + Sync {
    /// Fetch all rows in scope. The result must be stable for the duration
    /// of one run.
    fn fetch(&self, scope: &RunScope) -> Result<Vec<SourceRow>, EngineError>;
}

/// Spool-directory implementation of [`RecordSource`].
pub struct JsonSpoolSource {
    spool_dir: PathBuf,
}

impl JsonSpoolSource {
    pub fn new(spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
        }
    }

    fn batch_path(&self, batch_id: &str) -> PathBuf {
        self.spool_dir.join(format!("{batch_id}.json"))
    }

    fn read_batch(&self, path: &Path) -> Result<Vec<SourceRow>, EngineError> {
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl RecordSource for JsonSpoolSource {
    fn fetch(&self, scope: &RunScope) -> Result<Vec<SourceRow>, EngineError> {
        match scope {
            RunScope::Batch(batch_id) => {
                let path = self.batch_path(batch_id);
                if !path.exists() {
                    tracing::warn!(batch_id, "batch file not found in spool");
                    return Ok(vec![]);
                }
                self.read_batch(&path)
            }
            RunScope::Window { since } => {
                let cutoff = Utc::now() - *since;
                if !self.spool_dir.exists() {
                    return Ok(vec![]);
                }
                let mut entries: Vec<_> = std::fs::read_dir(&self.spool_dir)
                    .map_err(|e| io_err(&self.spool_dir, e))?
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                    .collect();
                entries.sort_by_key(|e| e.file_name());

                let mut rows = Vec::new();
                for entry in entries {
                    for row in self.read_batch(&entry.path())? {
                        if row.recorded_at >= cutoff {
                            rows.push(row);
                        }
                    }
                }
                Ok(rows)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

/// Orders grouped under one product.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductGroup {
    pub product: String,
    pub orders: Vec<OrderRecord>,
}

/// Result of grouping raw rows, with the count of rows dropped for having
/// a blank order id.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedRows {
    pub products: Vec<ProductGroup>,
    pub skipped_rows: usize,
}

/// Group raw rows by product, then order. Deterministic output: products
/// and orders sorted by name/id, line items in row order (or by declared
/// line index when present).
pub fn group_rows(rows: Vec<SourceRow>) -> GroupedRows {
    let mut skipped = 0usize;
    // product -> order -> rows
    let mut by_product: BTreeMap<String, BTreeMap<String, Vec<SourceRow>>> = BTreeMap::new();
    for row in rows {
        let order_id = row.order_id.trim().to_string();
        if order_id.is_empty() {
            skipped += 1;
            continue;
        }
        by_product
            .entry(row.product.trim().to_string())
            .or_default()
            .entry(order_id)
            .or_default()
            .push(row);
    }

    let mut products = Vec::new();
    for (product, orders) in by_product {
        let mut records = Vec::new();
        for (order_id, mut rows) in orders {
            rows.sort_by_key(|r| (r.line_index.unwrap_or(u32::MAX), r.recorded_at));

            let recorded_at = rows
                .iter()
                .map(|r| r.recorded_at)
                .max()
                .unwrap_or_else(Utc::now);

            // Order-level fields: first non-empty value wins, so a sparse
            // later row cannot blank out an earlier value.
            let mut fields: BTreeMap<String, String> = BTreeMap::new();
            for row in &rows {
                for (name, value) in &row.fields {
                    let value = value.trim();
                    if value.is_empty() {
                        continue;
                    }
                    fields
                        .entry(name.clone())
                        .or_insert_with(|| value.to_string());
                }
            }

            let lines = rows
                .iter()
                .enumerate()
                .map(|(pos, row)| LineItem {
                    index: row.line_index.unwrap_or(pos as u32 + 1),
                    fields: row.fields.clone(),
                })
                .collect();

            records.push(OrderRecord {
                id: OrderId(order_id),
                product: product.clone(),
                recorded_at,
                fields,
                lines,
            });
        }
        products.push(ProductGroup {
            product,
            orders: records,
        });
    }

    GroupedRows {
        products,
        skipped_rows: skipped,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
