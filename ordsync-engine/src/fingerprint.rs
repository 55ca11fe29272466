//! Fingerprint and change detection.
//!
//! An order's fingerprint is the SHA-256 of its normalized source fields:
//! stable key order, values trimmed, empties dropped, so any two
//! representations of "no value" hash identically and cannot cause
//! spurious churn.
//!
//! Gates, in order:
//! 1. Force list — listed orders are always processed.
//! 2. Fingerprint — unchanged orders are excluded unconditionally.
//! 3. Checkpoint (windowed runs only) — the order's latest row must be
//!    newer than the stored last-processed timestamp.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::json;
use sha2::{Digest, Sha256};

use ordsync_core::types::{OrderId, OrderRecord};

use crate::state::ProjectMarks;

/// Compute the fingerprint of an order's normalized source fields.
pub fn order_fingerprint(record: &OrderRecord) -> String {
    let lines: Vec<_> = record
        .lines
        .iter()
        .map(|line| json!({ "index": line.index, "fields": normalize(&line.fields) }))
        .collect();
    let canonical = json!({
        "product": record.product.trim(),
        "fields": normalize(&record.fields),
        "lines": lines,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize(fields: &BTreeMap<String, String>) -> BTreeMap<&str, &str> {
    fields
        .iter()
        .filter_map(|(name, value)| {
            let value = value.trim();
            if value.is_empty() {
                None
            } else {
                Some((name.as_str(), value))
            }
        })
        .collect()
}

/// Outcome of change detection over one project's orders.
#[derive(Debug, Default)]
pub struct DetectOutcome {
    /// Changed orders paired with their freshly computed fingerprint.
    pub changed: Vec<(OrderRecord, String)>,
    pub unchanged: usize,
}

/// Partition a project's orders into changed and unchanged.
///
/// Read-only: fingerprints and checkpoints advance only after a successful
/// apply, never here.
pub fn detect_changed(
    records: Vec<OrderRecord>,
    marks: &ProjectMarks,
    force: &BTreeSet<OrderId>,
    windowed: bool,
) -> DetectOutcome {
    let mut outcome = DetectOutcome::default();
    for record in records {
        let fingerprint = order_fingerprint(&record);
        if force.contains(&record.id) {
            tracing::debug!(order = %record.id, "force list override");
            outcome.changed.push((record, fingerprint));
            continue;
        }

        let fingerprint_changed = marks.fingerprints.get(&record.id).map(String::as_str)
            != Some(fingerprint.as_str());
        if !fingerprint_changed {
            outcome.unchanged += 1;
            continue;
        }

        if windowed {
            if let Some(checkpoint) = marks.checkpoints.get(&record.id) {
                if record.recorded_at <= *checkpoint {
                    outcome.unchanged += 1;
                    continue;
                }
            }
        }

        outcome.changed.push((record, fingerprint));
    }
    outcome
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
