//! Bundle compiler: one changed order → one plan bundle.
//!
//! Field assembly iterates the entire field map and classifies every
//! non-excluded field into exactly one transform path (passthrough,
//! number, date, or select canonicalization). No field can fall through
//! unclassified, for create and update alike.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;

use ordsync_core::fieldmap::{FieldKind, FieldMap, FieldSpec};
use ordsync_core::registry::ProductRegistry;
use ordsync_core::types::{EpicPlan, FieldValue, OrderRecord, PlanBundle, ProjectKey, StoryPlan};

/// A compiled order plus the per-field warnings produced while compiling it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledOrder {
    pub bundle: PlanBundle,
    pub warnings: Vec<String>,
}

/// Resolve the target project for a product. `None` means unmapped: the
/// caller records a per-order warning and skips the order entirely.
pub fn assign_project<'r>(
    registry: &'r ProductRegistry,
    product: &str,
) -> Option<&'r ProjectKey> {
    registry.project_for(product)
}

/// Compile one changed order into its desired tracker state.
///
/// Returns `Err` with a warning message when the order cannot be compiled
/// at all (a required field is absent); the caller skips the order and
/// records the warning, distinct from apply failures.
pub fn compile_order(
    project: &ProjectKey,
    record: &OrderRecord,
    fieldmap: &FieldMap,
) -> Result<CompiledOrder, String> {
    let mut warnings = Vec::new();

    let mut epic_fields = assemble_fields(record.id.0.as_str(), &record.fields, fieldmap, false, &mut warnings);
    ensure_order_identity(&mut epic_fields, record, fieldmap);

    for spec in fieldmap.iter() {
        if spec.required && spec.epic && !spec.write_excluded && !epic_fields.contains_key(&spec.remote_id) {
            return Err(format!(
                "order '{}' skipped: required field '{}' has no value",
                record.id, spec.name,
            ));
        }
    }

    let epic = EpicPlan {
        subject: PlanBundle::epic_subject(&record.product, &record.id),
        description: render_description(&record.fields),
        fields: epic_fields,
    };

    let mut stories = Vec::new();
    for line in &record.lines {
        // Line fields take precedence; order-level values fill the gaps so
        // a story never loses context its rows did not repeat.
        let mut merged = record.fields.clone();
        for (name, value) in &line.fields {
            if !value.trim().is_empty() {
                merged.insert(name.clone(), value.clone());
            }
        }
        let mut fields =
            assemble_fields(record.id.0.as_str(), &merged, fieldmap, true, &mut warnings);
        ensure_order_identity(&mut fields, record, fieldmap);

        stories.push(StoryPlan {
            index: line.index,
            subject: PlanBundle::story_subject(&record.id, line.index),
            description: render_description(&merged),
            fields,
        });
    }

    Ok(CompiledOrder {
        bundle: PlanBundle {
            project: project.clone(),
            order_id: record.id.clone(),
            epic,
            stories,
        },
        warnings,
    })
}

// ---------------------------------------------------------------------------
// Field assembly
// ---------------------------------------------------------------------------

fn assemble_fields(
    order_id: &str,
    source: &BTreeMap<String, String>,
    fieldmap: &FieldMap,
    story_scope: bool,
    warnings: &mut Vec<String>,
) -> BTreeMap<String, FieldValue> {
    let mut out = BTreeMap::new();
    for spec in fieldmap.iter() {
        if spec.write_excluded {
            continue;
        }
        if story_scope && !spec.story {
            continue;
        }
        if !story_scope && !spec.epic {
            continue;
        }
        let Some(raw) = lookup(source, &spec.name) else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match transform(spec, raw) {
            Transformed::Value(value) => {
                out.insert(spec.remote_id.clone(), value);
            }
            Transformed::Fallback { value, warning } => {
                warnings.push(format!("order '{order_id}': {warning}"));
                out.insert(spec.remote_id.clone(), value);
            }
            Transformed::Dropped { warning } => {
                warnings.push(format!("order '{order_id}': {warning}"));
            }
        }
    }
    out
}

enum Transformed {
    Value(FieldValue),
    Fallback { value: FieldValue, warning: String },
    Dropped { warning: String },
}

/// Apply the single transform a field's kind prescribes.
fn transform(spec: &FieldSpec, raw: &str) -> Transformed {
    match spec.kind {
        FieldKind::Text => Transformed::Value(FieldValue::text(raw)),
        FieldKind::Number => match parse_number(raw) {
            Some(n) => Transformed::Value(FieldValue::number(n)),
            None => Transformed::Dropped {
                warning: format!("field '{}' value '{raw}' is not numeric", spec.name),
            },
        },
        FieldKind::Date => match to_iso_date(raw) {
            Some(date) => Transformed::Value(FieldValue::text(date)),
            None => Transformed::Dropped {
                warning: format!("field '{}' value '{raw}' is not a date", spec.name),
            },
        },
        FieldKind::Select => match spec.canonical_label(raw) {
            Some(label) => match spec.option_reference(label) {
                Some(reference) => {
                    Transformed::Value(FieldValue::option_ref(reference, label))
                }
                // The remote accepts plain text for options without a
                // structured reference in the map.
                None => Transformed::Value(FieldValue::text(label)),
            },
            None => Transformed::Fallback {
                value: FieldValue::text(raw),
                warning: format!(
                    "field '{}' value '{raw}' is outside the mapped value domain",
                    spec.name,
                ),
            },
        },
    }
}

fn lookup<'a>(fields: &'a BTreeMap<String, String>, name: &str) -> Option<&'a String> {
    let needle = name.trim().to_lowercase();
    fields
        .iter()
        .find(|(key, _)| key.trim().to_lowercase() == needle)
        .map(|(_, value)| value)
}

/// Make sure the order-identifier custom field is always planned, so every
/// created item is findable by identity lookup later.
fn ensure_order_identity(
    fields: &mut BTreeMap<String, FieldValue>,
    record: &OrderRecord,
    fieldmap: &FieldMap,
) {
    if let Some(spec) = fieldmap.order_id_field() {
        fields
            .entry(spec.remote_id.clone())
            .or_insert_with(|| FieldValue::text(record.id.0.clone()));
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', "").trim().parse::<f64>().ok()
}

/// Normalize a source date to date-only ISO (`YYYY-MM-DD`). Timestamps are
/// truncated; unparsable values are rejected.
fn to_iso_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.to_string());
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive().to_string());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(ts.date().to_string());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%d/%m/%Y") {
        return Some(date.to_string());
    }
    None
}

/// Deterministic markdown rendering of a field map for item descriptions.
fn render_description(fields: &BTreeMap<String, String>) -> String {
    let mut lines = Vec::new();
    for (name, value) in fields {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        lines.push(format!("**{name}**: {value}"));
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
