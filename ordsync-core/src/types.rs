//! Domain types for the ordsync engine.
//!
//! Raw rows and grouped order records are immutable once read; plan types are
//! the compiled, in-memory desired state for one order. All types are
//! serializable via serde.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed, globally unique order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for OrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed key for a target tracker project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectKey(pub String);

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ProjectKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProjectKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// The remote tracker's identifier for a created item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteId(pub String);

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RemoteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The two tracker item kinds the engine manages: one epic per order, one
/// story per line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Epic,
    Story,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Epic => write!(f, "epic"),
            ItemKind::Story => write!(f, "story"),
        }
    }
}

/// A canonicalized field value as sent to (or read from) the remote tracker.
///
/// `Ref` carries both the structured reference the remote API requires for
/// select-type fields and the canonical label it stands for, so a value read
/// back canonicalizes to the same logical value it was written from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldValue {
    Text { value: String },
    Number { value: f64 },
    Ref { reference: String, label: String },
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text {
            value: value.into(),
        }
    }

    pub fn number(value: f64) -> Self {
        FieldValue::Number { value }
    }

    pub fn option_ref(reference: impl Into<String>, label: impl Into<String>) -> Self {
        FieldValue::Ref {
            reference: reference.into(),
            label: label.into(),
        }
    }

    /// Whether this value represents "no value". Blank text and an absent
    /// entry must be treated identically by hashing and diffing.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Text { value } => value.trim().is_empty(),
            FieldValue::Number { .. } => false,
            FieldValue::Ref { reference, .. } => reference.trim().is_empty(),
        }
    }
}

/// Equality with empty-value equivalence: two absent/blank representations
/// compare equal regardless of shape.
pub fn values_equal(a: Option<&FieldValue>, b: Option<&FieldValue>) -> bool {
    let a_blank = a.map(FieldValue::is_blank).unwrap_or(true);
    let b_blank = b.map(FieldValue::is_blank).unwrap_or(true);
    if a_blank && b_blank {
        return true;
    }
    match (a, b) {
        (Some(FieldValue::Text { value: x }), Some(FieldValue::Text { value: y })) => {
            x.trim() == y.trim()
        }
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Source records
// ---------------------------------------------------------------------------

/// One raw row from the record store. Order-level and line-level fields
/// arrive together; the reader groups rows into [`OrderRecord`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub order_id: String,
    pub product: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_index: Option<u32>,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// A line item within an order. The sequence index is 1-based and unique
/// within the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub index: u32,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// One order as read from the record store, immutable for the duration of a
/// run. Order-level fields hold the first non-empty value seen across the
/// order's rows; `recorded_at` is the latest row timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: OrderId,
    pub product: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub lines: Vec<LineItem>,
}

// ---------------------------------------------------------------------------
// Compiled plans
// ---------------------------------------------------------------------------

/// Desired state for an order's epic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpicPlan {
    pub subject: String,
    pub description: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

/// Desired state for one line item's story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryPlan {
    pub index: u32,
    pub subject: String,
    pub description: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

/// The compiled desired tracker state for one order: its epic plus its
/// stories in line-item order. Pure data; created per changed order and
/// discarded within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanBundle {
    pub project: ProjectKey,
    pub order_id: OrderId,
    pub epic: EpicPlan,
    pub stories: Vec<StoryPlan>,
}

impl PlanBundle {
    /// Deterministic epic subject for an order: `"{product} :: {order}"`.
    pub fn epic_subject(product: &str, order: &OrderId) -> String {
        format!("{product} :: {order}")
    }

    /// Deterministic story subject for a line item: `"{order}-{index}"`.
    pub fn story_subject(order: &OrderId, index: u32) -> String {
        format!("{order}-{index}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(OrderId::from("O-100").to_string(), "O-100");
        assert_eq!(ProjectKey::from("P1").to_string(), "P1");
        assert_eq!(RemoteId::from("wp-42").to_string(), "wp-42");
    }

    #[test]
    fn newtype_equality() {
        let a = OrderId::from("x");
        let b = OrderId::from(String::from("x"));
        assert_eq!(a, b);
    }

    #[test]
    fn blank_representations_compare_equal() {
        let empty = FieldValue::text("");
        let spaces = FieldValue::text("   ");
        assert!(values_equal(Some(&empty), None));
        assert!(values_equal(None, Some(&spaces)));
        assert!(values_equal(None, None));
    }

    #[test]
    fn text_equality_ignores_surrounding_whitespace() {
        let a = FieldValue::text("Acme ");
        let b = FieldValue::text(" Acme");
        assert!(values_equal(Some(&a), Some(&b)));
    }

    #[test]
    fn ref_values_compare_by_reference_and_label() {
        let a = FieldValue::option_ref("/options/7", "Approved");
        let b = FieldValue::option_ref("/options/7", "Approved");
        let c = FieldValue::option_ref("/options/8", "Rejected");
        assert!(values_equal(Some(&a), Some(&b)));
        assert!(!values_equal(Some(&a), Some(&c)));
    }

    #[test]
    fn deterministic_subjects() {
        let order = OrderId::from("O-100");
        assert_eq!(PlanBundle::epic_subject("Acme", &order), "Acme :: O-100");
        assert_eq!(PlanBundle::story_subject(&order, 3), "O-100-3");
    }

    #[test]
    fn plan_bundle_serde_roundtrip() {
        let bundle = PlanBundle {
            project: ProjectKey::from("P1"),
            order_id: OrderId::from("O-1"),
            epic: EpicPlan {
                subject: "Acme :: O-1".into(),
                description: String::new(),
                fields: BTreeMap::new(),
            },
            stories: vec![],
        };
        let json = serde_yaml::to_string(&bundle).expect("serialize");
        let back: PlanBundle = serde_yaml::from_str(&json).expect("deserialize");
        assert_eq!(bundle, back);
    }
}
