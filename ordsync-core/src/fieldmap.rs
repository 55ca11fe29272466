//! Field map: logical field names → remote custom-field identifiers.
//!
//! Versioned, read-only input to the bundle compiler. Select-type fields
//! carry their value domain: canonical option labels mapped to the
//! structured references the remote API requires, plus lowercased aliases
//! for the spellings that appear in source data.
//!
//! # File format
//!
//! ```yaml
//! version: 3
//! fields:
//!   - name: "Order Status"
//!     remote_id: customField10
//!     kind: select
//!     story: true
//!     options:
//!       "Approved": "/api/v3/custom_options/41"
//!       "Rejected": "/api/v3/custom_options/42"
//!     aliases:
//!       "approve": "Approved"
//!   - name: "Customer"
//!     remote_id: customField5
//!     kind: text
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FieldMapError;

/// The transform class of a mapped field. Every field is classified into
/// exactly one; the compiler refuses to let any mapped field fall through
/// untransformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Number,
    Date,
    Select,
}

/// One logical field's mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Logical field name as it appears in source rows.
    pub name: String,
    /// Remote custom-field identifier (e.g. `customField10`).
    pub remote_id: String,
    #[serde(default)]
    pub kind: FieldKind,
    /// Field is known to the map but never written to the remote.
    #[serde(default)]
    pub write_excluded: bool,
    /// The remote rejects payloads without this field; orders missing it
    /// are skipped with a configuration warning instead of failing at
    /// apply time.
    #[serde(default)]
    pub required: bool,
    /// Field applies to the epic payload. On by default; line-item-level
    /// quantities and the like opt out.
    #[serde(default = "default_true")]
    pub epic: bool,
    /// Field also applies to stories (line items), not only the epic.
    #[serde(default)]
    pub story: bool,
    /// Canonical option label → remote option reference (select fields).
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Lowercased source spelling → canonical option label (select fields).
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl FieldSpec {
    /// Canonical option label for a raw source value: alias table first,
    /// then a case-insensitive match against the option labels themselves.
    /// Returns `None` when the value is not in the field's domain.
    pub fn canonical_label(&self, raw: &str) -> Option<&str> {
        let needle = raw.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        if let Some(label) = self.aliases.get(&needle) {
            return Some(label.as_str());
        }
        self.options
            .keys()
            .find(|label| label.trim().to_lowercase() == needle)
            .map(|label| label.as_str())
    }

    /// Remote option reference for a canonical label.
    pub fn option_reference(&self, label: &str) -> Option<&str> {
        self.options.get(label).map(|s| s.as_str())
    }
}

/// The full field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMap {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl FieldMap {
    /// Load the field map from a YAML file and validate remote-id uniqueness.
    pub fn load(path: &Path) -> Result<Self, FieldMapError> {
        if !path.exists() {
            return Err(FieldMapError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(path)?;
        let map: FieldMap = serde_yaml::from_str(&contents).map_err(|e| FieldMapError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        map.validate()?;
        Ok(map)
    }

    fn validate(&self) -> Result<(), FieldMapError> {
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for spec in &self.fields {
            if let Some(first) = seen.insert(spec.remote_id.as_str(), spec.name.as_str()) {
                return Err(FieldMapError::DuplicateRemoteId {
                    remote_id: spec.remote_id.clone(),
                    first: first.to_string(),
                    second: spec.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Look up a spec by logical name, case-insensitively.
    pub fn spec(&self, name: &str) -> Option<&FieldSpec> {
        let needle = name.trim().to_lowercase();
        self.fields
            .iter()
            .find(|spec| spec.name.trim().to_lowercase() == needle)
    }

    /// The spec that carries the order identifier, if the map declares one.
    /// Used by the resolver for identity lookups against the remote system.
    pub fn order_id_field(&self) -> Option<&FieldSpec> {
        self.spec("Order Id")
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
