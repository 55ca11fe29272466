//! Product → project registry.
//!
//! Maps a product name (case-insensitive, punctuation-insensitive) to the
//! tracker project that owns its orders. Lookups for unknown products return
//! `None` rather than an error so callers can apply the warn-and-skip policy
//! per order.
//!
//! # File format
//!
//! ```yaml
//! registry:
//!   "Acme Fiber": P1
//!   "Acme-Fiber GmbH": P1
//!   "Nimbus": P2
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::RegistryError;
use crate::types::ProjectKey;

/// Normalized product name → project key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductRegistry {
    entries: BTreeMap<String, ProjectKey>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    registry: BTreeMap<String, String>,
}

/// Normalize a product name for lookup: trim, uppercase, collapse every run
/// of non-alphanumeric characters to a single underscore. `"Acme Fiber"` and
/// `"acme-fiber"` resolve to the same entry.
pub fn normalize_product(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_sep = false;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_uppercase());
            prev_sep = false;
        } else if !prev_sep {
            out.push('_');
            prev_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

impl ProductRegistry {
    /// Load the registry from a YAML file. Keys are normalized on load;
    /// entries with a blank project key are dropped.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        if !path.exists() {
            return Err(RegistryError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(path)?;
        let file: RegistryFile =
            serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;

        let mut entries = BTreeMap::new();
        for (raw, project) in file.registry {
            let project = project.trim();
            if project.is_empty() {
                continue;
            }
            entries.insert(normalize_product(&raw), ProjectKey::from(project));
        }
        Ok(Self { entries })
    }

    /// Build a registry from already-normalized pairs. Test helper and
    /// programmatic construction path.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, ProjectKey)>,
        S: AsRef<str>,
    {
        let entries = pairs
            .into_iter()
            .map(|(name, project)| (normalize_product(name.as_ref()), project))
            .collect();
        Self { entries }
    }

    /// Resolve the target project for a product, or `None` when unmapped.
    pub fn project_for(&self, product: &str) -> Option<&ProjectKey> {
        self.entries.get(&normalize_product(product))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case("Acme Fiber", "ACME_FIBER")]
    #[case("  acme-fiber  ", "ACME_FIBER")]
    #[case("acme -- fiber", "ACME_FIBER")]
    #[case("Nimbus", "NIMBUS")]
    #[case("", "")]
    fn normalization(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_product(raw), expected);
    }

    #[test]
    fn load_and_lookup_is_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.yaml");
        std::fs::write(
            &path,
            "registry:\n  \"Acme Fiber\": P1\n  \"Nimbus\": P2\n",
        )
        .unwrap();

        let reg = ProductRegistry::load(&path).expect("load");
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.project_for("acme fiber"), Some(&ProjectKey::from("P1")));
        assert_eq!(reg.project_for("ACME-FIBER"), Some(&ProjectKey::from("P1")));
        assert_eq!(reg.project_for("nimbus"), Some(&ProjectKey::from("P2")));
    }

    #[test]
    fn unmapped_product_returns_none() {
        let reg = ProductRegistry::from_pairs([("Acme", ProjectKey::from("P1"))]);
        assert_eq!(reg.project_for("Unknown Co"), None);
    }

    #[test]
    fn blank_project_entries_are_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.yaml");
        std::fs::write(&path, "registry:\n  \"Acme\": \"\"\n  \"Nimbus\": P2\n").unwrap();

        let reg = ProductRegistry::load(&path).expect("load");
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.project_for("Acme"), None);
    }

    #[test]
    fn missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = ProductRegistry::load(&tmp.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }
}
