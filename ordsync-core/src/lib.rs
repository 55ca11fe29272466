//! # ordsync-core
//!
//! Domain types and read-only configuration for the ordsync reconciliation
//! engine: order records, field values, compiled plans, the product→project
//! registry, and the field map.

pub mod error;
pub mod fieldmap;
pub mod registry;
pub mod types;

pub use error::{FieldMapError, RegistryError};
pub use fieldmap::{FieldKind, FieldMap, FieldSpec};
pub use registry::ProductRegistry;
