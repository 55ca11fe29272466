//! Error types for ordsync-engine.
//!
//! Only run-fatal conditions surface here: the raw spool or the state store
//! being unreadable, or total connectivity loss probed at run start.
//! Per-order apply failures are recorded in the run report instead.

use std::path::PathBuf;

use thiserror::Error;

use ordsync_client::ApiError;
use ordsync_core::error::{FieldMapError, RegistryError};

/// All errors that can abort an engine run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An error from the product registry.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// An error from the field map.
    #[error("field map error: {0}")]
    FieldMap(#[from] FieldMapError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (state store, spool).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote tracker is unreachable at run start.
    #[error("remote tracker unreachable: {0}")]
    Unreachable(#[source] ApiError),
}

/// Convenience constructor for [`EngineError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}
