//! Error types for ordsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from product registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error on load — includes file path and line context from serde_yaml.
    #[error("failed to parse registry at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The registry file did not exist at the expected path.
    #[error("registry not found at {path}")]
    NotFound { path: PathBuf },
}

/// All errors that can arise from field map operations.
#[derive(Debug, Error)]
pub enum FieldMapError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error on load.
    #[error("failed to parse field map at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The field map file did not exist at the expected path.
    #[error("field map not found at {path}")]
    NotFound { path: PathBuf },

    /// Two field specs claim the same remote identifier.
    #[error("duplicate remote field id '{remote_id}' (fields '{first}' and '{second}')")]
    DuplicateRemoteId {
        remote_id: String,
        first: String,
        second: String,
    },
}
