//! Error taxonomy for tracker API calls.
//!
//! Every failed call is classified here so the apply executor can decide
//! retry behavior without inspecting HTTP internals: transient errors are
//! retried with backoff, conflicts trigger a re-diff, `Gone` drives the
//! stale-identity self-heal, and validation rejections fail immediately
//! with the offending field named.

use std::time::Duration;

use thiserror::Error;

use ordsync_core::types::RemoteId;

/// All errors a tracker API call can produce.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport failure (connect, timeout, TLS, decode).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote asked us to slow down (HTTP 429).
    #[error("rate limited by remote tracker")]
    RateLimited { retry_after: Option<Duration> },

    /// Remote-side failure (HTTP 5xx).
    #[error("remote tracker server error (status {status})")]
    Server { status: u16 },

    /// Optimistic-concurrency conflict (HTTP 409): the item changed since
    /// it was fetched.
    #[error("write conflict: item was modified concurrently")]
    Conflict,

    /// The item no longer exists remotely (HTTP 404 on a known identifier).
    #[error("remote item {id} is gone")]
    Gone { id: RemoteId },

    /// The remote rejected the payload (HTTP 422). Not retriable; `field`
    /// names the offending attribute when the response carries one.
    #[error("validation rejected{}: {message}", field_suffix(.field))]
    Validation {
        field: Option<String>,
        message: String,
    },

    /// Anything else the remote returned that we do not recognize.
    #[error("unexpected tracker response (status {status}): {message}")]
    Unexpected { status: u16, message: String },
}

fn field_suffix(field: &Option<String>) -> String {
    match field {
        Some(name) => format!(" (field '{name}')"),
        None => String::new(),
    }
}

impl ApiError {
    /// Whether the executor should retry this error with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Transport(_) | ApiError::RateLimited { .. } | ApiError::Server { .. }
        )
    }

    /// Suggested wait before the next attempt, when the remote provided one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
