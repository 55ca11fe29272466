//! # ordsync-client
//!
//! Typed client for the remote tracker API. The engine consumes the
//! [`TrackerApi`] trait; [`HttpTracker`] is the production implementation.

pub mod api;
pub mod error;
pub mod http;

pub use api::{ItemDraft, ItemPatch, RemoteItem, TrackerApi};
pub use error::ApiError;
pub use http::{HttpTracker, TrackerConfig};
