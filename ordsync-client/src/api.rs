//! Tracker API surface consumed by the engine.
//!
//! The trait is intentionally narrow: fetch one item, create, update with a
//! lock version, and the two identity lookups the resolver needs. Retry and
//! backoff live in the caller; implementations classify errors and return.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ordsync_core::types::{FieldValue, ItemKind, ProjectKey, RemoteId};

use crate::error::ApiError;

/// Current remote state of one tracker item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: RemoteId,
    pub kind: ItemKind,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    /// Optimistic-concurrency token; echoed back on update.
    pub lock_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RemoteId>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

/// Payload for creating a new item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub kind: ItemKind,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RemoteId>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

/// Minimal update payload: only fields that actually changed. Sending
/// unchanged fields risks re-triggering remote workflow transitions and
/// wastes rate-limit budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        self.subject.is_none() && self.description.is_none() && self.fields.is_empty()
    }
}

/// The remote tracker API.
#[async_trait]
pub trait TrackerApi: Send + Sync {
    /// Cheap reachability probe against a project. A transient failure
    /// here means the tracker is unreachable and the run should abort
    /// before any order is touched.
    async fn check_access(&self, project: &ProjectKey) -> Result<(), ApiError>;

    /// Fetch current state for a known identifier. Returns
    /// [`ApiError::Gone`] when the item no longer exists.
    async fn fetch(&self, id: &RemoteId) -> Result<RemoteItem, ApiError>;

    /// Create an item in a project; returns the created item with its
    /// assigned identifier.
    async fn create(&self, project: &ProjectKey, draft: ItemDraft) -> Result<RemoteItem, ApiError>;

    /// Apply a field patch to an existing item. `lock_version` must match
    /// the remote's current value or the call fails with
    /// [`ApiError::Conflict`].
    async fn update(
        &self,
        id: &RemoteId,
        patch: ItemPatch,
        lock_version: u64,
    ) -> Result<RemoteItem, ApiError>;

    /// Look an item up by an exact custom-field value (the order-identifier
    /// field). Returns the first match, if any.
    async fn find_by_field(
        &self,
        project: &ProjectKey,
        kind: ItemKind,
        field_id: &str,
        value: &str,
    ) -> Result<Option<RemoteItem>, ApiError>;

    /// Look an item up by its exact subject string.
    async fn find_by_subject(
        &self,
        project: &ProjectKey,
        kind: ItemKind,
        subject: &str,
    ) -> Result<Option<RemoteItem>, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_patch_is_empty() {
        assert!(ItemPatch::default().is_empty());
        let patch = ItemPatch {
            subject: Some("s".into()),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
