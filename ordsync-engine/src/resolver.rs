//! Identity resolver: logical item → remote identifier.
//!
//! Resolution order:
//! 1. Identity cache (unless `ignore_cache`), verified by fetching the
//!    item's current state — the decision engine needs it anyway.
//! 2. Remote lookup by the dedicated order-identifier custom field.
//! 3. Remote lookup by the item's deterministic subject string.
//!
//! A cache hit pointing at a deleted remote item is not an error: the
//! mapping is dropped and resolution falls through to the remote lookups.
//! Callers branch on the tagged outcome explicitly.

use std::sync::Arc;

use ordsync_client::{ApiError, RemoteItem, TrackerApi};
use ordsync_core::types::{ItemKind, ProjectKey, RemoteId};

use crate::state::{IdentityKey, StateStore};

/// Outcome of resolving one logical item.
#[derive(Debug)]
pub enum Resolution {
    /// The item exists; current remote state attached.
    Found { item: RemoteItem },
    /// A cached identifier pointed at a remote item that is gone, and the
    /// remote lookups found no replacement. The item must be re-created.
    FoundStale { dropped: RemoteId },
    /// No identity anywhere. The item must be created.
    NotFound,
}

/// Resolves logical items against the identity cache with remote fallback.
pub struct IdentityResolver {
    api: Arc<dyn TrackerApi>,
    store: Arc<StateStore>,
    /// Remote id of the order-identifier custom field, when mapped.
    order_field_id: Option<String>,
}

impl IdentityResolver {
    pub fn new(
        api: Arc<dyn TrackerApi>,
        store: Arc<StateStore>,
        order_field_id: Option<String>,
    ) -> Self {
        Self {
            api,
            store,
            order_field_id,
        }
    }

    /// Resolve one logical item. `subject` is the item's deterministic
    /// subject string, used for the last-resort remote lookup.
    ///
    /// Transient API failures bubble up; the executor owns retry policy.
    pub async fn resolve(
        &self,
        project: &ProjectKey,
        key: &IdentityKey,
        subject: &str,
        ignore_cache: bool,
    ) -> Result<Resolution, ResolveError> {
        let mut dropped: Option<RemoteId> = None;

        if !ignore_cache {
            if let Some(id) = self.store.identity(project, key).await? {
                match self.api.fetch(&id).await {
                    Ok(item) => return Ok(Resolution::Found { item }),
                    Err(ApiError::Gone { .. }) => {
                        // Self-healing path: cached id no longer resolves.
                        tracing::info!(%project, key = %key, %id, "dropping stale identity mapping");
                        self.store.drop_identity(project, key).await?;
                        dropped = Some(id);
                    }
                    Err(err) => return Err(ResolveError::Api(err)),
                }
            }
        }

        if let Some(item) = self.lookup_remote(project, key, subject).await? {
            // Cache repair: found remotely but absent (or stale) locally.
            self.store.register_identity(project, key, &item.id).await?;
            return Ok(Resolution::Found { item });
        }

        match dropped {
            Some(dropped) => Ok(Resolution::FoundStale { dropped }),
            None => Ok(Resolution::NotFound),
        }
    }

    /// Drop a mapping reported stale by a failed write, then re-resolve.
    /// Used by the executor when a story's parent epic turns out to be
    /// gone mid-apply.
    pub async fn reresolve(
        &self,
        project: &ProjectKey,
        key: &IdentityKey,
        subject: &str,
    ) -> Result<Resolution, ResolveError> {
        self.store.drop_identity(project, key).await?;
        self.resolve(project, key, subject, true).await
    }

    async fn lookup_remote(
        &self,
        project: &ProjectKey,
        key: &IdentityKey,
        subject: &str,
    ) -> Result<Option<RemoteItem>, ResolveError> {
        // Epics are looked up by the order-identifier field; stories carry
        // the same order id, so their subject is the discriminating key.
        if key.kind == ItemKind::Epic {
            if let Some(field_id) = &self.order_field_id {
                let found = self
                    .api
                    .find_by_field(project, key.kind, field_id, &key.order.0)
                    .await?;
                if found.is_some() {
                    return Ok(found);
                }
            }
        }
        Ok(self
            .api
            .find_by_subject(project, key.kind, subject)
            .await?)
    }
}

/// Resolution failure: either the store or the remote API.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] crate::error::EngineError),
}

/// Deterministic subject for a logical item, shared by the compiler and the
/// resolver so independent resolution attempts always agree.
pub fn subject_for(key: &IdentityKey, product: &str) -> String {
    use ordsync_core::types::PlanBundle;
    match key.index {
        Some(index) => PlanBundle::story_subject(&key.order, index),
        None => PlanBundle::epic_subject(product, &key.order),
    }
}

// ---------------------------------------------------------------------------
// Tests live in tests/reconcile.rs against the in-memory tracker fake;
// resolution behavior needs a full store + API pair to be meaningful.
// ---------------------------------------------------------------------------
