//! Apply executor: drive create/update decisions against the remote
//! tracker.
//!
//! Orders are the unit of parallelism — a bounded worker pool fans out
//! across them, while epic-before-stories ordering is strictly sequential
//! within an order (stories reference their epic as parent). Per call:
//!
//! - transient errors retry with exponential backoff + jitter, honoring
//!   `Retry-After`, up to a bounded attempt count;
//! - write conflicts re-fetch, re-diff, and retry once;
//! - a stale identifier discovered mid-apply is dropped and re-resolved
//!   once via the resolver's self-healing path;
//! - validation rejections fail immediately, naming the offending field.
//!
//! Only after the whole bundle (epic + all stories) succeeds are the
//! order's identities, fingerprint, and checkpoint committed — in one
//! store write. A cancelled run stops picking up new orders; in-flight
//! orders run to their commit point.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use ordsync_client::api::{ItemDraft, ItemPatch, RemoteItem};
use ordsync_client::{ApiError, TrackerApi};
use ordsync_core::types::{FieldValue, ItemKind, PlanBundle, ProjectKey, RemoteId, StoryPlan};

use crate::diff::{self, Decision};
use crate::report::{ApplyStage, ItemDisposition, ItemOutcome, OrderFailure, OrderOutcome};
use crate::resolver::{IdentityResolver, Resolution, ResolveError};
use crate::state::{IdentityKey, StateStore};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Backoff tuning for transient tracker errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter, capped.
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let exp = self.backoff_base * 2u32.pow(exponent);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        (exp + jitter).min(self.backoff_cap)
    }
}

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Concurrency limit against the remote API — an explicit tunable, not
    /// per-CPU.
    pub workers: usize,
    pub dry_run: bool,
    /// Disaster-recovery override: skip the identity cache and resolve
    /// every item by remote lookup.
    pub ignore_identity_cache: bool,
    pub retry: RetryPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            workers: 5,
            dry_run: true,
            ignore_identity_cache: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// One order's unit of work: its compiled bundle plus the marks to commit
/// on success.
#[derive(Debug, Clone)]
pub struct OrderWork {
    pub bundle: PlanBundle,
    pub fingerprint: String,
    pub checkpoint: DateTime<Utc>,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct ApplyExecutor {
    api: Arc<dyn TrackerApi>,
    store: Arc<StateStore>,
    resolver: Arc<IdentityResolver>,
    opts: ExecutorOptions,
}

impl ApplyExecutor {
    pub fn new(
        api: Arc<dyn TrackerApi>,
        store: Arc<StateStore>,
        resolver: Arc<IdentityResolver>,
        opts: ExecutorOptions,
    ) -> Self {
        Self {
            api,
            store,
            resolver,
            opts,
        }
    }

    /// Apply all of a project's changed orders through the worker pool.
    /// Outcomes are returned sorted by order id.
    pub async fn apply_project(
        self: Arc<Self>,
        project: &ProjectKey,
        work: Vec<OrderWork>,
        cancel: &watch::Receiver<bool>,
    ) -> Vec<OrderOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.opts.workers.max(1)));
        let mut set = JoinSet::new();

        for order_work in work {
            // Cancellation is observed at order boundaries only.
            if *cancel.borrow() {
                tracing::info!(order = %order_work.bundle.order_id, "run cancelled; not starting order");
                continue;
            }
            let semaphore = semaphore.clone();
            let executor = Arc::clone(&self);
            let project = project.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");
                if *cancel.borrow() {
                    return None;
                }
                Some(executor.apply_order(&project, order_work).await)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(err) => tracing::error!(error = %err, "order apply task panicked"),
            }
        }
        outcomes.sort_by(|a, b| a.order.cmp(&b.order));
        outcomes
    }

    /// Apply one order's bundle: epic first, then its stories in sequence,
    /// then the atomic commit.
    pub(crate) async fn apply_order(&self, project: &ProjectKey, work: OrderWork) -> OrderOutcome {
        let order = work.bundle.order_id.clone();
        let mut items = Vec::new();
        let mut retries = 0u32;

        let mut epic_id = match self.apply_epic(project, &work.bundle, &mut retries).await {
            Ok((id, outcome)) => {
                items.push(outcome);
                id
            }
            Err(failure) => {
                return OrderOutcome {
                    order,
                    committed: false,
                    retries,
                    items,
                    failure: Some(failure),
                    warnings: work.warnings,
                };
            }
        };

        let mut story_ids: Vec<(u32, RemoteId)> = Vec::new();
        for story in &work.bundle.stories {
            match self
                .apply_story(project, &work.bundle, story, &mut epic_id, &mut retries)
                .await
            {
                Ok((id, outcome)) => {
                    if let Some(id) = id {
                        story_ids.push((story.index, id));
                    }
                    items.push(outcome);
                }
                Err(failure) => {
                    // Partial success must not advance fingerprint or
                    // checkpoint; the whole order retries next run.
                    return OrderOutcome {
                        order,
                        committed: false,
                        retries,
                        items,
                        failure: Some(failure),
                        warnings: work.warnings,
                    };
                }
            }
        }

        if self.opts.dry_run {
            return OrderOutcome {
                order,
                committed: false,
                retries,
                items,
                failure: None,
                warnings: work.warnings,
            };
        }

        let mut identities = Vec::new();
        if let Some(id) = &epic_id {
            identities.push((IdentityKey::epic(order.clone()), id.clone()));
        }
        for (index, id) in story_ids {
            identities.push((IdentityKey::story(order.clone(), index), id));
        }

        match self
            .store
            .commit_order(
                project,
                &order,
                &identities,
                &work.fingerprint,
                work.checkpoint,
            )
            .await
        {
            Ok(()) => OrderOutcome {
                order,
                committed: true,
                retries,
                items,
                failure: None,
                warnings: work.warnings,
            },
            Err(err) => OrderOutcome {
                order,
                committed: false,
                retries,
                items,
                failure: Some(OrderFailure {
                    stage: ApplyStage::Commit,
                    reason: err.to_string(),
                    field: None,
                }),
                warnings: work.warnings,
            },
        }
    }

    // -- epic ----------------------------------------------------------------

    async fn apply_epic(
        &self,
        project: &ProjectKey,
        bundle: &PlanBundle,
        retries: &mut u32,
    ) -> Result<(Option<RemoteId>, ItemOutcome), OrderFailure> {
        let key = IdentityKey::epic(bundle.order_id.clone());
        let resolution = self
            .resolve_with_retry(project, &key, &bundle.epic.subject, retries)
            .await?;

        match resolution {
            Resolution::Found { item } => {
                match diff::decide_epic(&bundle.epic, &item) {
                    Decision::NoOp => Ok((
                        Some(item.id.clone()),
                        item_outcome(ItemKind::Epic, None, Some(item.id), ItemDisposition::Unchanged, vec![]),
                    )),
                    Decision::Update { patch } => {
                        if self.opts.dry_run {
                            let patched = patched_field_names(&patch);
                            return Ok((
                                Some(item.id.clone()),
                                item_outcome(
                                    ItemKind::Epic,
                                    None,
                                    Some(item.id),
                                    ItemDisposition::WouldUpdate,
                                    patched,
                                ),
                            ));
                        }
                        match self
                            .update_item(&item, &bundle.epic.subject, &bundle.epic.fields, retries)
                            .await
                        {
                            Ok((updated, patched)) => Ok((
                                Some(updated.id.clone()),
                                item_outcome(
                                    ItemKind::Epic,
                                    None,
                                    Some(updated.id),
                                    ItemDisposition::Updated,
                                    patched,
                                ),
                            )),
                            Err(ApiError::Gone { .. }) => {
                                self.heal_epic(project, bundle, &key, retries).await
                            }
                            Err(err) => Err(OrderFailure::from_api(ApplyStage::UpdateEpic, &err)),
                        }
                    }
                    Decision::Create => unreachable!("decide never asks to create a found item"),
                }
            }
            Resolution::FoundStale { dropped } => {
                tracing::info!(order = %bundle.order_id, %dropped, "stale epic mapping healed; creating");
                self.create_epic(project, bundle, retries).await
            }
            Resolution::NotFound => self.create_epic(project, bundle, retries).await,
        }
    }

    async fn create_epic(
        &self,
        project: &ProjectKey,
        bundle: &PlanBundle,
        retries: &mut u32,
    ) -> Result<(Option<RemoteId>, ItemOutcome), OrderFailure> {
        if self.opts.dry_run {
            return Ok((
                None,
                item_outcome(ItemKind::Epic, None, None, ItemDisposition::WouldCreate, vec![]),
            ));
        }
        let draft = ItemDraft {
            kind: ItemKind::Epic,
            subject: bundle.epic.subject.clone(),
            description: bundle.epic.description.clone(),
            parent: None,
            fields: bundle.epic.fields.clone(),
        };
        let created = self
            .create_raw(project, draft, retries)
            .await
            .map_err(|e| OrderFailure::from_api(ApplyStage::CreateEpic, &e))?;
        Ok((
            Some(created.id.clone()),
            item_outcome(
                ItemKind::Epic,
                None,
                Some(created.id),
                ItemDisposition::Created,
                vec![],
            ),
        ))
    }

    /// The epic vanished between resolution and update. Re-resolve once;
    /// if the remote lookup finds a replacement, update that, otherwise
    /// create anew.
    async fn heal_epic(
        &self,
        project: &ProjectKey,
        bundle: &PlanBundle,
        key: &IdentityKey,
        retries: &mut u32,
    ) -> Result<(Option<RemoteId>, ItemOutcome), OrderFailure> {
        match self
            .resolver
            .reresolve(project, key, &bundle.epic.subject)
            .await
        {
            Ok(Resolution::Found { item }) => match diff::decide_epic(&bundle.epic, &item) {
                Decision::NoOp => Ok((
                    Some(item.id.clone()),
                    item_outcome(ItemKind::Epic, None, Some(item.id), ItemDisposition::Unchanged, vec![]),
                )),
                Decision::Update { .. } => {
                    let (updated, patched) = self
                        .update_item(&item, &bundle.epic.subject, &bundle.epic.fields, retries)
                        .await
                        .map_err(|e| OrderFailure::from_api(ApplyStage::UpdateEpic, &e))?;
                    Ok((
                        Some(updated.id.clone()),
                        item_outcome(
                            ItemKind::Epic,
                            None,
                            Some(updated.id),
                            ItemDisposition::Updated,
                            patched,
                        ),
                    ))
                }
                Decision::Create => unreachable!("decide never asks to create a found item"),
            },
            Ok(_) => self.create_epic(project, bundle, retries).await,
            Err(err) => Err(OrderFailure {
                stage: ApplyStage::UpdateEpic,
                reason: err.to_string(),
                field: None,
            }),
        }
    }

    // -- story ---------------------------------------------------------------

    async fn apply_story(
        &self,
        project: &ProjectKey,
        bundle: &PlanBundle,
        story: &StoryPlan,
        epic_id: &mut Option<RemoteId>,
        retries: &mut u32,
    ) -> Result<(Option<RemoteId>, ItemOutcome), OrderFailure> {
        let key = IdentityKey::story(bundle.order_id.clone(), story.index);
        let resolution = self
            .resolve_with_retry(project, &key, &story.subject, retries)
            .await?;

        match resolution {
            Resolution::Found { item } => match diff::decide_story(story, &item) {
                Decision::NoOp => Ok((
                    Some(item.id.clone()),
                    item_outcome(
                        ItemKind::Story,
                        Some(story.index),
                        Some(item.id),
                        ItemDisposition::Unchanged,
                        vec![],
                    ),
                )),
                Decision::Update { patch } => {
                    if self.opts.dry_run {
                        let patched = patched_field_names(&patch);
                        return Ok((
                            Some(item.id.clone()),
                            item_outcome(
                                ItemKind::Story,
                                Some(story.index),
                                Some(item.id),
                                ItemDisposition::WouldUpdate,
                                patched,
                            ),
                        ));
                    }
                    match self
                        .update_item(&item, &story.subject, &story.fields, retries)
                        .await
                    {
                        Ok((updated, patched)) => Ok((
                            Some(updated.id.clone()),
                            item_outcome(
                                ItemKind::Story,
                                Some(story.index),
                                Some(updated.id),
                                ItemDisposition::Updated,
                                patched,
                            ),
                        )),
                        Err(ApiError::Gone { .. }) => {
                            // Story deleted mid-run: one re-resolve, then create.
                            match self.resolver.reresolve(project, &key, &story.subject).await {
                                Ok(Resolution::Found { item }) => {
                                    let (updated, patched) = self
                                        .update_item(&item, &story.subject, &story.fields, retries)
                                        .await
                                        .map_err(|e| {
                                            OrderFailure::from_api(ApplyStage::UpdateStory, &e)
                                        })?;
                                    Ok((
                                        Some(updated.id.clone()),
                                        item_outcome(
                                            ItemKind::Story,
                                            Some(story.index),
                                            Some(updated.id),
                                            ItemDisposition::Updated,
                                            patched,
                                        ),
                                    ))
                                }
                                Ok(_) => self.create_story(project, bundle, story, epic_id, retries).await,
                                Err(err) => Err(OrderFailure {
                                    stage: ApplyStage::UpdateStory,
                                    reason: err.to_string(),
                                    field: None,
                                }),
                            }
                        }
                        Err(err) => Err(OrderFailure::from_api(ApplyStage::UpdateStory, &err)),
                    }
                }
                Decision::Create => unreachable!("decide never asks to create a found item"),
            },
            Resolution::FoundStale { .. } | Resolution::NotFound => {
                self.create_story(project, bundle, story, epic_id, retries).await
            }
        }
    }

    async fn create_story(
        &self,
        project: &ProjectKey,
        bundle: &PlanBundle,
        story: &StoryPlan,
        epic_id: &mut Option<RemoteId>,
        retries: &mut u32,
    ) -> Result<(Option<RemoteId>, ItemOutcome), OrderFailure> {
        if self.opts.dry_run {
            return Ok((
                None,
                item_outcome(
                    ItemKind::Story,
                    Some(story.index),
                    None,
                    ItemDisposition::WouldCreate,
                    vec![],
                ),
            ));
        }

        let draft = ItemDraft {
            kind: ItemKind::Story,
            subject: story.subject.clone(),
            description: story.description.clone(),
            parent: epic_id.clone(),
            fields: story.fields.clone(),
        };

        let created = match self.create_raw(project, draft.clone(), retries).await {
            Ok(created) => created,
            Err(ApiError::Gone { .. }) => {
                // Missing parent: the epic id went stale after its apply.
                // Drop the mapping, re-resolve once, retry the create.
                let epic_key = IdentityKey::epic(bundle.order_id.clone());
                match self
                    .resolver
                    .reresolve(project, &epic_key, &bundle.epic.subject)
                    .await
                {
                    Ok(Resolution::Found { item }) => {
                        tracing::info!(order = %bundle.order_id, parent = %item.id, "re-resolved stale parent epic");
                        *epic_id = Some(item.id.clone());
                        let retried = ItemDraft {
                            parent: Some(item.id),
                            ..draft
                        };
                        self.create_raw(project, retried, retries)
                            .await
                            .map_err(|e| OrderFailure::from_api(ApplyStage::CreateStory, &e))?
                    }
                    Ok(_) => {
                        return Err(OrderFailure {
                            stage: ApplyStage::CreateStory,
                            reason: format!(
                                "parent epic for order '{}' no longer exists remotely",
                                bundle.order_id,
                            ),
                            field: None,
                        });
                    }
                    Err(err) => {
                        return Err(OrderFailure {
                            stage: ApplyStage::CreateStory,
                            reason: err.to_string(),
                            field: None,
                        });
                    }
                }
            }
            Err(err) => return Err(OrderFailure::from_api(ApplyStage::CreateStory, &err)),
        };

        Ok((
            Some(created.id.clone()),
            item_outcome(
                ItemKind::Story,
                Some(story.index),
                Some(created.id),
                ItemDisposition::Created,
                vec![],
            ),
        ))
    }

    // -- call plumbing -------------------------------------------------------

    async fn resolve_with_retry(
        &self,
        project: &ProjectKey,
        key: &IdentityKey,
        subject: &str,
        retries: &mut u32,
    ) -> Result<Resolution, OrderFailure> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .resolver
                .resolve(project, key, subject, self.opts.ignore_identity_cache)
                .await
            {
                Ok(resolution) => return Ok(resolution),
                Err(ResolveError::Api(err))
                    if err.is_transient() && attempt < self.opts.retry.max_attempts =>
                {
                    *retries += 1;
                    let delay = self.backoff_delay(&err, attempt);
                    tracing::warn!(key = %key, attempt, error = %err, "transient error during resolve; backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(OrderFailure {
                        stage: ApplyStage::Resolve,
                        reason: err.to_string(),
                        field: None,
                    });
                }
            }
        }
    }

    async fn create_raw(
        &self,
        project: &ProjectKey,
        draft: ItemDraft,
        retries: &mut u32,
    ) -> Result<RemoteItem, ApiError> {
        let api = self.api.clone();
        let project = project.clone();
        self.retry_call(retries, move || {
            let api = api.clone();
            let project = project.clone();
            let draft = draft.clone();
            async move { api.create(&project, draft).await }
        })
        .await
    }

    /// Update with conflict handling: on a write conflict, re-fetch,
    /// recompute the diff against the fresh state, and retry once. Returns
    /// the updated item plus the names of the fields actually patched.
    async fn update_item(
        &self,
        current: &RemoteItem,
        subject: &str,
        desired: &BTreeMap<String, FieldValue>,
        retries: &mut u32,
    ) -> Result<(RemoteItem, Vec<String>), ApiError> {
        let patch = diff::patch_against(subject, desired, current);
        if patch.is_empty() {
            return Ok((current.clone(), vec![]));
        }
        let patched = patched_field_names(&patch);

        match self
            .update_raw(&current.id, patch, current.lock_version, retries)
            .await
        {
            Ok(updated) => Ok((updated, patched)),
            Err(ApiError::Conflict) => {
                tracing::info!(id = %current.id, "write conflict; re-fetching and re-diffing");
                let fresh = self.fetch_raw(&current.id, retries).await?;
                let patch = diff::patch_against(subject, desired, &fresh);
                if patch.is_empty() {
                    // The concurrent writer already brought the item to the
                    // desired state.
                    return Ok((fresh, vec![]));
                }
                let patched = patched_field_names(&patch);
                let updated = self
                    .update_raw(&fresh.id, patch, fresh.lock_version, retries)
                    .await?;
                Ok((updated, patched))
            }
            Err(err) => Err(err),
        }
    }

    async fn update_raw(
        &self,
        id: &RemoteId,
        patch: ItemPatch,
        lock_version: u64,
        retries: &mut u32,
    ) -> Result<RemoteItem, ApiError> {
        let api = self.api.clone();
        let id = id.clone();
        self.retry_call(retries, move || {
            let api = api.clone();
            let id = id.clone();
            let patch = patch.clone();
            async move { api.update(&id, patch, lock_version).await }
        })
        .await
    }

    async fn fetch_raw(&self, id: &RemoteId, retries: &mut u32) -> Result<RemoteItem, ApiError> {
        let api = self.api.clone();
        let id = id.clone();
        self.retry_call(retries, move || {
            let api = api.clone();
            let id = id.clone();
            async move { api.fetch(&id).await }
        })
        .await
    }

    /// Bounded retry loop for transient errors only. Everything else is
    /// returned to the caller for classification.
    async fn retry_call<T, F, Fut>(&self, retries: &mut u32, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.opts.retry.max_attempts => {
                    *retries += 1;
                    let delay = self.backoff_delay(&err, attempt);
                    tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient tracker error; backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_delay(&self, err: &ApiError, attempt: u32) -> Duration {
        match err.retry_after() {
            Some(hinted) => hinted.min(self.opts.retry.backoff_cap),
            None => self.opts.retry.delay(attempt),
        }
    }
}

fn item_outcome(
    kind: ItemKind,
    index: Option<u32>,
    id: Option<RemoteId>,
    disposition: ItemDisposition,
    patched_fields: Vec<String>,
) -> ItemOutcome {
    ItemOutcome {
        kind,
        index,
        id,
        disposition,
        patched_fields,
    }
}

fn patched_field_names(patch: &ItemPatch) -> Vec<String> {
    let mut names = Vec::new();
    if patch.subject.is_some() {
        names.push("subject".to_string());
    }
    names.extend(patch.fields.keys().cloned());
    names
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
