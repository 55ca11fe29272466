//! End-to-end reconciliation behavior against an in-memory tracker.
//!
//! The fake tracker honors the same contract as the HTTP client: lock
//! versions, gone items, parent checks on story creation, and injectable
//! faults for validation, server errors, and write conflicts.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::watch;

use ordsync_client::api::{ItemDraft, ItemPatch, RemoteItem, TrackerApi};
use ordsync_client::ApiError;
use ordsync_core::fieldmap::FieldMap;
use ordsync_core::registry::ProductRegistry;
use ordsync_core::types::{FieldValue, ItemKind, OrderId, ProjectKey, RemoteId, SourceRow};
use ordsync_engine::executor::RetryPolicy;
use ordsync_engine::pipeline::{Pipeline, RunOptions, RunScope};
use ordsync_engine::report::{ApplyStage, ItemDisposition, RunReport};
use ordsync_engine::source::JsonSpoolSource;
use ordsync_engine::state::{IdentityKey, StateStore};

// ---------------------------------------------------------------------------
// Fake tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Calls {
    creates: u32,
    updates: u32,
    fetches: u32,
    searches: u32,
}

enum Fault {
    /// Reject the payload outright, naming a field.
    Validation { field: String },
    /// Serve this many 503s before behaving again.
    Server { remaining: u32 },
}

#[derive(Default)]
struct FakeTracker {
    items: Mutex<HashMap<RemoteId, (ProjectKey, RemoteItem)>>,
    next_id: AtomicU64,
    calls: Mutex<Calls>,
    create_faults: Mutex<HashMap<String, Fault>>,
    conflict_once: Mutex<HashSet<RemoteId>>,
}

impl FakeTracker {
    fn calls(&self) -> Calls {
        *self.calls.lock().unwrap()
    }

    fn count_kind(&self, kind: ItemKind) -> usize {
        self.items
            .lock()
            .unwrap()
            .values()
            .filter(|(_, item)| item.kind == kind)
            .count()
    }

    fn item(&self, id: &RemoteId) -> Option<RemoteItem> {
        self.items
            .lock()
            .unwrap()
            .get(id)
            .map(|(_, item)| item.clone())
    }

    fn delete(&self, id: &RemoteId) -> bool {
        self.items.lock().unwrap().remove(id).is_some()
    }

    fn fail_create(&self, subject: &str, fault: Fault) {
        self.create_faults
            .lock()
            .unwrap()
            .insert(subject.to_string(), fault);
    }

    fn clear_create_faults(&self) {
        self.create_faults.lock().unwrap().clear();
    }

    fn conflict_next_update(&self, id: &RemoteId) {
        self.conflict_once.lock().unwrap().insert(id.clone());
    }

    fn stripped(fields: std::collections::BTreeMap<String, FieldValue>) -> std::collections::BTreeMap<String, FieldValue> {
        fields.into_iter().filter(|(_, v)| !v.is_blank()).collect()
    }
}

#[async_trait]
impl TrackerApi for FakeTracker {
    async fn check_access(&self, _project: &ProjectKey) -> Result<(), ApiError> {
        Ok(())
    }

    async fn fetch(&self, id: &RemoteId) -> Result<RemoteItem, ApiError> {
        self.calls.lock().unwrap().fetches += 1;
        self.item(id).ok_or_else(|| ApiError::Gone { id: id.clone() })
    }

    async fn create(&self, project: &ProjectKey, draft: ItemDraft) -> Result<RemoteItem, ApiError> {
        self.calls.lock().unwrap().creates += 1;

        let mut faults = self.create_faults.lock().unwrap();
        match faults.get_mut(&draft.subject) {
            Some(Fault::Validation { field }) => {
                return Err(ApiError::Validation {
                    field: Some(field.clone()),
                    message: "can't be blank".into(),
                });
            }
            Some(Fault::Server { remaining }) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ApiError::Server { status: 503 });
                }
            }
            None => {}
        }
        drop(faults);

        let mut items = self.items.lock().unwrap();
        if let Some(parent) = &draft.parent {
            if !items.contains_key(parent) {
                return Err(ApiError::Gone { id: parent.clone() });
            }
        }
        let id = RemoteId(format!("wp-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1));
        let item = RemoteItem {
            id: id.clone(),
            kind: draft.kind,
            subject: draft.subject,
            description: draft.description,
            lock_version: 0,
            parent: draft.parent,
            fields: Self::stripped(draft.fields),
        };
        items.insert(id, (project.clone(), item.clone()));
        Ok(item)
    }

    async fn update(
        &self,
        id: &RemoteId,
        patch: ItemPatch,
        lock_version: u64,
    ) -> Result<RemoteItem, ApiError> {
        self.calls.lock().unwrap().updates += 1;

        let mut items = self.items.lock().unwrap();
        let Some((_, item)) = items.get_mut(id) else {
            return Err(ApiError::Gone { id: id.clone() });
        };
        if self.conflict_once.lock().unwrap().remove(id) {
            // A concurrent writer got there first.
            item.lock_version += 1;
            return Err(ApiError::Conflict);
        }
        if item.lock_version != lock_version {
            return Err(ApiError::Conflict);
        }
        if let Some(subject) = patch.subject {
            item.subject = subject;
        }
        if let Some(description) = patch.description {
            item.description = description;
        }
        for (key, value) in Self::stripped(patch.fields) {
            item.fields.insert(key, value);
        }
        item.lock_version += 1;
        Ok(item.clone())
    }

    async fn find_by_field(
        &self,
        project: &ProjectKey,
        kind: ItemKind,
        field_id: &str,
        value: &str,
    ) -> Result<Option<RemoteItem>, ApiError> {
        self.calls.lock().unwrap().searches += 1;
        let items = self.items.lock().unwrap();
        let mut hits: Vec<&RemoteItem> = items
            .values()
            .filter(|(p, item)| {
                p == project
                    && item.kind == kind
                    && matches!(
                        item.fields.get(field_id),
                        Some(FieldValue::Text { value: v }) if v.trim() == value.trim()
                    )
            })
            .map(|(_, item)| item)
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hits.first().map(|item| (*item).clone()))
    }

    async fn find_by_subject(
        &self,
        project: &ProjectKey,
        kind: ItemKind,
        subject: &str,
    ) -> Result<Option<RemoteItem>, ApiError> {
        self.calls.lock().unwrap().searches += 1;
        let items = self.items.lock().unwrap();
        let mut hits: Vec<&RemoteItem> = items
            .values()
            .filter(|(p, item)| p == project && item.kind == kind && item.subject == subject)
            .map(|(_, item)| item)
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hits.first().map(|item| (*item).clone()))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn fieldmap() -> FieldMap {
    serde_yaml::from_str(
        r#"
version: 1
fields:
  - name: "Order Id"
    remote_id: customField2
    story: true
  - name: "Order Status"
    remote_id: customField10
    kind: select
    options:
      "Approved": "/opt/41"
      "Pending Acknowledgement": "/opt/40"
    aliases:
      "approve": "Approved"
  - name: "Customer"
    remote_id: customField5
  - name: "Quantity"
    remote_id: customField7
    kind: number
    epic: false
    story: true
"#,
    )
    .expect("fieldmap yaml")
}

fn registry() -> ProductRegistry {
    ProductRegistry::from_pairs([("Acme", ProjectKey::from("P1"))])
}

struct Harness {
    _tmp: TempDir,
    spool: PathBuf,
    state_root: PathBuf,
    fake: Arc<FakeTracker>,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let spool = tmp.path().join("spool");
        std::fs::create_dir_all(&spool).expect("spool dir");
        let state_root = tmp.path().join("data");
        Self {
            _tmp: tmp,
            spool,
            state_root,
            fake: Arc::new(FakeTracker::default()),
        }
    }

    fn pipeline(&self) -> Pipeline {
        self.pipeline_with_state(&self.state_root)
    }

    fn pipeline_with_state(&self, state_root: &Path) -> Pipeline {
        Pipeline::new(
            Arc::new(JsonSpoolSource::new(&self.spool)),
            registry(),
            fieldmap(),
            Arc::new(StateStore::open(state_root)),
            self.fake.clone(),
        )
    }

    fn store(&self) -> StateStore {
        StateStore::open(&self.state_root)
    }

    fn write_batch(&self, batch_id: &str, rows: &[SourceRow]) {
        std::fs::write(
            self.spool.join(format!("{batch_id}.json")),
            serde_json::to_string_pretty(rows).expect("serialize rows"),
        )
        .expect("write batch");
    }
}

fn acme_row(order: &str, line: u32, quantity: &str, status: &str) -> SourceRow {
    let mut fields = std::collections::BTreeMap::new();
    fields.insert("Customer".to_string(), "Globex".to_string());
    fields.insert("Order Status".to_string(), status.to_string());
    fields.insert("Quantity".to_string(), quantity.to_string());
    SourceRow {
        order_id: order.to_string(),
        product: "Acme".to_string(),
        line_index: Some(line),
        recorded_at: Utc::now(),
        fields,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(2),
    }
}

fn online(batch: &str) -> RunOptions {
    RunOptions {
        scope: RunScope::Batch(batch.to_string()),
        force: BTreeSet::new(),
        dry_run: false,
        workers: 2,
        ignore_identity_cache: false,
        retry: fast_retry(),
    }
}

fn cancel_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

async fn run(pipeline: &Pipeline, opts: RunOptions) -> RunReport {
    let (_tx, rx) = cancel_channel();
    pipeline.run(opts, rx).await.expect("run")
}

fn project() -> ProjectKey {
    ProjectKey::from("P1")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_run_creates_epic_and_stories_and_commits() {
    let h = Harness::new();
    h.write_batch(
        "b1",
        &[acme_row("O-100", 1, "2", "approve"), acme_row("O-100", 2, "1", "approve")],
    );

    let report = run(&h.pipeline(), online("b1")).await;
    assert_eq!(report.totals.created, 3, "one epic + two stories");
    assert_eq!(report.totals.failures, 0);
    assert_eq!(h.fake.count_kind(ItemKind::Epic), 1);
    assert_eq!(h.fake.count_kind(ItemKind::Story), 2);

    let outcome = &report.products[0].orders[0];
    assert!(outcome.committed);

    let state = h
        .store()
        .order_state(&project(), &OrderId::from("O-100"))
        .await
        .expect("state");
    assert!(state.fingerprint.is_some());
    assert!(state.checkpoint.is_some());
    assert!(state.identities.contains_key("O-100::epic"));
    assert!(state.identities.contains_key("O-100::story::1"));
    assert!(state.identities.contains_key("O-100::story::2"));

    // The epic carries the canonicalized status reference.
    let epic_id = state.identities.get("O-100::epic").unwrap();
    let epic = h.fake.item(epic_id).expect("epic exists");
    assert_eq!(
        epic.fields.get("customField10"),
        Some(&FieldValue::option_ref("/opt/41", "Approved")),
    );
}

#[tokio::test]
async fn second_run_on_unchanged_data_issues_zero_calls() {
    let h = Harness::new();
    h.write_batch("b1", &[acme_row("O-100", 1, "2", "approve")]);

    run(&h.pipeline(), online("b1")).await;
    let before = h.fake.calls();

    let report = run(&h.pipeline(), online("b1")).await;
    assert_eq!(report.totals.changed, 0);
    assert_eq!(report.totals.created, 0);
    assert_eq!(report.totals.updated, 0);
    assert_eq!(h.fake.calls(), before, "no tracker calls for unchanged data");
}

#[tokio::test]
async fn changed_quantity_updates_only_that_story_field() {
    let h = Harness::new();
    h.write_batch("b1", &[acme_row("O-100", 1, "2", "approve")]);
    run(&h.pipeline(), online("b1")).await;
    let before = h.fake.calls();

    h.write_batch("b2", &[acme_row("O-100", 1, "3", "approve")]);
    let report = run(&h.pipeline(), online("b2")).await;

    assert_eq!(report.totals.changed, 1);
    assert_eq!(report.totals.created, 0);
    assert_eq!(report.totals.updated, 1);

    let outcome = &report.products[0].orders[0];
    assert!(outcome.committed);
    let epic = outcome
        .items
        .iter()
        .find(|i| i.kind == ItemKind::Epic)
        .unwrap();
    assert_eq!(epic.disposition, ItemDisposition::Unchanged);
    let story = outcome
        .items
        .iter()
        .find(|i| i.kind == ItemKind::Story)
        .unwrap();
    assert_eq!(story.disposition, ItemDisposition::Updated);
    assert_eq!(story.patched_fields, vec!["customField7"]);

    let after = h.fake.calls();
    assert_eq!(after.creates, before.creates);
    assert_eq!(after.updates, before.updates + 1);

    let story_id = story.id.clone().unwrap();
    assert_eq!(
        h.fake.item(&story_id).unwrap().fields.get("customField7"),
        Some(&FieldValue::number(3.0)),
    );

    // Fourth run: the new fingerprint is committed, nothing to do.
    let quiet = run(&h.pipeline(), online("b2")).await;
    assert_eq!(quiet.totals.changed, 0);
}

#[tokio::test]
async fn dry_run_reports_would_create_and_writes_nothing() {
    let h = Harness::new();
    h.write_batch("b1", &[acme_row("O-100", 1, "2", "approve")]);

    let mut opts = online("b1");
    opts.dry_run = true;
    let report = run(&h.pipeline(), opts).await;

    let outcome = &report.products[0].orders[0];
    assert!(!outcome.committed);
    assert!(outcome
        .items
        .iter()
        .all(|i| i.disposition == ItemDisposition::WouldCreate));

    assert_eq!(h.fake.calls().creates, 0);
    assert_eq!(h.fake.count_kind(ItemKind::Epic), 0);
    let state = h
        .store()
        .order_state(&project(), &OrderId::from("O-100"))
        .await
        .expect("state");
    assert!(state.fingerprint.is_none(), "dry run must not advance marks");
}

#[tokio::test]
async fn cold_cache_adopts_existing_items_without_duplicates() {
    let h = Harness::new();
    h.write_batch("b1", &[acme_row("O-100", 1, "2", "approve")]);
    run(&h.pipeline(), online("b1")).await;
    let creates_before = h.fake.calls().creates;

    // Same remote, brand-new local state: the self-healing lookup must
    // find and adopt the existing items instead of re-creating them.
    let cold_root = h.state_root.parent().unwrap().join("cold-data");
    let report = run(&h.pipeline_with_state(&cold_root), online("b1")).await;

    assert_eq!(h.fake.calls().creates, creates_before, "no duplicate creation");
    assert_eq!(h.fake.count_kind(ItemKind::Epic), 1);
    assert_eq!(h.fake.count_kind(ItemKind::Story), 1);
    assert_eq!(report.totals.failures, 0);

    let adopted = StateStore::open(&cold_root)
        .order_state(&project(), &OrderId::from("O-100"))
        .await
        .expect("state");
    assert!(adopted.identities.contains_key("O-100::epic"));
    assert!(adopted.identities.contains_key("O-100::story::1"));
}

#[tokio::test]
async fn partial_story_failure_keeps_order_uncommitted_then_recovers() {
    let h = Harness::new();
    h.write_batch(
        "b1",
        &[acme_row("O-200", 1, "2", "approve"), acme_row("O-200", 2, "1", "approve")],
    );

    // Story 2 is rejected; the epic and story 1 succeed.
    h.fake.fail_create(
        "O-200-2",
        Fault::Validation {
            field: "customField7".into(),
        },
    );

    let report = run(&h.pipeline(), online("b1")).await;
    let outcome = &report.products[0].orders[0];
    assert!(!outcome.committed);
    let failure = outcome.failure.as_ref().expect("failure recorded");
    assert_eq!(failure.stage, ApplyStage::CreateStory);
    assert_eq!(failure.field.as_deref(), Some("customField7"));

    let state = h
        .store()
        .order_state(&project(), &OrderId::from("O-200"))
        .await
        .expect("state");
    assert!(
        state.fingerprint.is_none(),
        "partial success must not advance the fingerprint"
    );

    // Next run: the fault is gone; the whole order reprocesses. The epic
    // and story 1 are adopted by lookup, story 2 is finally created.
    h.fake.clear_create_faults();
    let report = run(&h.pipeline(), online("b1")).await;
    let outcome = &report.products[0].orders[0];
    assert!(outcome.committed);
    assert_eq!(h.fake.count_kind(ItemKind::Epic), 1, "epic not duplicated");
    assert_eq!(h.fake.count_kind(ItemKind::Story), 2);
}

#[tokio::test]
async fn stale_epic_identity_self_heals_by_recreating() {
    let h = Harness::new();
    h.write_batch("b1", &[acme_row("O-300", 1, "2", "approve")]);
    run(&h.pipeline(), online("b1")).await;

    // The epic is deleted remotely; the cache still points at it.
    let state = h
        .store()
        .order_state(&project(), &OrderId::from("O-300"))
        .await
        .expect("state");
    let stale_epic = state.identities.get("O-300::epic").unwrap().clone();
    assert!(h.fake.delete(&stale_epic));

    h.write_batch("b2", &[acme_row("O-300", 1, "5", "approve")]);
    let report = run(&h.pipeline(), online("b2")).await;

    let outcome = &report.products[0].orders[0];
    assert!(outcome.committed, "self-heal is not an error");
    assert_eq!(h.fake.count_kind(ItemKind::Epic), 1, "exactly one live epic");

    let healed = h
        .store()
        .order_state(&project(), &OrderId::from("O-300"))
        .await
        .expect("state");
    let new_epic = healed.identities.get("O-300::epic").unwrap();
    assert_ne!(new_epic, &stale_epic, "mapping re-pointed at the new epic");
}

#[tokio::test]
async fn stale_mapping_with_remote_replacement_repairs_the_cache() {
    let h = Harness::new();
    h.write_batch("b1", &[acme_row("O-310", 1, "2", "approve")]);
    run(&h.pipeline(), online("b1")).await;
    let creates_before = h.fake.calls().creates;

    // Corrupt the cached epic mapping; the real epic still exists and is
    // findable by its order-identifier field.
    let store = h.store();
    store
        .register_identity(
            &project(),
            &IdentityKey::epic(OrderId::from("O-310")),
            &RemoteId::from("wp-bogus"),
        )
        .await
        .expect("seed bogus mapping");

    h.write_batch("b2", &[acme_row("O-310", 1, "9", "approve")]);
    let report = run(&h.pipeline(), online("b2")).await;

    assert_eq!(report.totals.failures, 0);
    assert_eq!(h.fake.calls().creates, creates_before, "adopted, not recreated");
    let healed = h
        .store()
        .order_state(&project(), &OrderId::from("O-310"))
        .await
        .expect("state");
    assert_ne!(
        healed.identities.get("O-310::epic").unwrap(),
        &RemoteId::from("wp-bogus"),
    );
}

#[tokio::test]
async fn unmapped_product_warns_and_skips_without_calls() {
    let h = Harness::new();
    let mut row = acme_row("O-400", 1, "2", "approve");
    row.product = "Mystery Co".into();
    h.write_batch("b1", &[row]);

    let report = run(&h.pipeline(), online("b1")).await;
    let section = report
        .products
        .iter()
        .find(|p| p.product == "Mystery Co")
        .expect("product section");
    assert!(section.project.is_none());
    assert_eq!(section.orders_seen, 1);
    assert!(section.warnings[0].contains("no project mapping"));
    assert!(section.orders.is_empty());
    assert_eq!(h.fake.calls(), Calls::default(), "no tracker traffic");
}

#[tokio::test]
async fn transient_server_errors_are_retried_to_success() {
    let h = Harness::new();
    h.write_batch("b1", &[acme_row("O-500", 1, "2", "approve")]);

    // Two 503s, then success — within the 3-attempt budget.
    h.fake.fail_create("O-500-1", Fault::Server { remaining: 2 });

    let report = run(&h.pipeline(), online("b1")).await;
    let outcome = &report.products[0].orders[0];
    assert!(outcome.committed);
    assert!(outcome.retries >= 2);
    assert_eq!(h.fake.count_kind(ItemKind::Story), 1);
}

#[tokio::test]
async fn exhausted_retries_become_a_per_order_failure() {
    let h = Harness::new();
    h.write_batch(
        "b1",
        &[acme_row("O-510", 1, "2", "approve"), acme_row("O-511", 1, "1", "approve")],
    );

    h.fake.fail_create("O-510-1", Fault::Server { remaining: 99 });

    let report = run(&h.pipeline(), online("b1")).await;
    assert_eq!(report.totals.failures, 1);

    // One order failed; the other proceeded — failures are per-order.
    let failed = report.products[0]
        .orders
        .iter()
        .find(|o| o.order == OrderId::from("O-510"))
        .unwrap();
    assert!(!failed.committed);
    assert_eq!(failed.failure.as_ref().unwrap().stage, ApplyStage::CreateStory);

    let ok = report.products[0]
        .orders
        .iter()
        .find(|o| o.order == OrderId::from("O-511"))
        .unwrap();
    assert!(ok.committed);
}

#[tokio::test]
async fn write_conflict_refetches_rediffs_and_succeeds() {
    let h = Harness::new();
    h.write_batch("b1", &[acme_row("O-600", 1, "2", "approve")]);
    run(&h.pipeline(), online("b1")).await;

    let state = h
        .store()
        .order_state(&project(), &OrderId::from("O-600"))
        .await
        .expect("state");
    let story_id = state.identities.get("O-600::story::1").unwrap().clone();
    h.fake.conflict_next_update(&story_id);

    h.write_batch("b2", &[acme_row("O-600", 1, "7", "approve")]);
    let report = run(&h.pipeline(), online("b2")).await;

    assert_eq!(report.totals.failures, 0);
    assert_eq!(report.totals.updated, 1);
    assert_eq!(
        h.fake.item(&story_id).unwrap().fields.get("customField7"),
        Some(&FieldValue::number(7.0)),
    );
}

#[tokio::test]
async fn force_list_reprocesses_an_unchanged_order() {
    let h = Harness::new();
    h.write_batch("b1", &[acme_row("O-700", 1, "2", "approve")]);
    run(&h.pipeline(), online("b1")).await;

    let mut opts = online("b1");
    opts.force = [OrderId::from("O-700")].into_iter().collect();
    let report = run(&h.pipeline(), opts).await;

    assert_eq!(report.totals.changed, 1, "forced order is processed");
    assert_eq!(report.totals.created, 0);
    assert_eq!(report.totals.updated, 0, "resolves to no-ops");
    let outcome = &report.products[0].orders[0];
    assert!(outcome.committed, "forced orders commit like any other");
}

#[tokio::test]
async fn cancelled_run_starts_no_orders() {
    let h = Harness::new();
    h.write_batch("b1", &[acme_row("O-800", 1, "2", "approve")]);

    let (tx, rx) = cancel_channel();
    tx.send(true).expect("cancel");
    let report = h.pipeline().run(online("b1"), rx).await.expect("run");

    assert_eq!(report.totals.created, 0);
    assert_eq!(h.fake.calls(), Calls::default());
}

#[tokio::test]
async fn report_serializes_to_json() {
    let h = Harness::new();
    h.write_batch("b1", &[acme_row("O-900", 1, "2", "approve")]);
    let report = run(&h.pipeline(), online("b1")).await;

    let json = serde_json::to_string_pretty(&report).expect("serialize report");
    assert!(json.contains("\"run_id\""));
    assert!(json.contains("O-900"));
    assert!(!report.summary_text().is_empty());
}
