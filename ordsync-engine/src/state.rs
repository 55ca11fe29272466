//! Durable engine state: identities, fingerprints, and checkpoints.
//!
//! One JSON document per project at `<root>/state/<project>.json`, holding
//! all three maps. A per-order commit mutates the set and saves once via
//! the `.tmp` + rename protocol, so an order's identity mapping can never
//! land without its fingerprint and checkpoint (or vice versa).
//!
//! Identity keys:
//! - Epic:  `<order>::epic`
//! - Story: `<order>::story::<index>`
//!
//! Writers are serialized behind one async mutex; ownership of an order is
//! per-worker, so per-key atomicity from this store is all the executor
//! needs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use ordsync_core::types::{ItemKind, OrderId, ProjectKey, RemoteId};

use crate::error::{io_err, EngineError};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Logical identity of one tracker item within a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub order: OrderId,
    pub kind: ItemKind,
    /// Line-item sequence index; `None` for epics.
    pub index: Option<u32>,
}

impl IdentityKey {
    pub fn epic(order: OrderId) -> Self {
        Self {
            order,
            kind: ItemKind::Epic,
            index: None,
        }
    }

    pub fn story(order: OrderId, index: u32) -> Self {
        Self {
            order,
            kind: ItemKind::Story,
            index: Some(index),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}::{}::{}", self.order, self.kind, index),
            None => write!(f, "{}::{}", self.order, self.kind),
        }
    }
}

// ---------------------------------------------------------------------------
// On-disk document
// ---------------------------------------------------------------------------

/// On-disk state payload for one project.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateDoc {
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Identity key string → remote item identifier.
    #[serde(default)]
    pub identities: BTreeMap<String, String>,
    /// Order identifier → fingerprint of the last successfully applied
    /// source fields.
    #[serde(default)]
    pub fingerprints: BTreeMap<String, String>,
    /// Order identifier → last-processed source timestamp.
    #[serde(default)]
    pub checkpoints: BTreeMap<String, DateTime<Utc>>,
}

/// Stored change-detection marks for a project, snapshotted for one run.
#[derive(Debug, Clone, Default)]
pub struct ProjectMarks {
    pub fingerprints: BTreeMap<OrderId, String>,
    pub checkpoints: BTreeMap<OrderId, DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Keyed store shared by the resolver and the apply executor.
pub struct StateStore {
    root: PathBuf,
    docs: Mutex<HashMap<ProjectKey, StateDoc>>,
}

impl StateStore {
    /// Open a store rooted at `root`. Documents are loaded lazily per
    /// project; a missing file is an empty document.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            docs: Mutex::new(HashMap::new()),
        }
    }

    /// `<root>/state/<project>.json` — pure, no I/O.
    pub fn doc_path(&self, project: &ProjectKey) -> PathBuf {
        self.root.join("state").join(format!("{}.json", project.0))
    }

    fn load_doc(&self, project: &ProjectKey) -> Result<StateDoc, EngineError> {
        let path = self.doc_path(project);
        if !path.exists() {
            return Ok(StateDoc::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save_doc(&self, project: &ProjectKey, doc: &StateDoc) -> Result<(), EngineError> {
        let path = self.doc_path(project);
        let Some(dir) = path.parent() else {
            return Err(io_err(
                path,
                std::io::Error::other("invalid state document path"),
            ));
        };
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let json = serde_json::to_string_pretty(doc)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&path, e));
        }
        Ok(())
    }

    async fn with_doc<T>(
        &self,
        project: &ProjectKey,
        f: impl FnOnce(&StateDoc) -> T,
    ) -> Result<T, EngineError> {
        let mut docs = self.docs.lock().await;
        if !docs.contains_key(project) {
            let doc = self.load_doc(project)?;
            docs.insert(project.clone(), doc);
        }
        Ok(f(docs.get(project).expect("doc just inserted")))
    }

    async fn mutate_doc<T>(
        &self,
        project: &ProjectKey,
        f: impl FnOnce(&mut StateDoc) -> T,
    ) -> Result<T, EngineError> {
        let mut docs = self.docs.lock().await;
        if !docs.contains_key(project) {
            let doc = self.load_doc(project)?;
            docs.insert(project.clone(), doc);
        }
        let doc = docs.get_mut(project).expect("doc just inserted");
        let out = f(doc);
        doc.updated_at = Some(Utc::now());
        self.save_doc(project, doc)?;
        Ok(out)
    }

    // -- reads ---------------------------------------------------------------

    /// Cached remote identifier for a logical item, if one was ever
    /// committed or repaired.
    pub async fn identity(
        &self,
        project: &ProjectKey,
        key: &IdentityKey,
    ) -> Result<Option<RemoteId>, EngineError> {
        self.with_doc(project, |doc| {
            doc.identities.get(&key.to_string()).cloned().map(RemoteId)
        })
        .await
    }

    /// Snapshot the fingerprints and checkpoints for a project.
    pub async fn marks(&self, project: &ProjectKey) -> Result<ProjectMarks, EngineError> {
        self.with_doc(project, |doc| ProjectMarks {
            fingerprints: doc
                .fingerprints
                .iter()
                .map(|(k, v)| (OrderId::from(k.as_str()), v.clone()))
                .collect(),
            checkpoints: doc
                .checkpoints
                .iter()
                .map(|(k, v)| (OrderId::from(k.as_str()), *v))
                .collect(),
        })
        .await
    }

    /// Everything stored for `(project, order)` — identities, fingerprint,
    /// checkpoint. Operational inspection surface.
    pub async fn order_state(
        &self,
        project: &ProjectKey,
        order: &OrderId,
    ) -> Result<OrderState, EngineError> {
        let prefix = format!("{order}::");
        self.with_doc(project, |doc| OrderState {
            identities: doc
                .identities
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .map(|(k, v)| (k.clone(), RemoteId::from(v.as_str())))
                .collect(),
            fingerprint: doc.fingerprints.get(&order.0).cloned(),
            checkpoint: doc.checkpoints.get(&order.0).copied(),
        })
        .await
    }

    /// All order identifiers with any stored state in a project.
    pub async fn orders(&self, project: &ProjectKey) -> Result<Vec<OrderId>, EngineError> {
        self.with_doc(project, |doc| {
            let mut orders: Vec<OrderId> = doc
                .fingerprints
                .keys()
                .chain(doc.checkpoints.keys())
                .map(|k| OrderId::from(k.as_str()))
                .collect();
            for key in doc.identities.keys() {
                if let Some((order, _)) = key.split_once("::") {
                    orders.push(OrderId::from(order));
                }
            }
            orders.sort();
            orders.dedup();
            orders
        })
        .await
    }

    // -- writes --------------------------------------------------------------

    /// Register a remote identifier discovered outside a commit (cache
    /// repair after a successful remote lookup).
    pub async fn register_identity(
        &self,
        project: &ProjectKey,
        key: &IdentityKey,
        id: &RemoteId,
    ) -> Result<(), EngineError> {
        let key = key.to_string();
        let id = id.0.clone();
        self.mutate_doc(project, move |doc| {
            doc.identities.insert(key, id);
        })
        .await
    }

    /// Drop a mapping the remote system reported as gone.
    pub async fn drop_identity(
        &self,
        project: &ProjectKey,
        key: &IdentityKey,
    ) -> Result<bool, EngineError> {
        let key = key.to_string();
        self.mutate_doc(project, move |doc| doc.identities.remove(&key).is_some())
            .await
    }

    /// Commit an order's full success: all item identities, the new
    /// fingerprint, and the checkpoint, in a single document save.
    pub async fn commit_order(
        &self,
        project: &ProjectKey,
        order: &OrderId,
        identities: &[(IdentityKey, RemoteId)],
        fingerprint: &str,
        checkpoint: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let order = order.clone();
        let identities: Vec<(String, String)> = identities
            .iter()
            .map(|(key, id)| (key.to_string(), id.0.clone()))
            .collect();
        let fingerprint = fingerprint.to_string();
        self.mutate_doc(project, move |doc| {
            for (key, id) in identities {
                doc.identities.insert(key, id);
            }
            doc.fingerprints.insert(order.0.clone(), fingerprint);
            doc.checkpoints.insert(order.0, checkpoint);
        })
        .await
    }

    /// Remove every identity mapping for an order. Disaster-recovery path
    /// for when remote state and cache have diverged; the next run
    /// re-resolves or re-creates.
    pub async fn invalidate_order(
        &self,
        project: &ProjectKey,
        order: &OrderId,
    ) -> Result<usize, EngineError> {
        let prefix = format!("{order}::");
        self.mutate_doc(project, move |doc| {
            let before = doc.identities.len();
            doc.identities.retain(|k, _| !k.starts_with(&prefix));
            before - doc.identities.len()
        })
        .await
    }
}

/// Everything the store holds for one order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderState {
    pub identities: BTreeMap<String, RemoteId>,
    pub fingerprint: Option<String>,
    pub checkpoint: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
