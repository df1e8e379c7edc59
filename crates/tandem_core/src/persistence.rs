//! Per-document persistence.
//!
//! Each document owns a local database of CRDT updates plus a small sidecar
//! KV (`state`, `path`, `relay`, `app_id`). The database is opaque to the
//! core: reads go through injected loader functions and writes are emitted as
//! effects, so the same machine runs against IndexedDB in the plugin shell
//! and against [`MemoryPersistenceHub`] in tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TandemError};
use crate::types::{DeferredConflict, LcaState, MergeMetadata};

/// Sidecar key holding the serialized [`PersistedMergeState`].
pub const STATE_KEY: &str = "state";
/// Sidecar key holding the document path.
pub const PATH_KEY: &str = "path";
/// Sidecar key holding the shared-folder id.
pub const RELAY_KEY: &str = "relay";
/// Sidecar key holding the application id.
pub const APP_ID_KEY: &str = "app_id";

/// Database name for one document's local persistence.
pub fn db_name(app_id: &str, guid: &str) -> String {
    format!("{}-relay-doc-{}", app_id, guid)
}

/// Serialized snapshot of a document's merge state, minus live CRDT handles.
///
/// Written whenever the LCA, disk metadata, local state vector, last state
/// path, or deferred conflict change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedMergeState {
    /// Last common ancestor, if one has been established
    pub lca: Option<LcaState>,
    /// Last observed disk metadata
    pub disk: Option<MergeMetadata>,
    /// Encoded local CRDT state vector
    #[serde(with = "crate::types::serde_bytes_base64")]
    pub local_state_vector: Vec<u8>,
    /// Dotted string form of the last state path (e.g. `idle.synced`)
    pub last_state_path: String,
    /// Dismissed conflict, if any
    pub deferred_conflict: Option<DeferredConflict>,
    /// CRDT client id recorded for this document
    pub client_id: Option<u64>,
}

impl PersistedMergeState {
    /// Serialize to the JSON form stored under the `state` sidecar key.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the JSON form stored under the `state` sidecar key.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Handle to one document's local persistence database.
///
/// Mirrors what the IndexedDB-backed provider offers: a `synced` signal once
/// stored history has been replayed, one-shot content enrollment, and sidecar
/// metadata. `destroy` closes the handle; it does not delete data.
pub trait DocPersistence: Send + Sync {
    /// Name of the backing database.
    fn db_name(&self) -> &str;

    /// Whether stored history has been replayed into memory.
    fn synced(&self) -> bool;

    /// Resolve once stored history has been replayed.
    fn when_synced(&self) -> BoxFuture<'static, Result<()>>;

    /// Whether the database holds any user content.
    fn has_user_data(&self) -> Result<bool>;

    /// Enroll initial content exactly once.
    ///
    /// The loader is only invoked if no enrollment has happened; returns
    /// whether enrollment happened.
    fn initialize_with_content(&self, loader: &mut dyn FnMut() -> Result<Vec<u8>>) -> Result<bool>;

    /// Mirror server history into an empty local database.
    ///
    /// Returns `false` (and stores nothing) if the database already has data.
    fn initialize_from_remote(&self, remote_state: &[u8]) -> Result<bool>;

    /// Append one encoded update to the log.
    fn append_update(&self, update: &[u8]) -> Result<()>;

    /// Load the full update log.
    fn load_updates(&self) -> Result<Vec<Vec<u8>>>;

    /// Write a sidecar metadata value.
    fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    /// Read a sidecar metadata value.
    fn get_meta(&self, key: &str) -> Result<Option<String>>;

    /// Close this handle. Data is retained; a later factory call may reopen it.
    fn destroy(&self) -> BoxFuture<'static, Result<()>>;
}

/// Factory producing persistence handles by database name.
pub type PersistenceFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn DocPersistence>> + Send + Sync>;

/// Loader reading the raw update log of a database without opening a handle.
pub type LoadUpdatesFn = Arc<dyn Fn(&str) -> Result<Vec<Vec<u8>>> + Send + Sync>;

/// Loader reading a document's persisted merge state by guid.
pub type LoadStateFn = Arc<dyn Fn(&str) -> Result<Option<PersistedMergeState>> + Send + Sync>;

#[derive(Default)]
struct DbRecord {
    updates: Vec<Vec<u8>>,
    meta: HashMap<String, String>,
    enrolled: bool,
}

/// In-memory persistence shared across handles, keyed by database name.
///
/// Tests run the full machine against it, and it pins down the semantics the
/// IndexedDB adapter must match: data outlives handles, and at most one live
/// handle per database.
pub struct MemoryPersistenceHub {
    dbs: RwLock<HashMap<String, DbRecord>>,
    open_handles: Mutex<HashSet<String>>,
}

impl MemoryPersistenceHub {
    /// Create a new empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dbs: RwLock::new(HashMap::new()),
            open_handles: Mutex::new(HashSet::new()),
        })
    }

    /// A [`PersistenceFactory`] opening handles against this hub.
    pub fn factory(self: &Arc<Self>) -> PersistenceFactory {
        let hub = Arc::clone(self);
        Arc::new(move |name: &str| {
            {
                let mut open = hub.open_handles.lock().unwrap();
                if !open.insert(name.to_string()) {
                    return Err(TandemError::Persistence {
                        db_name: name.to_string(),
                        message: "database handle already open".to_string(),
                    });
                }
            }
            hub.dbs.write().unwrap().entry(name.to_string()).or_default();
            Ok(Arc::new(MemoryPersistence {
                hub: Arc::clone(&hub),
                name: name.to_string(),
            }) as Arc<dyn DocPersistence>)
        })
    }

    /// A [`LoadUpdatesFn`] reading this hub.
    pub fn load_updates_fn(self: &Arc<Self>) -> LoadUpdatesFn {
        let hub = Arc::clone(self);
        Arc::new(move |name: &str| Ok(hub.updates(name)))
    }

    /// A [`LoadStateFn`] reading `state` sidecar values by guid for `app_id`.
    pub fn load_state_fn(self: &Arc<Self>, app_id: &str) -> LoadStateFn {
        let hub = Arc::clone(self);
        let app_id = app_id.to_string();
        Arc::new(move |guid: &str| {
            let name = db_name(&app_id, guid);
            match hub.get_meta(&name, STATE_KEY) {
                Some(json) => Ok(Some(PersistedMergeState::from_json(&json)?)),
                None => Ok(None),
            }
        })
    }

    /// All stored updates for a database.
    pub fn updates(&self, name: &str) -> Vec<Vec<u8>> {
        let dbs = self.dbs.read().unwrap();
        dbs.get(name).map(|r| r.updates.clone()).unwrap_or_default()
    }

    /// Append an update, creating the database if needed.
    pub fn append_update(&self, name: &str, update: &[u8]) {
        if crate::crdt::is_noop_update(update) {
            return;
        }
        let mut dbs = self.dbs.write().unwrap();
        dbs.entry(name.to_string())
            .or_default()
            .updates
            .push(update.to_vec());
    }

    /// Write a sidecar value, creating the database if needed.
    pub fn set_meta(&self, name: &str, key: &str, value: &str) {
        let mut dbs = self.dbs.write().unwrap();
        dbs.entry(name.to_string())
            .or_default()
            .meta
            .insert(key.to_string(), value.to_string());
    }

    /// Read a sidecar value.
    pub fn get_meta(&self, name: &str, key: &str) -> Option<String> {
        let dbs = self.dbs.read().unwrap();
        dbs.get(name).and_then(|r| r.meta.get(key).cloned())
    }

    /// Whether a database exists.
    pub fn has(&self, name: &str) -> bool {
        self.dbs.read().unwrap().contains_key(name)
    }

    /// Delete a database and its sidecar outright.
    pub fn wipe(&self, name: &str) {
        self.dbs.write().unwrap().remove(name);
    }

    /// Names of currently open handles (diagnostics).
    pub fn open_handle_count(&self) -> usize {
        self.open_handles.lock().unwrap().len()
    }
}

struct MemoryPersistence {
    hub: Arc<MemoryPersistenceHub>,
    name: String,
}

impl DocPersistence for MemoryPersistence {
    fn db_name(&self) -> &str {
        &self.name
    }

    fn synced(&self) -> bool {
        true
    }

    fn when_synced(&self) -> BoxFuture<'static, Result<()>> {
        // Memory replay is immediate.
        async { Ok(()) }.boxed()
    }

    fn has_user_data(&self) -> Result<bool> {
        Ok(!self.hub.updates(&self.name).is_empty())
    }

    fn initialize_with_content(&self, loader: &mut dyn FnMut() -> Result<Vec<u8>>) -> Result<bool> {
        {
            let dbs = self.hub.dbs.read().unwrap();
            if let Some(record) = dbs.get(&self.name) {
                if record.enrolled || !record.updates.is_empty() {
                    return Ok(false);
                }
            }
        }
        let update = loader()?;
        let mut dbs = self.hub.dbs.write().unwrap();
        let record = dbs.entry(self.name.clone()).or_default();
        if record.enrolled || !record.updates.is_empty() {
            return Ok(false);
        }
        if !crate::crdt::is_noop_update(&update) {
            record.updates.push(update);
        }
        record.enrolled = true;
        Ok(true)
    }

    fn initialize_from_remote(&self, remote_state: &[u8]) -> Result<bool> {
        let mut dbs = self.hub.dbs.write().unwrap();
        let record = dbs.entry(self.name.clone()).or_default();
        if !record.updates.is_empty() {
            return Ok(false);
        }
        if !crate::crdt::is_noop_update(remote_state) {
            record.updates.push(remote_state.to_vec());
        }
        record.enrolled = true;
        Ok(true)
    }

    fn append_update(&self, update: &[u8]) -> Result<()> {
        self.hub.append_update(&self.name, update);
        Ok(())
    }

    fn load_updates(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.hub.updates(&self.name))
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.hub.set_meta(&self.name, key, value);
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self.hub.get_meta(&self.name, key))
    }

    fn destroy(&self) -> BoxFuture<'static, Result<()>> {
        let hub = Arc::clone(&self.hub);
        let name = self.name.clone();
        async move {
            hub.open_handles.lock().unwrap().remove(&name);
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::content_hash;

    #[test]
    fn test_db_name_format() {
        assert_eq!(db_name("obs-app", "abc123"), "obs-app-relay-doc-abc123");
    }

    #[test]
    fn test_persisted_state_round_trip_is_identity() {
        let state = PersistedMergeState {
            lca: Some(LcaState {
                contents: "text\n".to_string(),
                meta: MergeMetadata {
                    hash: content_hash("text\n"),
                    mtime: 1234,
                },
                state_vector: vec![9, 8, 7],
            }),
            disk: Some(MergeMetadata {
                hash: content_hash("text\n"),
                mtime: 1234,
            }),
            local_state_vector: vec![1, 2, 3],
            last_state_path: "idle.synced".to_string(),
            deferred_conflict: Some(DeferredConflict {
                disk_hash: "d".to_string(),
                local_hash: "l".to_string(),
            }),
            client_id: Some(77),
        };

        let json = state.to_json().unwrap();
        let back = PersistedMergeState::from_json(&json).unwrap();
        assert_eq!(state, back);
    }

    #[tokio::test]
    async fn test_hub_factory_enforces_single_handle() {
        let hub = MemoryPersistenceHub::new();
        let factory = hub.factory();

        let handle = factory("app-relay-doc-a").unwrap();
        assert!(factory("app-relay-doc-a").is_err());

        handle.destroy().await.unwrap();
        // After destroy, the database can be reopened and data survives.
        handle.append_update(&[1, 2, 3]).ok();
        let reopened = factory("app-relay-doc-a").unwrap();
        assert_eq!(reopened.load_updates().unwrap(), vec![vec![1u8, 2, 3]]);
    }

    #[test]
    fn test_initialize_with_content_enrolls_once() {
        let hub = MemoryPersistenceHub::new();
        let factory = hub.factory();
        let handle = factory("db").unwrap();

        let mut calls = 0;
        let enrolled = handle
            .initialize_with_content(&mut || {
                calls += 1;
                Ok(vec![1, 1])
            })
            .unwrap();
        assert!(enrolled);
        assert_eq!(calls, 1);

        let enrolled_again = handle
            .initialize_with_content(&mut || {
                calls += 1;
                Ok(vec![2, 2])
            })
            .unwrap();
        assert!(!enrolled_again);
        assert_eq!(calls, 1);
        assert_eq!(handle.load_updates().unwrap(), vec![vec![1u8, 1]]);
    }

    #[test]
    fn test_initialize_from_remote_requires_empty_db() {
        let hub = MemoryPersistenceHub::new();
        let factory = hub.factory();
        let handle = factory("db").unwrap();

        assert!(handle.initialize_from_remote(&[5, 5]).unwrap());
        assert!(!handle.initialize_from_remote(&[6, 6]).unwrap());
        assert_eq!(handle.load_updates().unwrap(), vec![vec![5u8, 5]]);
    }

    #[test]
    fn test_sidecar_meta_and_state_loader() {
        let hub = MemoryPersistenceHub::new();
        let name = db_name("app", "guid1");
        let state = PersistedMergeState {
            last_state_path: "idle.localAhead".to_string(),
            client_id: Some(3),
            ..Default::default()
        };
        hub.set_meta(&name, STATE_KEY, &state.to_json().unwrap());
        hub.set_meta(&name, PATH_KEY, "notes/a.md");

        let loader = hub.load_state_fn("app");
        let loaded = loader("guid1").unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loader("missing").unwrap(), None);
        assert_eq!(hub.get_meta(&name, PATH_KEY).as_deref(), Some("notes/a.md"));
    }

    #[test]
    fn test_noop_updates_are_not_stored() {
        let hub = MemoryPersistenceHub::new();
        hub.append_update("db", &[0, 0]);
        hub.append_update("db", &[]);
        assert!(hub.updates("db").is_empty());
    }
}
