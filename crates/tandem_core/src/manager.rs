//! Registry and lifecycle of per-document merge machines.
//!
//! The manager owns the `guid -> MergeHsm` map, keeps the `active_docs` set
//! in lockstep with lock acquisition, fans disk polls and idle remote updates
//! out to machines, and surfaces an observable `guid -> SyncStatus` map.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use crate::crdt::CrdtDoc;
use crate::error::Result;
use crate::hsm::{Effect, Event, HsmContext, MergeHsm, StatePath};
use crate::observable::{Observable, ObserverCallback, SubscriptionId};
use crate::types::SyncStatus;

/// What a disk read observed: contents plus identity metadata.
#[derive(Debug, Clone)]
pub struct DiskState {
    /// File contents
    pub contents: String,
    /// Modification time (ms)
    pub mtime: i64,
    /// Content digest
    pub hash: String,
}

/// Injected disk reader used by polling.
pub type DiskStateFn = Arc<dyn Fn(&str) -> BoxFuture<'static, Result<DiskState>> + Send + Sync>;

/// Injected sink for the persisted status index.
pub type PersistIndexFn = Arc<dyn Fn(&[SyncStatus]) -> Result<()> + Send + Sync>;

/// Injected effect consumer; receives every effect of every machine.
pub type EffectRouter = Arc<dyn Fn(&str, &Effect) + Send + Sync>;

/// Configuration for a manager instance.
#[derive(Clone)]
pub struct ManagerConfig {
    /// Context handed to every machine
    pub hsm: HsmContext,
    /// Reads disk state for polling
    pub get_disk_state: DiskStateFn,
    /// Persists the status index snapshot
    pub persist_index: PersistIndexFn,
    /// Receives every machine effect
    pub on_effect: EffectRouter,
}

struct DocEntry {
    hsm: Arc<MergeHsm>,
    effect_sub: SubscriptionId,
}

/// Owns every document's machine and routes their effects.
pub struct MergeManager {
    cfg: ManagerConfig,
    docs: RwLock<HashMap<String, DocEntry>>,
    active_docs: RwLock<HashSet<String>>,
    statuses: RwLock<HashMap<String, SyncStatus>>,
    status_observers: Observable<Vec<SyncStatus>>,
    registering: Mutex<HashMap<String, Shared<BoxFuture<'static, Arc<MergeHsm>>>>>,
}

impl MergeManager {
    /// Create a manager.
    pub fn new(cfg: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            docs: RwLock::new(HashMap::new()),
            active_docs: RwLock::new(HashSet::new()),
            statuses: RwLock::new(HashMap::new()),
            status_observers: Observable::new(),
            registering: Mutex::new(HashMap::new()),
        })
    }

    // ==================== Lifecycle ====================

    /// Register a document: create its machine and load persisted state.
    ///
    /// Idempotent; concurrent calls for the same guid share one future.
    pub fn register(
        self: &Arc<Self>,
        guid: &str,
        path: &str,
        remote: Arc<CrdtDoc>,
    ) -> BoxFuture<'static, Arc<MergeHsm>> {
        if let Some(entry) = self.docs.read().unwrap().get(guid) {
            let hsm = Arc::clone(&entry.hsm);
            return async move { hsm }.boxed();
        }

        let mut registering = self.registering.lock().unwrap();
        if let Some(in_flight) = registering.get(guid) {
            let shared = in_flight.clone();
            return async move { shared.await }.boxed();
        }

        let manager = Arc::clone(self);
        let guid_owned = guid.to_string();
        let path_owned = path.to_string();
        let shared = async move {
            // A racing registration may have completed while this future was
            // being set up.
            if let Some(existing) = {
                let docs = manager.docs.read().unwrap();
                docs.get(&guid_owned).map(|e| Arc::clone(&e.hsm))
            } {
                manager.registering.lock().unwrap().remove(&guid_owned);
                return existing;
            }

            let hsm = MergeHsm::new(
                manager.cfg.hsm.clone(),
                &guid_owned,
                &path_owned,
                remote,
            );

            let weak = Arc::downgrade(&manager);
            let effect_guid = guid_owned.clone();
            let effect_sub = hsm.subscribe_effects(Arc::new(move |effect: &Effect| {
                if let Some(manager) = weak.upgrade() {
                    manager.route_effect(&effect_guid, effect);
                }
            }));

            manager.docs.write().unwrap().insert(
                guid_owned.clone(),
                DocEntry {
                    hsm: Arc::clone(&hsm),
                    effect_sub,
                },
            );

            hsm.send(Event::Load {
                guid: guid_owned.clone(),
                path: path_owned,
            });
            hsm.await_loaded().await;

            manager.registering.lock().unwrap().remove(&guid_owned);
            hsm
        }
        .boxed()
        .shared();

        registering.insert(guid.to_string(), shared.clone());
        async move { shared.await }.boxed()
    }

    /// Register if needed, then acquire the editor lock and wait until the
    /// machine settles in active mode.
    pub async fn get_hsm(
        self: &Arc<Self>,
        guid: &str,
        path: &str,
        remote: Arc<CrdtDoc>,
        editor_content: &str,
    ) -> Arc<MergeHsm> {
        let hsm = self.register(guid, path, remote).await;
        self.active_docs.write().unwrap().insert(guid.to_string());
        hsm.send(Event::AcquireLock {
            editor_content: editor_content.to_string(),
        });
        hsm.await_active().await;
        hsm
    }

    /// Release the editor lock and wait for teardown; the machine stays
    /// registered and idle.
    pub async fn unload(&self, guid: &str) {
        let hsm = {
            let docs = self.docs.read().unwrap();
            docs.get(guid).map(|e| Arc::clone(&e.hsm))
        };
        let Some(hsm) = hsm else { return };
        self.active_docs.write().unwrap().remove(guid);
        hsm.send(Event::ReleaseLock);
        hsm.await_cleanup().await;
        hsm.await_idle().await;
    }

    /// Release if active, unload fully, and drop the machine.
    pub async fn unregister(&self, guid: &str) {
        let entry = { self.docs.write().unwrap().remove(guid) };
        let Some(entry) = entry else { return };
        self.active_docs.write().unwrap().remove(guid);

        entry.hsm.send(Event::Unload);
        entry.hsm.await_cleanup().await;
        entry
            .hsm
            .await_state(|s| *s == StatePath::Unloaded)
            .await;
        entry.hsm.unsubscribe_effects(entry.effect_sub);

        self.statuses.write().unwrap().remove(guid);
        log::debug!("[MergeManager] Unregistered {}", guid);
    }

    /// Tear everything down.
    pub async fn destroy(&self) {
        let guids: Vec<String> = { self.docs.read().unwrap().keys().cloned().collect() };
        for guid in guids {
            self.unregister(&guid).await;
        }
    }

    // ==================== Fan-out ====================

    /// Poll disk for the given documents (or all registered ones) and emit
    /// `DISK_CHANGED` where mtime or hash moved.
    pub async fn poll_all(&self, guids: Option<&[String]>) {
        let targets: Vec<(String, Arc<MergeHsm>)> = {
            let docs = self.docs.read().unwrap();
            docs.iter()
                .filter(|(guid, _)| {
                    guids
                        .map(|list| list.iter().any(|g| g == *guid))
                        .unwrap_or(true)
                })
                .map(|(guid, entry)| (guid.clone(), Arc::clone(&entry.hsm)))
                .collect()
        };

        for (guid, hsm) in targets {
            let snapshot = hsm.snapshot();
            match (self.cfg.get_disk_state)(&snapshot.path).await {
                Ok(disk) => {
                    let changed = snapshot
                        .disk
                        .map(|known| known.mtime != disk.mtime || known.hash != disk.hash)
                        .unwrap_or(true);
                    if changed {
                        hsm.send(Event::DiskChanged {
                            contents: disk.contents,
                            mtime: disk.mtime,
                            hash: disk.hash,
                        });
                    }
                }
                Err(e) => {
                    log::debug!("[MergeManager] Poll failed for {}: {}", guid, e);
                }
            }
        }
    }

    /// Forward a remote update to a document that is not open in an editor.
    pub fn handle_idle_remote_update(&self, guid: &str, update: Vec<u8>) {
        let hsm = {
            let docs = self.docs.read().unwrap();
            docs.get(guid).map(|e| Arc::clone(&e.hsm))
        };
        match hsm {
            Some(hsm) => hsm.send(Event::RemoteUpdate { update }),
            None => log::debug!("[MergeManager] Remote update for unknown doc {}", guid),
        }
    }

    /// Look up a registered machine.
    pub fn hsm(&self, guid: &str) -> Option<Arc<MergeHsm>> {
        let docs = self.docs.read().unwrap();
        docs.get(guid).map(|e| Arc::clone(&e.hsm))
    }

    /// Whether a document is registered.
    pub fn is_registered(&self, guid: &str) -> bool {
        self.docs.read().unwrap().contains_key(guid)
    }

    /// Guids of every registered document.
    pub fn registered_guids(&self) -> Vec<String> {
        self.docs.read().unwrap().keys().cloned().collect()
    }

    /// Documents currently holding an editor lock.
    pub fn active_docs(&self) -> HashSet<String> {
        self.active_docs.read().unwrap().clone()
    }

    // ==================== Status map ====================

    fn route_effect(&self, guid: &str, effect: &Effect) {
        if let Effect::StatusChanged { status, .. } = effect {
            {
                let mut statuses = self.statuses.write().unwrap();
                statuses.insert(guid.to_string(), status.clone());
            }
            self.status_observers.emit(&vec![status.clone()]);
        }
        (self.cfg.on_effect)(guid, effect);
    }

    /// Snapshot of every document's status, sorted by guid.
    pub fn statuses(&self) -> Vec<SyncStatus> {
        let statuses = self.statuses.read().unwrap();
        let mut all: Vec<SyncStatus> = statuses.values().cloned().collect();
        all.sort_by(|a, b| a.guid.cmp(&b.guid));
        all
    }

    /// Status of one document.
    pub fn status_of(&self, guid: &str) -> Option<SyncStatus> {
        self.statuses.read().unwrap().get(guid).cloned()
    }

    /// Subscribe to batched status change notifications.
    pub fn subscribe_statuses(&self, cb: ObserverCallback<Vec<SyncStatus>>) -> SubscriptionId {
        self.status_observers.subscribe(cb)
    }

    /// Unsubscribe from status notifications.
    pub fn unsubscribe_statuses(&self, id: SubscriptionId) -> bool {
        self.status_observers.unsubscribe(id)
    }

    /// Snapshot the status map through the injected index sink.
    pub fn persist_index(&self) -> Result<()> {
        let snapshot = self.statuses();
        (self.cfg.persist_index)(&snapshot)
    }
}

impl std::fmt::Debug for MergeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeManager")
            .field("docs", &self.docs.read().unwrap().len())
            .field("active", &self.active_docs.read().unwrap().len())
            .finish()
    }
}
