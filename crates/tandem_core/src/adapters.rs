//! Integration shims: thin adapters between the machine's effects and the
//! outside world (disk, editor, provider, persistence), plus the in-memory
//! doubles the tests run against.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures_util::FutureExt;

use crate::crdt::apply_positioned;
use crate::error::{Result, TandemError};
use crate::hsm::{Effect, Event};
use crate::manager::{DiskState, DiskStateFn, EffectRouter, MergeManager};
use crate::observable::{Observable, ObserverCallback, SubscriptionId};
use crate::persistence::{MemoryPersistenceHub, STATE_KEY, db_name};
use crate::time::TimeProvider;
use crate::token_store::TokenStore;
use crate::types::{ClientToken, HashFn, PositionedChange};

/// Vault access as the core sees it.
pub trait DiskAdapter: Send + Sync {
    /// Read a file's contents.
    fn read(&self, path: &str) -> Result<String>;
    /// Write a file, creating it if needed.
    fn write(&self, path: &str, contents: &str) -> Result<()>;
    /// Modification time of a file (ms).
    fn mtime(&self, path: &str) -> Result<i64>;
    /// Subscribe to modification notifications `(path, mtime)`.
    fn on_modify(&self, cb: ObserverCallback<(String, i64)>) -> SubscriptionId;
    /// Remove a modification subscription.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// In-memory vault for tests and the reference wiring.
pub struct InMemoryDisk {
    files: RwLock<HashMap<String, (String, i64)>>,
    observers: Observable<(String, i64)>,
    time: Arc<dyn TimeProvider>,
}

impl InMemoryDisk {
    /// Create an empty in-memory vault.
    pub fn new(time: Arc<dyn TimeProvider>) -> Arc<Self> {
        Arc::new(Self {
            files: RwLock::new(HashMap::new()),
            observers: Observable::new(),
            time,
        })
    }

    /// Simulate an external edit (another program touching the vault).
    pub fn external_write(&self, path: &str, contents: &str) -> i64 {
        let mtime = self.time.now();
        {
            let mut files = self.files.write().unwrap();
            files.insert(path.to_string(), (contents.to_string(), mtime));
        }
        self.observers.emit(&(path.to_string(), mtime));
        mtime
    }

    /// A polling reader for [`crate::manager::ManagerConfig::get_disk_state`].
    pub fn disk_state_fn(self: &Arc<Self>, hash_fn: HashFn) -> DiskStateFn {
        let disk = Arc::clone(self);
        Arc::new(move |path: &str| {
            let disk = Arc::clone(&disk);
            let hash_fn = Arc::clone(&hash_fn);
            let path = path.to_string();
            async move {
                let contents = disk.read(&path)?;
                let mtime = disk.mtime(&path)?;
                Ok(DiskState {
                    hash: hash_fn(&contents),
                    contents,
                    mtime,
                })
            }
            .boxed()
        })
    }
}

impl DiskAdapter for InMemoryDisk {
    fn read(&self, path: &str) -> Result<String> {
        let files = self.files.read().unwrap();
        files
            .get(path)
            .map(|(contents, _)| contents.clone())
            .ok_or_else(|| TandemError::InvalidPath {
                path: path.to_string(),
                message: "file not found".to_string(),
            })
    }

    fn write(&self, path: &str, contents: &str) -> Result<()> {
        let mtime = self.time.now();
        {
            let mut files = self.files.write().unwrap();
            files.insert(path.to_string(), (contents.to_string(), mtime));
        }
        self.observers.emit(&(path.to_string(), mtime));
        Ok(())
    }

    fn mtime(&self, path: &str) -> Result<i64> {
        let files = self.files.read().unwrap();
        files
            .get(path)
            .map(|(_, mtime)| *mtime)
            .ok_or_else(|| TandemError::InvalidPath {
                path: path.to_string(),
                message: "file not found".to_string(),
            })
    }

    fn on_modify(&self, cb: ObserverCallback<(String, i64)>) -> SubscriptionId {
        self.observers.subscribe(cb)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }
}

/// A minimal editor buffer double.
///
/// Applies dispatched changes the way the view plugin would, and produces
/// editor-change events for simulated typing.
pub struct InMemoryEditor {
    buffer: Mutex<String>,
}

impl InMemoryEditor {
    /// Create an editor showing `initial`.
    pub fn new(initial: &str) -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(initial.to_string()),
        })
    }

    /// Current buffer text.
    pub fn text(&self) -> String {
        self.buffer.lock().unwrap().clone()
    }

    /// Apply a dispatched change list (a CRDT-originated edit).
    pub fn apply_dispatch(&self, changes: &[PositionedChange]) {
        let mut buffer = self.buffer.lock().unwrap();
        *buffer = apply_positioned(&buffer, changes);
    }

    /// Simulate the user typing: apply `changes` and build the event the
    /// view glue would send.
    pub fn edit(&self, changes: Vec<PositionedChange>) -> Event {
        let mut buffer = self.buffer.lock().unwrap();
        *buffer = apply_positioned(&buffer, &changes);
        Event::EditorChange {
            changes,
            doc_text: buffer.clone(),
            is_from_crdt: false,
        }
    }
}

/// Reference effect wiring: persistence, disk, editor, and outbound provider
/// traffic, routed the way the plugin shell routes them.
pub struct Shims {
    hub: Arc<MemoryPersistenceHub>,
    disk: Arc<InMemoryDisk>,
    app_id: String,
    hash_fn: HashFn,
    editors: RwLock<HashMap<String, Arc<InMemoryEditor>>>,
    /// `(guid, update)` pairs that would go over the wire
    outbound: Observable<(String, Vec<u8>)>,
    manager: RwLock<Weak<MergeManager>>,
}

impl Shims {
    /// Create the wiring over a persistence hub and an in-memory vault.
    pub fn new(
        hub: Arc<MemoryPersistenceHub>,
        disk: Arc<InMemoryDisk>,
        app_id: &str,
        hash_fn: HashFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            disk,
            app_id: app_id.to_string(),
            hash_fn,
            editors: RwLock::new(HashMap::new()),
            outbound: Observable::new(),
            manager: RwLock::new(Weak::new()),
        })
    }

    /// Attach the manager so disk writes can report `SAVE_COMPLETE`.
    pub fn attach(&self, manager: &Arc<MergeManager>) {
        *self.manager.write().unwrap() = Arc::downgrade(manager);
    }

    /// Open (or replace) the editor buffer for a document with known text.
    pub fn open_editor(&self, guid: &str, text: &str) -> Arc<InMemoryEditor> {
        let editor = InMemoryEditor::new(text);
        self.editors
            .write()
            .unwrap()
            .insert(guid.to_string(), Arc::clone(&editor));
        editor
    }

    /// The editor buffer for a document, created empty on first use.
    pub fn editor(&self, guid: &str) -> Arc<InMemoryEditor> {
        {
            let editors = self.editors.read().unwrap();
            if let Some(editor) = editors.get(guid) {
                return Arc::clone(editor);
            }
        }
        let mut editors = self.editors.write().unwrap();
        Arc::clone(
            editors
                .entry(guid.to_string())
                .or_insert_with(|| InMemoryEditor::new("")),
        )
    }

    /// Subscribe to outbound provider traffic.
    pub fn subscribe_outbound(&self, cb: ObserverCallback<(String, Vec<u8>)>) -> SubscriptionId {
        self.outbound.subscribe(cb)
    }

    /// An [`EffectRouter`] executing effects against the doubles.
    pub fn router(self: &Arc<Self>) -> EffectRouter {
        let shims = Arc::clone(self);
        Arc::new(move |guid: &str, effect: &Effect| shims.apply_effect(guid, effect))
    }

    fn apply_effect(&self, guid: &str, effect: &Effect) {
        match effect {
            Effect::WriteDisk { path, contents } => {
                if let Err(e) = self.disk.write(path, contents) {
                    log::warn!("[Shims] Disk write failed: {}", e);
                    return;
                }
                let mtime = self.disk.mtime(path).unwrap_or_default();
                let hash = (self.hash_fn)(contents);
                if let Some(manager) = self.manager.read().unwrap().upgrade() {
                    if let Some(hsm) = manager.hsm(guid) {
                        hsm.send(Event::SaveComplete { mtime, hash });
                    }
                }
            }
            Effect::PersistUpdates { db_name, update } => {
                self.hub.append_update(db_name, update);
            }
            Effect::PersistState { guid, state } => match state.to_json() {
                Ok(json) => {
                    self.hub
                        .set_meta(&db_name(&self.app_id, guid), STATE_KEY, &json)
                }
                Err(e) => log::warn!("[Shims] Failed to serialize state: {}", e),
            },
            Effect::SyncToRemote { update } => {
                self.outbound.emit(&(guid.to_string(), update.clone()));
            }
            Effect::DispatchEditor { changes } => {
                self.editor(guid).apply_dispatch(changes);
            }
            Effect::StatusChanged { .. }
            | Effect::ShowConflictDecorations { .. }
            | Effect::HideConflictDecoration { .. } => {
                // UI concerns; the view glue consumes these.
            }
        }
    }
}

/// Provider-side adapter: obtains per-document credentials from the token
/// store, feeds wire events into the machines, and tracks connectivity.
///
/// The WebSocket transport itself lives in the plugin shell; this shim is the
/// boundary it talks through.
pub struct ProviderShim {
    tokens: Arc<TokenStore<ClientToken>>,
    manager: RwLock<Weak<MergeManager>>,
}

impl ProviderShim {
    /// Create a provider shim over a token store.
    pub fn new(tokens: Arc<TokenStore<ClientToken>>) -> Arc<Self> {
        Arc::new(Self {
            tokens,
            manager: RwLock::new(Weak::new()),
        })
    }

    /// Attach the manager the shim feeds events into.
    pub fn attach(&self, manager: &Arc<MergeManager>) {
        *self.manager.write().unwrap() = Arc::downgrade(manager);
    }

    /// Obtain a connection token for a document, refreshing if needed.
    pub async fn client_token(&self, guid: &str, path: &str) -> Result<ClientToken> {
        self.tokens.get(guid, path, None).await
    }

    /// A cached token, if one is valid right now.
    pub fn cached_token(&self, guid: &str) -> Option<ClientToken> {
        self.tokens.get_sync(guid)
    }

    /// Deliver an incoming wire update for a document.
    pub fn deliver(&self, guid: &str, update: Vec<u8>) {
        if let Some(manager) = self.manager.read().unwrap().upgrade() {
            manager.handle_idle_remote_update(guid, update);
        }
    }

    /// Report that a document's initial server sync completed.
    pub fn mark_synced(&self, guid: &str) {
        if let Some(manager) = self.manager.read().unwrap().upgrade() {
            if let Some(hsm) = manager.hsm(guid) {
                hsm.send(Event::ProviderSynced);
            }
        }
    }

    /// Broadcast a connectivity change to every registered document.
    pub fn set_online(&self, online: bool) {
        let Some(manager) = self.manager.read().unwrap().upgrade() else {
            return;
        };
        let event = if online {
            Event::Connected
        } else {
            Event::Disconnected
        };
        for guid in manager.registered_guids() {
            if let Some(hsm) = manager.hsm(&guid) {
                hsm.send(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TestTimeProvider;
    use crate::types::default_hash_fn;

    #[test]
    fn test_in_memory_disk_read_write_mtime() {
        let time = Arc::new(TestTimeProvider::new(100));
        let disk = InMemoryDisk::new(Arc::clone(&time) as Arc<dyn TimeProvider>);

        assert!(disk.read("missing.md").is_err());
        disk.write("a.md", "hello").unwrap();
        assert_eq!(disk.read("a.md").unwrap(), "hello");
        assert_eq!(disk.mtime("a.md").unwrap(), 100);

        time.advance(50);
        disk.external_write("a.md", "changed");
        assert_eq!(disk.mtime("a.md").unwrap(), 150);
    }

    #[test]
    fn test_disk_modify_notifications() {
        let time = Arc::new(TestTimeProvider::new(0));
        let disk = InMemoryDisk::new(time);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        let id = disk.on_modify(Arc::new(move |(path, mtime)| {
            s.lock().unwrap().push((path.clone(), *mtime));
        }));

        disk.write("x.md", "1").unwrap();
        disk.unsubscribe(id);
        disk.write("x.md", "2").unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disk_state_fn_reports_hash() {
        let time = Arc::new(TestTimeProvider::new(0));
        let disk = InMemoryDisk::new(time);
        disk.write("n.md", "contents\n").unwrap();

        let reader = disk.disk_state_fn(default_hash_fn());
        let state = reader("n.md").await.unwrap();
        assert_eq!(state.contents, "contents\n");
        assert_eq!(state.hash, crate::types::content_hash("contents\n"));
    }

    #[tokio::test]
    async fn test_provider_shim_obtains_and_caches_tokens() {
        use crate::token_store::{RefreshFn, TokenStoreConfig, client_token_expiry};

        let time = Arc::new(TestTimeProvider::new(0));
        let refresh: RefreshFn<ClientToken> = Arc::new(|guid: &str| {
            let guid = guid.to_string();
            async move {
                Ok(ClientToken {
                    url: format!("wss://relay.example/{}", guid),
                    doc_id: guid,
                    token: "opaque".to_string(),
                    expiry_time: Some(3_600_000),
                })
            }
            .boxed()
        });
        let store = TokenStore::new(
            Arc::clone(&time) as Arc<dyn TimeProvider>,
            refresh,
            client_token_expiry(),
            TokenStoreConfig::default(),
        );
        let shim = ProviderShim::new(store);

        let token = shim.client_token("doc1", "notes/a.md").await.unwrap();
        assert_eq!(token.doc_id, "doc1");
        assert!(shim.cached_token("doc1").is_some());

        // Without an attached manager, wire events are dropped quietly.
        shim.deliver("doc1", vec![0, 0]);
        shim.mark_synced("doc1");
        shim.set_online(true);
    }

    #[test]
    fn test_editor_round_trip() {
        let editor = InMemoryEditor::new("hello world");
        editor.apply_dispatch(&[PositionedChange::insert_at(5, ",")]);
        assert_eq!(editor.text(), "hello, world");

        let event = editor.edit(vec![PositionedChange::delete(0, 6)]);
        assert_eq!(editor.text(), " world");
        match event {
            Event::EditorChange {
                doc_text,
                is_from_crdt,
                ..
            } => {
                assert_eq!(doc_text, editor.text());
                assert!(!is_from_crdt);
            }
            _ => panic!("expected editor change"),
        }
    }
}
