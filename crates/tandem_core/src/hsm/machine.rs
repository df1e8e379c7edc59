//! The per-document merge state machine.
//!
//! One `MergeHsm` absorbs every event that can make disk, editor, local CRDT,
//! and remote CRDT diverge, and drives them back to one consistent content.
//! `send` is synchronous: the state mutates, effects are emitted to
//! subscribers in order, and only then does `send` return. Anything that
//! suspends runs through the op registry and re-enters via `send`.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::crdt::{self, CrdtDoc, DocOrigin, EditSink};
use crate::error::Result;
use crate::observable::{Observable, ObserverCallback, SubscriptionId};
use crate::persistence::{
    DocPersistence, LoadStateFn, LoadUpdatesFn, PersistedMergeState, PersistenceFactory, db_name,
};
use crate::time::TimeProvider;
use crate::types::{HashFn, LcaState, MergeMetadata, SyncStatus};

use super::conflict::ConflictData;
use super::event::{Effect, Event, Transition};
use super::state::{
    ActiveState, EnteringState, IdleState, MergeState, StatePath, select_idle_substate,
    transition_is_legal,
};
use super::tasks::OpRegistry;

/// Op ids, one pending operation per category.
pub(super) const OP_LOAD: &str = "load";
pub(super) const OP_ENTER: &str = "enter";
pub(super) const OP_IDLE_MERGE: &str = "idle-merge";
pub(super) const OP_CLEANUP: &str = "cleanup";

/// Injected configuration for merge machines.
///
/// No module-level mutables: clock, persistence, loaders, and hashing all
/// arrive through this context.
#[derive(Clone)]
pub struct HsmContext {
    /// Clock and timers
    pub time: Arc<dyn TimeProvider>,
    /// Opens per-document persistence handles
    pub persistence_factory: PersistenceFactory,
    /// Reads a database's raw update log
    pub load_updates_raw: LoadUpdatesFn,
    /// Reads a document's persisted merge state
    pub load_persisted_state: LoadStateFn,
    /// Content digest
    pub hash_fn: HashFn,
    /// Application id, part of every database name
    pub app_id: String,
    /// Shared-folder id stored in the sidecar, when known
    pub relay_id: Option<String>,
}

impl HsmContext {
    /// Database name for a document guid.
    pub fn db_name(&self, guid: &str) -> String {
        db_name(&self.app_id, guid)
    }
}

/// Latest disk change observed while the machine could not process it.
#[derive(Debug, Clone)]
pub(super) struct QueuedDiskChange {
    pub contents: String,
    pub mtime: i64,
    pub hash: String,
}

/// Effects, transitions, and re-sent events collected while handling one event.
#[derive(Default)]
pub(super) struct EffectBuf {
    pub effects: Vec<Effect>,
    pub transitions: Vec<Transition>,
    pub resend: Vec<Event>,
}

pub(super) struct HsmInner {
    pub state: MergeState,
    /// The local CRDT; present exactly while in `active.*`
    pub local: Option<CrdtDoc>,
    /// The remote CRDT mirror, shared with (and owned by) the provider shim
    pub remote: Arc<CrdtDoc>,
    /// Open persistence handle while active
    pub persistence: Option<Arc<dyn DocPersistence>>,
    /// Recorded CRDT client id, reused across sessions
    pub client_id: Option<u64>,
    /// Live conflict data while in `active.conflict.*`
    pub conflict: Option<ConflictData>,
    /// Remote updates accumulated during loading/entering, pre-merged
    pub queued_remote: Option<Vec<u8>>,
    /// Latest disk change accumulated during loading/entering
    pub queued_disk: Option<QueuedDiskChange>,
    /// Whether the provider has completed its initial sync
    pub provider_synced: bool,
    /// Contents of the last observed disk change
    pub last_disk_contents: Option<String>,
    /// Observer output queue for the local doc
    pub edit_sink: EditSink,
    /// Keeps the local doc's text observer alive
    pub text_sub: Option<yrs::Subscription>,
    /// Whether teardown should settle in `unloaded` rather than idle
    pub unload_target: bool,
    /// Last emitted status, for change detection
    pub last_status: Option<SyncStatus>,
    /// Last persisted snapshot, for change detection
    pub last_persisted: Option<PersistedMergeState>,
}

impl HsmInner {
    pub(super) fn build_persisted(&self) -> PersistedMergeState {
        PersistedMergeState {
            lca: self.state.lca.clone(),
            disk: self.state.disk.clone(),
            local_state_vector: self.state.local_state_vector.clone(),
            last_state_path: self.state.state_path.to_string(),
            deferred_conflict: self.state.deferred_conflict.clone(),
            client_id: self.client_id,
        }
    }
}

/// Hierarchical state machine for one document.
pub struct MergeHsm {
    pub(super) ctx: HsmContext,
    pub(super) inner: Mutex<HsmInner>,
    pub(super) effects: Observable<Effect>,
    pub(super) transitions: Observable<Transition>,
    pub(super) state_tx: watch::Sender<StatePath>,
    pub(super) ops: Arc<OpRegistry>,
}

impl MergeHsm {
    /// Create a machine for one document. The remote doc handle is shared
    /// with the provider integration and never destroyed here.
    pub fn new(
        ctx: HsmContext,
        guid: impl Into<String>,
        path: impl Into<String>,
        remote: Arc<CrdtDoc>,
    ) -> Arc<Self> {
        let state = MergeState::new(guid, path);
        let (state_tx, _state_rx) = watch::channel(StatePath::Unloaded);
        Arc::new(Self {
            ctx,
            inner: Mutex::new(HsmInner {
                state,
                local: None,
                remote,
                persistence: None,
                client_id: None,
                conflict: None,
                queued_remote: None,
                queued_disk: None,
                provider_synced: false,
                last_disk_contents: None,
                edit_sink: Arc::new(Mutex::new(Vec::new())),
                text_sub: None,
                unload_target: false,
                last_status: None,
                last_persisted: None,
            }),
            effects: Observable::new(),
            transitions: Observable::new(),
            state_tx,
            ops: OpRegistry::new(),
        })
    }

    // ==================== Event entry point ====================

    /// Feed one event through the machine.
    ///
    /// All effects produced while handling the event are delivered, in order,
    /// before this returns. Accumulated events re-sent after settling are
    /// processed as fresh `send` calls.
    pub fn send(self: &Arc<Self>, event: Event) {
        let mut out = EffectBuf::default();
        let new_path = {
            let mut inner = self.inner.lock().unwrap();
            log::debug!(
                "[MergeHsm:{}] {} in {}",
                inner.state.guid,
                event.name(),
                inner.state.state_path
            );
            self.dispatch(&mut inner, event, &mut out);
            self.epilogue(&mut inner, &mut out);
            inner.state.state_path
        };

        for transition in &out.transitions {
            self.transitions.emit(transition);
        }
        let _ = self.state_tx.send_replace(new_path);
        for effect in &out.effects {
            self.effects.emit(effect);
        }
        for event in std::mem::take(&mut out.resend) {
            self.send(event);
        }
    }

    fn dispatch(self: &Arc<Self>, inner: &mut HsmInner, event: Event, out: &mut EffectBuf) {
        // Connectivity is advisory everywhere and never gates transitions.
        match &event {
            Event::Connected => {
                inner.state.is_online = true;
                return;
            }
            Event::Disconnected => {
                inner.state.is_online = false;
                return;
            }
            _ => {}
        }

        // Document-mutating events are queued while the machine is loading or
        // running the entry protocol, and while a conflict holds positions.
        if self.accumulate(inner, &event) {
            return;
        }

        let path = inner.state.state_path;
        match event {
            Event::Load { guid, path: doc_path } => match inner.state.state_path {
                StatePath::Unloaded => {
                    inner.state.guid = guid;
                    inner.state.path = doc_path;
                    self.transition_to(inner, out, StatePath::Loading, "LOAD");
                    self.start_load(inner);
                }
                _ => log::debug!("[MergeHsm] LOAD ignored in {}", path),
            },

            Event::Unload => match path {
                StatePath::Unloaded => {}
                StatePath::Unloading => {
                    inner.unload_target = true;
                }
                _ => self.start_unloading(inner, out, true, "UNLOAD"),
            },

            Event::ReleaseLock => {
                if path.is_active() {
                    self.start_unloading(inner, out, false, "RELEASE_LOCK");
                } else {
                    log::debug!("[MergeHsm] RELEASE_LOCK ignored in {}", path);
                }
            }

            Event::AcquireLock { editor_content } => match path {
                StatePath::Loading => {
                    inner.state.pending_editor_content = Some(editor_content.clone());
                    inner.state.last_known_editor_text = Some(editor_content);
                    inner.state.error = None;
                    self.transition_to(
                        inner,
                        out,
                        StatePath::Active(ActiveState::Loading),
                        "ACQUIRE_LOCK",
                    );
                }
                StatePath::Idle(_) => {
                    self.ops.cancel(OP_IDLE_MERGE);
                    inner.state.pending_editor_content = Some(editor_content.clone());
                    inner.state.last_known_editor_text = Some(editor_content);
                    inner.state.error = None;
                    if self.transition_to(
                        inner,
                        out,
                        StatePath::Active(ActiveState::Entering(
                            EnteringState::AwaitingPersistence,
                        )),
                        "ACQUIRE_LOCK",
                    ) {
                        self.start_entering(inner, out);
                    }
                }
                _ => log::debug!("[MergeHsm] ACQUIRE_LOCK ignored in {}", path),
            },

            Event::DiskChanged {
                contents,
                mtime,
                hash,
            } => match path {
                StatePath::Idle(_) => self.idle_disk_changed(inner, out, contents, mtime, hash),
                StatePath::Active(_) => {
                    // Only metadata; the LCA is never touched while active.
                    inner.state.disk = Some(MergeMetadata { hash, mtime });
                    inner.last_disk_contents = Some(contents);
                }
                _ => {
                    inner.state.disk = Some(MergeMetadata { hash, mtime });
                    inner.last_disk_contents = Some(contents);
                }
            },

            Event::RemoteUpdate { update } => match path {
                StatePath::Idle(_) => self.idle_remote_update(inner, out, update),
                StatePath::Active(ActiveState::Tracking) => {
                    self.tracking_remote_update(inner, out, update)
                }
                _ => {
                    // Unloading/unloaded: keep the shared remote mirror current.
                    if let Err(e) = inner.remote.apply_update(&update, DocOrigin::Remote) {
                        log::warn!("[MergeHsm] Failed to apply remote update: {}", e);
                    }
                    inner.state.remote_state_vector = inner.remote.state_vector();
                }
            },

            Event::SaveComplete { mtime, hash } => {
                inner.state.disk = Some(MergeMetadata { hash, mtime });
            }

            Event::EditorChange {
                changes,
                doc_text,
                is_from_crdt,
            } => match path {
                StatePath::Active(ActiveState::Tracking) => {
                    self.tracking_editor_change(inner, out, changes, doc_text, is_from_crdt)
                }
                _ => log::debug!("[MergeHsm] EDITOR_CHANGE ignored in {}", path),
            },

            Event::ProviderSynced => {
                inner.provider_synced = true;
                if path == StatePath::Active(ActiveState::Entering(EnteringState::AwaitingRemote)) {
                    self.adopt_remote_and_reconcile(inner, out);
                }
            }

            Event::ResolveAcceptDisk
            | Event::ResolveAcceptLocal
            | Event::ResolveAcceptMerged { .. }
            | Event::ResolveHunk { .. }
            | Event::DismissConflict
            | Event::OpenDiffView
            | Event::Cancel => self.handle_conflict_event(inner, out, event),

            Event::PersistenceLoaded {
                persisted,
                local_sv,
            } => match path {
                StatePath::Loading => {
                    self.restore_persisted(inner, persisted, local_sv);
                    self.enter_idle(inner, out, "PERSISTENCE_LOADED");
                }
                StatePath::Active(ActiveState::Loading) => {
                    self.restore_persisted(inner, persisted, local_sv);
                    if self.transition_to(
                        inner,
                        out,
                        StatePath::Active(ActiveState::Entering(
                            EnteringState::AwaitingPersistence,
                        )),
                        "PERSISTENCE_LOADED",
                    ) {
                        self.start_entering(inner, out);
                    }
                }
                _ => log::debug!("[MergeHsm] PERSISTENCE_LOADED ignored in {}", path),
            },

            Event::PersistenceSynced {
                has_content,
                updates,
            } => {
                if path
                    == StatePath::Active(ActiveState::Entering(EnteringState::AwaitingPersistence))
                {
                    self.on_persistence_synced(inner, out, has_content, updates);
                } else {
                    log::debug!("[MergeHsm] PERSISTENCE_SYNCED ignored in {}", path);
                }
            }

            Event::MergeSuccess { new_lca, outcome } => {
                if path.is_idle() {
                    self.apply_idle_merge_success(inner, out, new_lca, outcome);
                } else {
                    log::debug!("[MergeHsm] MERGE_SUCCESS ignored in {}", path);
                }
            }

            Event::MergeConflict { .. } => {
                // An idle diverged merge found competing hunks: stay diverged
                // until the user reopens the file.
                log::info!(
                    "[MergeHsm:{}] Idle merge conflicted; waiting for the user",
                    inner.state.guid
                );
            }

            Event::RemoteDocUpdated => {
                inner.state.remote_state_vector = inner.remote.state_vector();
                if path.is_idle() {
                    self.enter_idle(inner, out, "REMOTE_DOC_UPDATED");
                }
            }

            Event::CleanupComplete {
                new_lca,
                final_state_vector,
                to_unloaded,
            } => {
                if path == StatePath::Unloading {
                    self.finish_unloading(inner, out, new_lca, final_state_vector, to_unloaded);
                } else {
                    log::debug!("[MergeHsm] CLEANUP_COMPLETE ignored in {}", path);
                }
            }

            Event::Error { message } => self.handle_error(inner, out, message),

            Event::SetModeIdle => {
                if path.is_idle() {
                    self.enter_idle(inner, out, "SET_MODE_IDLE");
                }
            }
            Event::SetModeActive => {
                log::debug!("[MergeHsm] SET_MODE_ACTIVE is a no-op; entry is lock-driven");
            }

            Event::Connected | Event::Disconnected => unreachable!("handled above"),
        }
    }

    // ==================== Transitions ====================

    pub(super) fn transition_to(
        &self,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        to: StatePath,
        event: &'static str,
    ) -> bool {
        let from = inner.state.state_path;
        if from == to {
            return true;
        }
        if !transition_is_legal(&from, &to) {
            debug_assert!(false, "illegal transition {} -> {} on {}", from, to, event);
            log::error!(
                "[MergeHsm:{}] Illegal transition {} -> {} on {}",
                inner.state.guid,
                from,
                to,
                event
            );
            return false;
        }
        log::debug!(
            "[MergeHsm:{}] {} -> {} ({})",
            inner.state.guid,
            from,
            to,
            event
        );
        inner.state.state_path = to;
        out.transitions.push(Transition { from, to, event });
        true
    }

    fn epilogue(&self, inner: &mut HsmInner, out: &mut EffectBuf) {
        // Persist the snapshot whenever any of its inputs changed, once the
        // initial load has happened.
        let skip_persist = matches!(
            inner.state.state_path,
            StatePath::Unloaded | StatePath::Loading | StatePath::Active(ActiveState::Loading)
        );
        if !skip_persist {
            let current = inner.build_persisted();
            if inner.last_persisted.as_ref() != Some(&current) {
                inner.last_persisted = Some(current.clone());
                out.effects.push(Effect::PersistState {
                    guid: inner.state.guid.clone(),
                    state: current,
                });
            }
        }

        let status = inner.state.sync_status();
        if inner.last_status.as_ref() != Some(&status) {
            inner.last_status = Some(status.clone());
            out.effects.push(Effect::StatusChanged {
                guid: inner.state.guid.clone(),
                status,
            });
        }
    }

    // ==================== Accumulation (§ event ordering) ====================

    fn accumulate(&self, inner: &mut HsmInner, event: &Event) -> bool {
        let loading = inner.state.state_path.is_accumulating();
        // While a conflict holds computed positions, remote updates are also
        // held back so they cannot shift the document under the decorations.
        let conflicted = matches!(
            inner.state.state_path,
            StatePath::Active(ActiveState::Merging(_)) | StatePath::Active(ActiveState::Conflict(_))
        );
        match event {
            Event::RemoteUpdate { update } if loading || conflicted => {
                let merged = match inner.queued_remote.take() {
                    Some(prior) => crdt::merge_updates(&[prior, update.clone()]),
                    None => Ok(update.clone()),
                };
                match merged {
                    Ok(merged) => inner.queued_remote = Some(merged),
                    Err(e) => log::warn!("[MergeHsm] Failed to merge queued update: {}", e),
                }
                true
            }
            Event::DiskChanged {
                contents,
                mtime,
                hash,
            } if loading => {
                inner.queued_disk = Some(QueuedDiskChange {
                    contents: contents.clone(),
                    mtime: *mtime,
                    hash: hash.clone(),
                });
                true
            }
            _ => false,
        }
    }

    pub(super) fn drain_queued(&self, inner: &mut HsmInner, out: &mut EffectBuf) {
        if let Some(update) = inner.queued_remote.take() {
            out.resend.push(Event::RemoteUpdate { update });
        }
        if let Some(disk) = inner.queued_disk.take() {
            out.resend.push(Event::DiskChanged {
                contents: disk.contents,
                mtime: disk.mtime,
                hash: disk.hash,
            });
        }
    }

    // ==================== Loading ====================

    fn start_load(self: &Arc<Self>, inner: &mut HsmInner) {
        let guid = inner.state.guid.clone();
        let db = self.ctx.db_name(&guid);
        let load_state = Arc::clone(&self.ctx.load_persisted_state);
        let load_updates = Arc::clone(&self.ctx.load_updates_raw);
        let weak = Arc::downgrade(self);

        self.ops.spawn(OP_LOAD, move |flag| async move {
            let result: Result<(Option<PersistedMergeState>, Vec<u8>)> = (|| {
                let persisted = load_state(&guid)?;
                let updates = load_updates(&db)?;
                let merged = crdt::merge_updates(&updates)?;
                let sv = crdt::state_vector_of_update(&merged)?;
                Ok((persisted, sv))
            })();
            if flag.is_cancelled() {
                return;
            }
            let Some(hsm) = weak.upgrade() else { return };
            match result {
                Ok((persisted, local_sv)) => hsm.send(Event::PersistenceLoaded {
                    persisted,
                    local_sv,
                }),
                Err(e) => hsm.send(Event::Error {
                    message: e.to_string(),
                }),
            }
        });
    }

    fn restore_persisted(
        &self,
        inner: &mut HsmInner,
        persisted: Option<PersistedMergeState>,
        local_sv: Vec<u8>,
    ) {
        if let Some(persisted) = persisted {
            inner.state.lca = persisted.lca.clone();
            inner.state.disk = persisted.disk.clone();
            inner.state.deferred_conflict = persisted.deferred_conflict.clone();
            inner.client_id = persisted.client_id;
            inner.last_persisted = Some(persisted);
        }
        // The update log is authoritative for what is locally reconstructible.
        inner.state.local_state_vector = local_sv;
        inner.state.remote_state_vector = inner.remote.state_vector();
    }

    // ==================== Idle entry ====================

    pub(super) fn enter_idle(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        event: &'static str,
    ) {
        let substate = if inner.state.error.is_some() {
            IdleState::Error
        } else {
            match select_idle_substate(&inner.state, &self.ctx.hash_fn) {
                Ok(substate) => substate,
                Err(e) => {
                    inner.state.error = Some(e.to_string());
                    IdleState::Error
                }
            }
        };
        self.transition_to(inner, out, StatePath::Idle(substate), event);
        self.drain_queued(inner, out);
        if matches!(
            substate,
            IdleState::RemoteAhead | IdleState::DiskAhead | IdleState::Diverged
        ) {
            self.maybe_start_idle_merge(inner, out);
        }
    }

    // ==================== Unloading ====================

    pub(super) fn start_unloading(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        to_unloaded: bool,
        event: &'static str,
    ) {
        self.ops.cancel(OP_IDLE_MERGE);
        self.ops.cancel(OP_ENTER);
        self.ops.cancel(OP_LOAD);

        inner.unload_target = to_unloaded;
        inner.conflict = None;
        inner.text_sub = None;

        let captured = inner
            .local
            .as_ref()
            .map(|doc| (doc.text(), doc.state_vector()));
        let persistence = inner.persistence.take();
        let disk = inner.state.disk.clone();
        let last_disk = inner.last_disk_contents.clone();
        let last_editor = inner.state.last_known_editor_text.clone();
        let hash_fn = Arc::clone(&self.ctx.hash_fn);
        let now = self.ctx.time.now();

        if !self.transition_to(inner, out, StatePath::Unloading, event) {
            return;
        }

        let weak = Arc::downgrade(self);
        self.ops.spawn(OP_CLEANUP, move |flag| async move {
            let new_lca_and_sv = captured.map(|(content, sv)| {
                let content_hash = hash_fn(&content);
                let stable = disk.as_ref().is_some_and(|d| d.hash == content_hash)
                    || last_disk.as_deref() == Some(content.as_str())
                    || last_editor.as_deref() == Some(content.as_str());
                let new_lca = stable.then(|| {
                    let meta = disk.clone().unwrap_or(MergeMetadata {
                        hash: content_hash,
                        mtime: now,
                    });
                    LcaState {
                        contents: content,
                        meta,
                        state_vector: sv.clone(),
                    }
                });
                (new_lca, sv)
            });

            if let Some(persistence) = persistence {
                if let Err(e) = persistence.destroy().await {
                    log::warn!("[MergeHsm] Failed to destroy persistence: {}", e);
                }
            }

            if flag.is_cancelled() {
                return;
            }
            let Some(hsm) = weak.upgrade() else { return };
            let (new_lca, final_state_vector) = match new_lca_and_sv {
                Some((lca, sv)) => (lca, sv),
                None => (None, Vec::new()),
            };
            hsm.send(Event::CleanupComplete {
                new_lca,
                final_state_vector,
                // The machine re-reads its own target flag, which an UNLOAD
                // arriving mid-teardown may have upgraded.
                to_unloaded: false,
            });
        });
    }

    fn finish_unloading(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        new_lca: Option<LcaState>,
        final_state_vector: Vec<u8>,
        to_unloaded_event: bool,
    ) {
        inner.local = None;
        inner.text_sub = None;
        inner.persistence = None;
        inner.edit_sink.lock().unwrap().clear();
        inner.state.pending_editor_content = None;
        inner.state.last_known_editor_text = None;

        if !final_state_vector.is_empty() {
            inner.state.local_state_vector = final_state_vector;
        }
        if let Some(lca) = new_lca {
            // LCA only moves forward in time.
            let monotonic = inner
                .state
                .lca
                .as_ref()
                .is_none_or(|old| lca.meta.mtime >= old.meta.mtime);
            if monotonic {
                inner.state.lca = Some(lca);
            } else {
                log::warn!(
                    "[MergeHsm:{}] Skipping non-monotonic LCA advance",
                    inner.state.guid
                );
            }
        }

        if inner.unload_target || to_unloaded_event {
            self.transition_to(inner, out, StatePath::Unloaded, "CLEANUP_COMPLETE");
        } else {
            self.enter_idle(inner, out, "CLEANUP_COMPLETE");
        }
    }

    fn handle_error(self: &Arc<Self>, inner: &mut HsmInner, out: &mut EffectBuf, message: String) {
        log::warn!("[MergeHsm:{}] Error: {}", inner.state.guid, message);
        inner.state.error = Some(message);
        match inner.state.state_path {
            StatePath::Loading | StatePath::Idle(_) => {
                self.transition_to(inner, out, StatePath::Idle(IdleState::Error), "ERROR");
            }
            StatePath::Active(_) => {
                // Tear down; the error field parks the machine in idle.error.
                self.start_unloading(inner, out, false, "ERROR");
            }
            StatePath::Unloading | StatePath::Unloaded => {}
        }
    }

    // ==================== Introspection & subscriptions ====================

    /// Current state path.
    pub fn state_path(&self) -> StatePath {
        self.inner.lock().unwrap().state.state_path
    }

    /// Clone of the full merge state snapshot.
    pub fn snapshot(&self) -> MergeState {
        self.inner.lock().unwrap().state.clone()
    }

    /// Current derived status.
    pub fn status(&self) -> SyncStatus {
        self.inner.lock().unwrap().state.sync_status()
    }

    /// One-line human summary for logs.
    pub fn describe(&self) -> String {
        let inner = self.inner.lock().unwrap();
        format!(
            "{} [{}] {} lca={} disk={} online={}",
            inner.state.guid,
            inner.state.path,
            inner.state.state_path,
            inner.state.lca.is_some(),
            inner.state.disk.is_some(),
            inner.state.is_online
        )
    }

    /// Whether the local CRDT is currently materialized.
    pub fn has_local_doc(&self) -> bool {
        self.inner.lock().unwrap().local.is_some()
    }

    /// Subscribe to emitted effects.
    pub fn subscribe_effects(&self, cb: ObserverCallback<Effect>) -> SubscriptionId {
        self.effects.subscribe(cb)
    }

    /// Unsubscribe from effects.
    pub fn unsubscribe_effects(&self, id: SubscriptionId) -> bool {
        self.effects.unsubscribe(id)
    }

    /// Subscribe to `(from, to, event)` transition records.
    pub fn subscribe_transitions(&self, cb: ObserverCallback<Transition>) -> SubscriptionId {
        self.transitions.subscribe(cb)
    }

    /// Unsubscribe from transitions.
    pub fn unsubscribe_transitions(&self, id: SubscriptionId) -> bool {
        self.transitions.unsubscribe(id)
    }

    // ==================== Await helpers ====================

    /// Wait until the state path satisfies `pred`.
    pub async fn await_state(&self, pred: impl Fn(&StatePath) -> bool) {
        let mut rx = self.state_tx.subscribe();
        loop {
            if pred(&rx.borrow()) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until the machine settles in idle (or unloaded).
    pub async fn await_idle(&self) {
        self.await_state(|s| s.is_idle() || *s == StatePath::Unloaded)
            .await;
    }

    /// Wait until the machine settles in active mode (tracking or conflict).
    pub async fn await_active(&self) {
        self.await_state(|s| s.is_active_settled()).await;
    }

    /// Wait for the current cleanup operation, if any.
    pub async fn await_cleanup(&self) {
        self.ops.await_op(OP_CLEANUP).await;
    }

    /// Wait for the current idle auto-merge, if any.
    pub async fn await_idle_auto_merge(&self) {
        self.ops.await_op(OP_IDLE_MERGE).await;
    }

    /// Wait for the initial load to finish.
    pub async fn await_loaded(&self) {
        self.ops.await_op(OP_LOAD).await;
        self.await_state(|s| !matches!(s, StatePath::Loading | StatePath::Unloaded))
            .await;
    }
}

impl std::fmt::Debug for MergeHsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeHsm")
            .field("state", &self.state_path().to_string())
            .finish_non_exhaustive()
    }
}
