//! Active mode: the entry protocol, reconciliation against the editor
//! buffer, and live tracking of editor/remote/disk events.

use std::sync::Arc;

use crate::crdt::{self, CrdtDoc, DocOrigin};
use crate::error::Result;
use crate::persistence::{APP_ID_KEY, PATH_KEY, RELAY_KEY};
use crate::types::{DeferredConflict, PositionedChange};

use super::conflict::ConflictData;
use super::event::{Effect, Event};
use super::machine::{EffectBuf, HsmInner, MergeHsm, OP_ENTER};
use super::state::{ActiveState, EnteringState, MergingState, StatePath};

impl MergeHsm {
    // ==================== Entry protocol ====================

    /// Kick off the active entry protocol from `entering.awaitingPersistence`.
    pub(super) fn start_entering(self: &Arc<Self>, inner: &mut HsmInner, out: &mut EffectBuf) {
        // Reuse the recorded client id; adopt and record a fresh one otherwise.
        let local = match inner.client_id {
            Some(id) => CrdtDoc::with_client_id(id),
            None => {
                let doc = CrdtDoc::new();
                inner.client_id = Some(doc.client_id());
                doc
            }
        };
        inner.local = Some(local);

        let db = self.ctx.db_name(&inner.state.guid);
        let persistence = match (self.ctx.persistence_factory)(&db) {
            Ok(p) => p,
            Err(e) => {
                self.handle_entry_failure(inner, out, e.to_string());
                return;
            }
        };
        let _ = persistence.set_meta(PATH_KEY, &inner.state.path);
        let _ = persistence.set_meta(APP_ID_KEY, &self.ctx.app_id);
        if let Some(relay) = &self.ctx.relay_id {
            let _ = persistence.set_meta(RELAY_KEY, relay);
        }
        inner.persistence = Some(Arc::clone(&persistence));

        let load_updates = Arc::clone(&self.ctx.load_updates_raw);
        let weak = Arc::downgrade(self);
        self.ops.spawn(OP_ENTER, move |flag| async move {
            let result: Result<(bool, Vec<Vec<u8>>)> = async {
                persistence.when_synced().await?;
                let has_content = persistence.has_user_data()?;
                let updates = if has_content {
                    load_updates(persistence.db_name())?
                } else {
                    Vec::new()
                };
                Ok((has_content, updates))
            }
            .await;
            if flag.is_cancelled() {
                return;
            }
            let Some(hsm) = weak.upgrade() else { return };
            match result {
                Ok((has_content, updates)) => hsm.send(Event::PersistenceSynced {
                    has_content,
                    updates,
                }),
                Err(e) => hsm.send(Event::Error {
                    message: e.to_string(),
                }),
            }
        });
    }

    fn handle_entry_failure(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        message: String,
    ) {
        log::warn!("[MergeHsm:{}] Entry failed: {}", inner.state.guid, message);
        inner.state.error = Some(message);
        self.start_unloading(inner, out, false, "ERROR");
    }

    pub(super) fn on_persistence_synced(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        has_content: bool,
        updates: Vec<Vec<u8>>,
    ) {
        if has_content {
            let merged = match crdt::merge_updates(&updates) {
                Ok(merged) => merged,
                Err(e) => return self.handle_entry_failure(inner, out, e.to_string()),
            };
            {
                let local = inner.local.as_ref().expect("active entry without local doc");
                if let Err(e) = local.apply_update(&merged, DocOrigin::System) {
                    return self.handle_entry_failure(inner, out, e.to_string());
                }
                inner.state.local_state_vector = local.state_vector();
            }
            if self.transition_to(
                inner,
                out,
                StatePath::Active(ActiveState::Entering(EnteringState::Reconciling)),
                "PERSISTENCE_SYNCED",
            ) {
                self.reconcile(inner, out);
            }
        } else if !inner.provider_synced {
            self.transition_to(
                inner,
                out,
                StatePath::Active(ActiveState::Entering(EnteringState::AwaitingRemote)),
                "PERSISTENCE_SYNCED",
            );
        } else {
            self.adopt_remote_and_reconcile(inner, out);
        }
    }

    /// The provider is synced and local persistence was empty: mirror the
    /// remote document into the local one, then reconcile.
    pub(super) fn adopt_remote_and_reconcile(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
    ) {
        // Fold updates that arrived while we were waiting into the mirror.
        if let Some(queued) = inner.queued_remote.take() {
            if let Err(e) = inner.remote.apply_update(&queued, DocOrigin::Remote) {
                log::warn!("[MergeHsm] Failed to apply queued remote update: {}", e);
            }
        }
        inner.state.remote_state_vector = inner.remote.state_vector();

        let remote_state = match inner.remote.encode_state_as_update(None) {
            Ok(state) => state,
            Err(e) => return self.handle_entry_failure(inner, out, e.to_string()),
        };

        let local_is_empty = inner.local.as_ref().is_some_and(|l| l.is_empty());
        if local_is_empty && !crdt::is_noop_update(&remote_state) && !inner.remote.is_empty() {
            {
                let local = inner.local.as_ref().expect("active entry without local doc");
                if let Err(e) = local.apply_update(&remote_state, DocOrigin::Remote) {
                    return self.handle_entry_failure(inner, out, e.to_string());
                }
                inner.state.local_state_vector = local.state_vector();
            }
            if let Some(persistence) = &inner.persistence {
                if let Err(e) = persistence.initialize_from_remote(&remote_state) {
                    log::warn!("[MergeHsm] initialize_from_remote failed: {}", e);
                }
            }
        }

        if self.transition_to(
            inner,
            out,
            StatePath::Active(ActiveState::Entering(EnteringState::Reconciling)),
            "PROVIDER_SYNCED",
        ) {
            self.reconcile(inner, out);
        }
    }

    // ==================== Reconciliation ====================

    fn reconcile(self: &Arc<Self>, inner: &mut HsmInner, out: &mut EffectBuf) {
        let editor = inner
            .state
            .pending_editor_content
            .clone()
            .unwrap_or_default();
        let local_text = inner
            .local
            .as_ref()
            .map(|l| l.text())
            .unwrap_or_default();

        if local_text == editor {
            return self.settle_tracking(inner, out, "PERSISTENCE_SYNCED");
        }

        if local_text.is_empty() && !editor.is_empty() {
            // Fresh local CRDT against existing disk content: populate the
            // CRDT from the buffer. The editor already shows it, so nothing
            // is dispatched.
            {
                let local = inner.local.as_ref().expect("reconcile without local doc");
                local.set_text(&editor, DocOrigin::SelfEdit);
                inner.state.local_state_vector = local.state_vector();
            }
            // Enrollment stores the content update; no separate persist effect.
            let enrolled = match &inner.persistence {
                Some(persistence) => {
                    let full = inner
                        .local
                        .as_ref()
                        .and_then(|l| l.encode_state_as_update(None).ok())
                        .unwrap_or_default();
                    let mut loader = || Ok(full.clone());
                    persistence
                        .initialize_with_content(&mut loader)
                        .unwrap_or_else(|e| {
                            log::warn!("[MergeHsm] initialize_with_content failed: {}", e);
                            false
                        })
                }
                None => false,
            };
            let delta = inner
                .local
                .as_ref()
                .and_then(|l| {
                    l.encode_state_as_update(Some(&inner.remote.state_vector()))
                        .ok()
                })
                .unwrap_or_default();
            if !crdt::is_noop_update(&delta) {
                out.effects.push(Effect::SyncToRemote {
                    update: delta.clone(),
                });
                if !enrolled {
                    out.effects.push(Effect::PersistUpdates {
                        db_name: self.ctx.db_name(&inner.state.guid),
                        update: delta.clone(),
                    });
                }
                if let Err(e) = inner.remote.apply_update(&delta, DocOrigin::SelfEdit) {
                    log::warn!("[MergeHsm] Failed to mirror enrollment delta: {}", e);
                }
                inner.state.remote_state_vector = inner.remote.state_vector();
            }
            return self.settle_tracking(inner, out, "PERSISTENCE_SYNCED");
        }

        match inner.state.lca.clone() {
            None => {
                if !self.transition_to(
                    inner,
                    out,
                    StatePath::Active(ActiveState::Merging(MergingState::TwoWay)),
                    "PERSISTENCE_SYNCED",
                ) {
                    return;
                }
                if self.conflict_is_deferred(inner, &editor, &local_text) {
                    return self.settle_tracking(inner, out, "MERGE_SUCCESS");
                }
                // Without a common ancestor both sides become user choices.
                let conflict = ConflictData::two_way(local_text, editor);
                self.show_conflict(inner, out, conflict);
            }
            Some(lca) => {
                if !self.transition_to(
                    inner,
                    out,
                    StatePath::Active(ActiveState::Merging(MergingState::ThreeWay)),
                    "PERSISTENCE_SYNCED",
                ) {
                    return;
                }
                let merge = crdt::three_way_merge(&lca.contents, &local_text, &editor);
                match merge.merged() {
                    Some(merged) => {
                        {
                            let local =
                                inner.local.as_ref().expect("reconcile without local doc");
                            local.set_text(&merged, DocOrigin::SelfEdit);
                            inner.state.local_state_vector = local.state_vector();
                        }
                        self.push_local_delta(inner, out);
                        if editor != merged {
                            out.effects.push(Effect::DispatchEditor {
                                changes: crdt::positioned_changes(&editor, &merged),
                            });
                        }
                        inner.state.last_known_editor_text = Some(merged);
                        self.settle_tracking(inner, out, "MERGE_SUCCESS");
                    }
                    None => {
                        if self.conflict_is_deferred(inner, &editor, &local_text) {
                            return self.settle_tracking(inner, out, "MERGE_CONFLICT");
                        }
                        let conflict =
                            ConflictData::from_merge(lca.contents, local_text, editor, &merge);
                        self.show_conflict(inner, out, conflict);
                    }
                }
            }
        }
    }

    fn conflict_is_deferred(&self, inner: &HsmInner, disk_side: &str, local_side: &str) -> bool {
        let pair = DeferredConflict {
            disk_hash: (self.ctx.hash_fn)(disk_side),
            local_hash: (self.ctx.hash_fn)(local_side),
        };
        let deferred = inner.state.deferred_conflict.as_ref() == Some(&pair);
        if deferred {
            log::debug!(
                "[MergeHsm:{}] Conflict previously dismissed; not surfacing",
                inner.state.guid
            );
        }
        deferred
    }

    /// Enter tracking: attach the text observer, clear entry bookkeeping, and
    /// replay accumulated events.
    pub(super) fn settle_tracking(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        event: &'static str,
    ) {
        if inner.text_sub.is_none() {
            let sink = Arc::clone(&inner.edit_sink);
            sink.lock().unwrap().clear();
            if let Some(local) = inner.local.as_ref() {
                inner.text_sub = Some(local.observe_edits(sink));
            }
        }
        inner.edit_sink.lock().unwrap().clear();
        inner.state.pending_editor_content = None;
        if inner.state.last_known_editor_text.is_none() {
            inner.state.last_known_editor_text = inner.local.as_ref().map(|l| l.text());
        }
        self.transition_to(inner, out, StatePath::Active(ActiveState::Tracking), event);
        self.drain_queued(inner, out);
    }

    // ==================== Tracking ====================

    pub(super) fn tracking_editor_change(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        changes: Vec<PositionedChange>,
        doc_text: String,
        is_from_crdt: bool,
    ) {
        if is_from_crdt {
            // Echo of our own dispatch; the CRDT already has it.
            return;
        }
        {
            let local = inner.local.as_ref().expect("tracking without local doc");
            local.apply_changes(&changes, DocOrigin::SelfEdit);
            inner.state.local_state_vector = local.state_vector();
        }
        inner.state.last_known_editor_text = Some(doc_text);
        inner.edit_sink.lock().unwrap().clear();
        self.push_local_delta(inner, out);
    }

    pub(super) fn tracking_remote_update(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        update: Vec<u8>,
    ) {
        if let Err(e) = inner.remote.apply_update(&update, DocOrigin::Remote) {
            log::warn!("[MergeHsm] Failed to apply remote update: {}", e);
            return;
        }
        inner.state.remote_state_vector = inner.remote.state_vector();

        let diff = {
            let local = inner.local.as_ref().expect("tracking without local doc");
            match inner.remote.encode_state_as_update(Some(&local.state_vector())) {
                Ok(diff) => diff,
                Err(e) => {
                    log::warn!("[MergeHsm] Failed to encode remote diff: {}", e);
                    return;
                }
            }
        };
        if crdt::is_noop_update(&diff) {
            // Echo of our own outbound delta; nothing new for the local doc.
            return;
        }

        inner.edit_sink.lock().unwrap().clear();
        {
            let local = inner.local.as_ref().expect("tracking without local doc");
            if let Err(e) = local.apply_update(&diff, DocOrigin::Remote) {
                log::warn!("[MergeHsm] Failed to apply remote diff locally: {}", e);
                return;
            }
            inner.state.local_state_vector = local.state_vector();
        }

        // The observer translated the transaction into positioned edits.
        let edits: Vec<_> = inner.edit_sink.lock().unwrap().drain(..).collect();
        let changes: Vec<PositionedChange> = edits
            .into_iter()
            .filter(|e| e.origin != Some(DocOrigin::SelfEdit))
            .flat_map(|e| e.changes)
            .collect();
        if !changes.is_empty() {
            out.effects.push(Effect::DispatchEditor { changes });
        }
        out.effects.push(Effect::PersistUpdates {
            db_name: self.ctx.db_name(&inner.state.guid),
            update: diff,
        });
        inner.state.last_known_editor_text = inner.local.as_ref().map(|l| l.text());
    }

    /// Send whatever the remote is missing from the local doc, mirror it into
    /// the remote doc so the echo is recognized, and persist it locally.
    pub(super) fn push_local_delta(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
    ) {
        let delta = {
            let local = inner.local.as_ref().expect("push_local_delta without doc");
            match local.encode_state_as_update(Some(&inner.remote.state_vector())) {
                Ok(delta) => delta,
                Err(e) => {
                    log::warn!("[MergeHsm] Failed to encode local delta: {}", e);
                    return;
                }
            }
        };
        if crdt::is_noop_update(&delta) {
            return;
        }
        out.effects.push(Effect::SyncToRemote {
            update: delta.clone(),
        });
        out.effects.push(Effect::PersistUpdates {
            db_name: self.ctx.db_name(&inner.state.guid),
            update: delta.clone(),
        });
        // Apply to the remote mirror so the sender does not re-send on echo.
        if let Err(e) = inner.remote.apply_update(&delta, DocOrigin::SelfEdit) {
            log::warn!("[MergeHsm] Failed to mirror local delta: {}", e);
        }
        inner.state.remote_state_vector = inner.remote.state_vector();
    }
}
