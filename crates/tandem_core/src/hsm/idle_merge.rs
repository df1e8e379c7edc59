//! Non-interactive merges while no editor lock is held.
//!
//! Idle never materializes the local CRDT: merges reconstruct a scratch doc
//! from the persisted update log, fold in the remote state, and hand the
//! results back to the machine as a `MergeSuccess`/`MergeConflict` event.
//! At most one idle merge runs per document; starting a new one cancels the
//! previous via its abort flag.

use std::sync::Arc;

use crate::crdt::{self, CrdtDoc, DocOrigin};
use crate::error::Result;
use crate::persistence::LoadUpdatesFn;
use crate::types::{HashFn, LcaState, MergeMetadata};

use super::event::{Effect, Event, MergeOutcome};
use super::machine::{EffectBuf, HsmInner, MergeHsm, OP_IDLE_MERGE};
use super::state::{IdleState, StatePath};

/// Which idle merge to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum IdleMergeKind {
    RemoteAhead,
    DiskAhead,
    Diverged,
}

/// Immutable snapshot handed to the merge computation.
pub(super) struct IdleMergeInput {
    pub kind: IdleMergeKind,
    pub db_name: String,
    pub lca: Option<LcaState>,
    pub local_sv: Vec<u8>,
    /// Full state of the remote doc at snapshot time
    pub remote_state: Vec<u8>,
    pub remote_sv: Vec<u8>,
    pub disk_contents: Option<String>,
    pub disk_meta: Option<MergeMetadata>,
    pub client_id: Option<u64>,
    pub now: i64,
    pub hash_fn: HashFn,
    pub load_updates: LoadUpdatesFn,
}

impl MergeHsm {
    /// Handle a remote update while idle: fold it into the mirror and
    /// re-evaluate (which may start or restart an auto-merge).
    pub(super) fn idle_remote_update(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        update: Vec<u8>,
    ) {
        if let Err(e) = inner.remote.apply_update(&update, DocOrigin::Remote) {
            log::warn!("[MergeHsm] Failed to apply idle remote update: {}", e);
            return;
        }
        inner.state.remote_state_vector = inner.remote.state_vector();
        self.enter_idle(inner, out, "REMOTE_UPDATE");
    }

    /// Handle a disk change while idle: record it and re-evaluate.
    pub(super) fn idle_disk_changed(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        contents: String,
        mtime: i64,
        hash: String,
    ) {
        inner.state.disk = Some(MergeMetadata { hash, mtime });
        inner.last_disk_contents = Some(contents);
        self.enter_idle(inner, out, "DISK_CHANGED");
    }

    /// Start (or restart) the idle auto-merge for the current substate.
    pub(super) fn maybe_start_idle_merge(self: &Arc<Self>, inner: &mut HsmInner, _out: &mut EffectBuf) {
        let kind = match inner.state.state_path {
            StatePath::Idle(IdleState::RemoteAhead) => IdleMergeKind::RemoteAhead,
            StatePath::Idle(IdleState::DiskAhead) => IdleMergeKind::DiskAhead,
            StatePath::Idle(IdleState::Diverged) => IdleMergeKind::Diverged,
            _ => return,
        };

        let remote_state = match inner.remote.encode_state_as_update(None) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("[MergeHsm] Failed to snapshot remote state: {}", e);
                return;
            }
        };

        let input = IdleMergeInput {
            kind,
            db_name: self.ctx.db_name(&inner.state.guid),
            lca: inner.state.lca.clone(),
            local_sv: inner.state.local_state_vector.clone(),
            remote_state,
            remote_sv: inner.state.remote_state_vector.clone(),
            disk_contents: inner.last_disk_contents.clone(),
            disk_meta: inner.state.disk.clone(),
            client_id: inner.client_id,
            now: self.ctx.time.now(),
            hash_fn: Arc::clone(&self.ctx.hash_fn),
            load_updates: Arc::clone(&self.ctx.load_updates_raw),
        };

        let weak = Arc::downgrade(self);
        self.ops.spawn(OP_IDLE_MERGE, move |flag| async move {
            let result = compute_idle_merge(&input);
            if flag.is_cancelled() {
                return;
            }
            let Some(hsm) = weak.upgrade() else { return };
            match result {
                Ok(Some(event)) => hsm.send(event),
                Ok(None) => {}
                Err(e) => hsm.send(Event::Error {
                    message: e.to_string(),
                }),
            }
        });
    }

    /// Fold a finished idle merge back into the machine and re-evaluate.
    pub(super) fn apply_idle_merge_success(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        new_lca: Option<LcaState>,
        outcome: MergeOutcome,
    ) {
        if let Some(client_id) = outcome.new_client_id {
            inner.client_id = Some(client_id);
        }
        if let Some(contents) = outcome.write_disk {
            out.effects.push(Effect::WriteDisk {
                path: inner.state.path.clone(),
                contents: contents.clone(),
            });
            let meta = MergeMetadata {
                hash: (self.ctx.hash_fn)(&contents),
                mtime: self.ctx.time.now(),
            };
            inner.state.disk = Some(meta);
            inner.last_disk_contents = Some(contents);
        }
        if let Some(update) = outcome.sync_to_remote {
            if !crdt::is_noop_update(&update) {
                out.effects.push(Effect::SyncToRemote {
                    update: update.clone(),
                });
                if let Err(e) = inner.remote.apply_update(&update, DocOrigin::SelfEdit) {
                    log::warn!("[MergeHsm] Failed to mirror merge delta: {}", e);
                }
                inner.state.remote_state_vector = inner.remote.state_vector();
            }
        }
        if let Some(update) = outcome.persist_update {
            if !crdt::is_noop_update(&update) {
                out.effects.push(Effect::PersistUpdates {
                    db_name: self.ctx.db_name(&inner.state.guid),
                    update,
                });
            }
        }
        if let Some(sv) = outcome.new_local_sv {
            inner.state.local_state_vector = sv;
        }
        if let Some(lca) = new_lca {
            inner.state.lca = Some(lca);
        }

        // Re-evaluate: a remote update may have arrived during the merge.
        self.enter_idle(inner, out, "MERGE_SUCCESS");
    }
}

/// Run the idle merge computation for a snapshot.
///
/// Returns `Ok(None)` when there is nothing actionable (for example a disk
/// substate restored from persistence without the file contents in hand).
pub(super) fn compute_idle_merge(input: &IdleMergeInput) -> Result<Option<Event>> {
    match input.kind {
        IdleMergeKind::RemoteAhead => compute_remote_ahead(input),
        IdleMergeKind::DiskAhead => compute_disk_ahead(input),
        IdleMergeKind::Diverged => compute_diverged(input),
    }
}

fn load_local_doc(input: &IdleMergeInput, with_client_id: bool) -> Result<CrdtDoc> {
    let updates = (input.load_updates)(&input.db_name)?;
    let merged = crdt::merge_updates(&updates)?;
    let doc = if with_client_id {
        match input.client_id {
            Some(id) => CrdtDoc::with_client_id(id),
            None => CrdtDoc::new(),
        }
    } else {
        CrdtDoc::new()
    };
    doc.apply_update(&merged, DocOrigin::System)?;
    Ok(doc)
}

fn compute_remote_ahead(input: &IdleMergeInput) -> Result<Option<Event>> {
    let doc = load_local_doc(input, false)?;
    let local_text = doc.text();
    let local_sv = doc.state_vector();

    doc.apply_update(&input.remote_state, DocOrigin::Remote)?;
    let merged_sv = doc.state_vector();
    let merged_text = doc.text();

    let base_lca = input.lca.clone().unwrap_or_else(|| LcaState {
        contents: local_text.clone(),
        meta: MergeMetadata {
            hash: (input.hash_fn)(&local_text),
            mtime: input.now,
        },
        state_vector: Vec::new(),
    });

    if crdt::sv_equal(&merged_sv, &local_sv)? {
        // The remote carried nothing new: only the LCA's clock advances.
        let mut lca = base_lca;
        lca.state_vector = local_sv.clone();
        return Ok(Some(Event::MergeSuccess {
            new_lca: Some(lca),
            outcome: MergeOutcome {
                new_local_sv: Some(local_sv),
                ..Default::default()
            },
        }));
    }

    let remote_diff = doc.encode_state_as_update(Some(&local_sv))?;

    if merged_text == local_text {
        // New operations, same text: advance clocks and persist the history.
        let mut lca = base_lca;
        lca.state_vector = merged_sv.clone();
        return Ok(Some(Event::MergeSuccess {
            new_lca: Some(lca),
            outcome: MergeOutcome {
                persist_update: Some(remote_diff),
                new_local_sv: Some(merged_sv),
                ..Default::default()
            },
        }));
    }

    let lca = LcaState {
        contents: merged_text.clone(),
        meta: MergeMetadata {
            hash: (input.hash_fn)(&merged_text),
            mtime: input.now,
        },
        state_vector: merged_sv.clone(),
    };
    Ok(Some(Event::MergeSuccess {
        new_lca: Some(lca),
        outcome: MergeOutcome {
            write_disk: Some(merged_text),
            persist_update: Some(remote_diff),
            new_local_sv: Some(merged_sv),
            ..Default::default()
        },
    }))
}

fn compute_disk_ahead(input: &IdleMergeInput) -> Result<Option<Event>> {
    let Some(disk_text) = input.disk_contents.clone() else {
        // Disk metadata restored from persistence without contents; wait for
        // the next poll to supply them.
        log::debug!("[MergeHsm] Disk-ahead merge deferred: contents unknown");
        return Ok(None);
    };

    let doc = load_local_doc(input, true)?;
    let sv_before = doc.state_vector();

    // Structural diff only; a whole-document replace would duplicate content
    // when merged with concurrent edits.
    doc.set_text(&disk_text, DocOrigin::SelfEdit);
    let delta = doc.encode_state_as_update(Some(&sv_before))?;
    let new_sv = doc.state_vector();

    let meta = input.disk_meta.clone().unwrap_or(MergeMetadata {
        hash: (input.hash_fn)(&disk_text),
        mtime: input.now,
    });
    let lca = LcaState {
        contents: disk_text,
        meta,
        state_vector: new_sv.clone(),
    };

    Ok(Some(Event::MergeSuccess {
        new_lca: Some(lca),
        outcome: MergeOutcome {
            sync_to_remote: Some(delta.clone()),
            persist_update: Some(delta),
            new_local_sv: Some(new_sv),
            new_client_id: Some(doc.client_id()),
            ..Default::default()
        },
    }))
}

fn compute_diverged(input: &IdleMergeInput) -> Result<Option<Event>> {
    let Some(disk_text) = input.disk_contents.clone() else {
        log::debug!("[MergeHsm] Diverged merge deferred: disk contents unknown");
        return Ok(None);
    };

    let doc = load_local_doc(input, true)?;
    doc.apply_update(&input.remote_state, DocOrigin::Remote)?;
    let crdt_text = doc.text();
    let base = input
        .lca
        .as_ref()
        .map(|l| l.contents.clone())
        .unwrap_or_default();

    let merged = if crdt_text == disk_text {
        crdt_text.clone()
    } else {
        // Disk is the local side of the three-way diff, the merged CRDT the
        // remote side.
        let merge = crdt::three_way_merge(&base, &disk_text, &crdt_text);
        match merge.merged() {
            Some(merged) => merged,
            None => {
                return Ok(Some(Event::MergeConflict {
                    base,
                    local: disk_text,
                    remote: crdt_text,
                }));
            }
        }
    };

    doc.set_text(&merged, DocOrigin::SelfEdit);
    let new_sv = doc.state_vector();
    let sync_to_remote = doc.encode_state_as_update(Some(&input.remote_sv))?;
    let persist_update = doc.encode_state_as_update(Some(&input.local_sv))?;

    let lca = LcaState {
        contents: merged.clone(),
        meta: MergeMetadata {
            hash: (input.hash_fn)(&merged),
            mtime: input.now,
        },
        state_vector: new_sv.clone(),
    };
    let write_disk = (merged != disk_text).then_some(merged);

    Ok(Some(Event::MergeSuccess {
        new_lca: Some(lca),
        outcome: MergeOutcome {
            write_disk,
            sync_to_remote: Some(sync_to_remote),
            persist_update: Some(persist_update),
            new_local_sv: Some(new_sv),
            new_client_id: Some(doc.client_id()),
        },
    }))
}
