//! End-to-end scenarios: one manager, in-memory persistence/disk/editor
//! doubles, and a remote mirror doc per document, wired the way the plugin
//! shell wires them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tandem_core::adapters::{DiskAdapter, InMemoryDisk, Shims};
use tandem_core::crdt::{CrdtDoc, DocOrigin};
use tandem_core::hsm::{
    ActiveState, ConflictState, Effect, EnteringState, Event, HsmContext, HunkResolution,
    IdleState, MergeHsm, StatePath,
};
use tandem_core::manager::{ManagerConfig, MergeManager};
use tandem_core::persistence::{MemoryPersistenceHub, PersistedMergeState, STATE_KEY, db_name};
use tandem_core::time::{TestTimeProvider, TimeProvider};
use tandem_core::types::{
    ConflictRegion, LcaState, MergeMetadata, PositionedChange, content_hash, default_hash_fn,
};

const APP: &str = "app";

struct Harness {
    time: Arc<TestTimeProvider>,
    hub: Arc<MemoryPersistenceHub>,
    disk: Arc<InMemoryDisk>,
    shims: Arc<Shims>,
    manager: Arc<MergeManager>,
}

fn harness() -> Harness {
    let time = Arc::new(TestTimeProvider::new(1_000));
    let hub = MemoryPersistenceHub::new();
    let disk = InMemoryDisk::new(Arc::clone(&time) as Arc<dyn TimeProvider>);
    let shims = Shims::new(
        Arc::clone(&hub),
        Arc::clone(&disk),
        APP,
        default_hash_fn(),
    );
    let ctx = HsmContext {
        time: Arc::clone(&time) as Arc<dyn TimeProvider>,
        persistence_factory: hub.factory(),
        load_updates_raw: hub.load_updates_fn(),
        load_persisted_state: hub.load_state_fn(APP),
        hash_fn: default_hash_fn(),
        app_id: APP.to_string(),
        relay_id: Some("relay-1".to_string()),
    };
    let manager = MergeManager::new(ManagerConfig {
        hsm: ctx,
        get_disk_state: disk.disk_state_fn(default_hash_fn()),
        persist_index: Arc::new(|_| Ok(())),
        on_effect: shims.router(),
    });
    shims.attach(&manager);
    Harness {
        time,
        hub,
        disk,
        shims,
        manager,
    }
}

async fn wait_until(mut pred: impl FnMut() -> bool) {
    for _ in 0..500 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn record_effect_names(hsm: &Arc<MergeHsm>) -> Arc<Mutex<Vec<String>>> {
    let names = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&names);
    hsm.subscribe_effects(Arc::new(move |effect: &Effect| {
        sink.lock().unwrap().push(effect.name().to_string());
    }));
    names
}

/// Register a document over existing disk content and wait until the idle
/// disk-ahead merge establishes the LCA.
async fn bootstrap_synced(
    h: &Harness,
    guid: &str,
    path: &str,
    contents: &str,
) -> (Arc<MergeHsm>, Arc<CrdtDoc>) {
    h.disk.external_write(path, contents);
    let remote = Arc::new(CrdtDoc::new());
    let hsm = h.manager.register(guid, path, Arc::clone(&remote)).await;
    hsm.send(Event::ProviderSynced);
    h.manager.poll_all(None).await;
    let hsm_wait = Arc::clone(&hsm);
    wait_until(move || {
        hsm_wait.state_path() == StatePath::Idle(IdleState::Synced)
            && hsm_wait.snapshot().lca.is_some()
    })
    .await;
    (hsm, remote)
}

// ==================== S3: idle three-way auto-merge ====================

#[tokio::test]
async fn s3_idle_divergence_merges_without_conflict_ui() {
    let h = harness();
    let base = "line A\nline B\nline C\n";
    let disk_version = "line A\nLINE B\nline C\n";
    let remote_version = "line A\nline B\nline C!\n";
    let merged = "line A\nLINE B\nline C!\n";
    let db = db_name(APP, "g3");

    // Local history holds the base; the LCA points at it.
    let doc0 = CrdtDoc::new();
    doc0.set_text(base, DocOrigin::SelfEdit);
    let u_base = doc0.encode_state_as_update(None).unwrap();
    h.hub.append_update(&db, &u_base);
    let persisted = PersistedMergeState {
        lca: Some(LcaState {
            contents: base.to_string(),
            meta: MergeMetadata {
                hash: content_hash(base),
                mtime: 900,
            },
            state_vector: doc0.state_vector(),
        }),
        // The disk change was observed before shutdown, but its contents are
        // not persisted; the stale mtime makes the next poll re-deliver them.
        disk: Some(MergeMetadata {
            hash: content_hash(disk_version),
            mtime: 999,
        }),
        local_state_vector: doc0.state_vector(),
        last_state_path: "idle.diverged".to_string(),
        deferred_conflict: None,
        client_id: Some(doc0.client_id()),
    };
    h.hub
        .set_meta(&db, STATE_KEY, &persisted.to_json().unwrap());

    // Offline, the user changed line B on disk...
    h.disk.external_write("notes/s3.md", disk_version);
    // ...while the remote picked up a change to line C.
    let remote = Arc::new(CrdtDoc::new());
    remote.apply_update(&u_base, DocOrigin::Remote).unwrap();
    remote.set_text(remote_version, DocOrigin::SelfEdit);

    let hsm = h
        .manager
        .register("g3", "notes/s3.md", Arc::clone(&remote))
        .await;
    assert_eq!(hsm.state_path(), StatePath::Idle(IdleState::Diverged));

    let names = record_effect_names(&hsm);
    h.manager.poll_all(None).await;

    let hsm_wait = Arc::clone(&hsm);
    let disk_wait = Arc::clone(&h.disk);
    wait_until(move || {
        hsm_wait.state_path() == StatePath::Idle(IdleState::Synced)
            && disk_wait.read("notes/s3.md").ok().as_deref() == Some(merged)
    })
    .await;

    // Both sides converged and the LCA advanced; no conflict UI appeared.
    assert_eq!(remote.text(), merged);
    let snapshot = hsm.snapshot();
    assert_eq!(snapshot.lca.as_ref().unwrap().contents, merged);
    assert!(snapshot.lca.unwrap().meta.mtime >= 1_000);
    assert!(
        !names
            .lock()
            .unwrap()
            .iter()
            .any(|n| n == "SHOW_CONFLICT_DECORATIONS")
    );
}

// ==================== S4: conflict on reopen, hunk "both" ====================

#[tokio::test]
async fn s4_three_way_conflict_on_reopen_resolved_both() {
    let h = harness();
    let db = db_name(APP, "g4");

    // Local history: X then Z. The LCA stops at X.
    let doc0 = CrdtDoc::new();
    doc0.set_text("X\n", DocOrigin::SelfEdit);
    let u1 = doc0.encode_state_as_update(None).unwrap();
    let sv1 = doc0.state_vector();
    doc0.set_text("Z\n", DocOrigin::SelfEdit);
    let u2 = doc0.encode_state_as_update(Some(&sv1)).unwrap();
    h.hub.append_update(&db, &u1);
    h.hub.append_update(&db, &u2);

    let persisted = PersistedMergeState {
        lca: Some(LcaState {
            contents: "X\n".to_string(),
            meta: MergeMetadata {
                hash: content_hash("X\n"),
                mtime: 900,
            },
            state_vector: sv1,
        }),
        disk: Some(MergeMetadata {
            hash: content_hash("Y\n"),
            mtime: 999,
        }),
        local_state_vector: doc0.state_vector(),
        last_state_path: "idle.diverged".to_string(),
        deferred_conflict: None,
        client_id: Some(doc0.client_id()),
    };
    h.hub
        .set_meta(&db, STATE_KEY, &persisted.to_json().unwrap());
    h.disk.external_write("s4.md", "Y\n");

    let remote = Arc::new(CrdtDoc::new());
    let hsm = h.manager.register("g4", "s4.md", Arc::clone(&remote)).await;
    hsm.send(Event::ProviderSynced);
    assert_eq!(hsm.state_path(), StatePath::Idle(IdleState::Diverged));

    // The idle merge sees competing hunks and leaves the document diverged.
    h.manager.poll_all(None).await;
    hsm.await_idle_auto_merge().await;
    assert_eq!(hsm.state_path(), StatePath::Idle(IdleState::Diverged));

    // Reopen with the disk contents in the editor.
    h.shims.open_editor("g4", "Y\n");
    let decorations: Arc<Mutex<Option<Vec<ConflictRegion>>>> = Arc::new(Mutex::new(None));
    let deco_sink = Arc::clone(&decorations);
    hsm.subscribe_effects(Arc::new(move |effect: &Effect| {
        if let Effect::ShowConflictDecorations { regions, .. } = effect {
            *deco_sink.lock().unwrap() = Some(regions.clone());
        }
    }));

    let hsm = h
        .manager
        .get_hsm("g4", "s4.md", Arc::clone(&remote), "Y\n")
        .await;
    assert_eq!(
        hsm.state_path(),
        StatePath::Active(ActiveState::Conflict(ConflictState::BannerShown))
    );

    let regions = decorations.lock().unwrap().clone().unwrap();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].local, "Z");
    assert_eq!(regions[0].remote, "Y");

    // Keep both sides, local first.
    hsm.send(Event::ResolveHunk {
        index: 0,
        resolution: HunkResolution::Both,
    });
    assert_eq!(hsm.state_path(), StatePath::Active(ActiveState::Tracking));
    assert_eq!(h.shims.editor("g4").text(), "Z\nY\n");
    assert_eq!(remote.text(), "Z\nY\n");
}

// ==================== S6: idempotent echo ====================

#[tokio::test]
async fn s6_receiving_our_own_update_is_a_noop() {
    let h = harness();
    h.disk.external_write("s6.md", "hello\n");
    let remote = Arc::new(CrdtDoc::new());
    let hsm = h.manager.register("g6", "s6.md", Arc::clone(&remote)).await;
    hsm.send(Event::ProviderSynced);
    h.shims.open_editor("g6", "hello\n");
    let hsm = h
        .manager
        .get_hsm("g6", "s6.md", Arc::clone(&remote), "hello\n")
        .await;
    assert_eq!(hsm.state_path(), StatePath::Active(ActiveState::Tracking));

    // Collect outbound wire traffic, then type.
    let outbound: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let out_sink = Arc::clone(&outbound);
    h.shims
        .subscribe_outbound(Arc::new(move |(_, update): &(String, Vec<u8>)| {
            out_sink.lock().unwrap().push(update.clone());
        }));

    let editor = h.shims.editor("g6");
    let event = editor.edit(vec![PositionedChange::insert_at(5, ", world")]);
    hsm.send(event);

    let update = outbound.lock().unwrap().last().cloned().unwrap();
    let sv_before = hsm.snapshot().local_state_vector;
    let names = record_effect_names(&hsm);

    // The server echoes our own update back.
    hsm.send(Event::RemoteUpdate { update });

    let snapshot = hsm.snapshot();
    assert_eq!(snapshot.local_state_vector, sv_before);
    assert_eq!(editor.text(), "hello, world\n");
    assert!(!names.lock().unwrap().iter().any(|n| n == "DISPATCH_EDITOR"));
}

// ==================== Round-trip and boundary laws ====================

#[tokio::test]
async fn release_then_acquire_with_same_content_needs_no_merge() {
    let h = harness();
    let (hsm, remote) = bootstrap_synced(&h, "g5", "r.md", "note\n").await;
    let _ = &hsm;

    h.shims.open_editor("g5", "note\n");
    let hsm = h
        .manager
        .get_hsm("g5", "r.md", Arc::clone(&remote), "note\n")
        .await;
    assert_eq!(hsm.state_path(), StatePath::Active(ActiveState::Tracking));

    h.manager.unload("g5").await;
    assert_eq!(hsm.state_path(), StatePath::Idle(IdleState::Synced));

    let names = record_effect_names(&hsm);
    let hsm = h
        .manager
        .get_hsm("g5", "r.md", Arc::clone(&remote), "note\n")
        .await;
    assert_eq!(hsm.state_path(), StatePath::Active(ActiveState::Tracking));
    let names = names.lock().unwrap();
    assert!(!names.iter().any(|n| n == "SHOW_CONFLICT_DECORATIONS"));
    assert!(!names.iter().any(|n| n == "DISPATCH_EDITOR"));
}

#[tokio::test]
async fn reopen_after_save_lands_in_idle_synced() {
    let h = harness();
    let (hsm, remote) = bootstrap_synced(&h, "g7", "save.md", "a\n").await;

    h.shims.open_editor("g7", "a\n");
    let hsm2 = h
        .manager
        .get_hsm("g7", "save.md", Arc::clone(&remote), "a\n")
        .await;

    // Type, then the editor host saves the file; the poll sees our own save.
    let editor = h.shims.editor("g7");
    let event = editor.edit(vec![PositionedChange::insert_at(1, "b")]);
    hsm2.send(event);
    h.time.advance(10);
    h.disk.external_write("save.md", "ab\n");
    h.manager.poll_all(None).await;

    h.manager.unload("g7").await;
    // The LCA advanced at cleanup, so the document is synced, not diverged.
    assert_eq!(hsm.state_path(), StatePath::Idle(IdleState::Synced));
    assert_eq!(hsm.snapshot().lca.unwrap().contents, "ab\n");
}

#[tokio::test]
async fn empty_local_doc_populates_from_disk_without_dispatch() {
    let h = harness();
    h.disk.external_write("p.md", "seed\n");
    let remote = Arc::new(CrdtDoc::new());
    let hsm = h.manager.register("g8", "p.md", Arc::clone(&remote)).await;
    hsm.send(Event::ProviderSynced);
    h.shims.open_editor("g8", "seed\n");

    let names = record_effect_names(&hsm);
    let hsm = h
        .manager
        .get_hsm("g8", "p.md", Arc::clone(&remote), "seed\n")
        .await;
    assert_eq!(hsm.state_path(), StatePath::Active(ActiveState::Tracking));

    let names = names.lock().unwrap();
    assert!(!names.iter().any(|n| n == "DISPATCH_EDITOR"));
    assert!(names.iter().any(|n| n == "SYNC_TO_REMOTE"));
    drop(names);

    // Enrollment stored the content exactly once.
    assert_eq!(h.hub.updates(&db_name(APP, "g8")).len(), 1);
    assert_eq!(remote.text(), "seed\n");
}

#[tokio::test]
async fn adopting_remote_content_on_first_open_tracks_cleanly() {
    let h = harness();
    h.disk.external_write("adopt.md", "remote line\n");

    // The server already has this document.
    let server = CrdtDoc::new();
    server.set_text("remote line\n", DocOrigin::SelfEdit);
    let remote = Arc::new(CrdtDoc::new());
    remote
        .apply_update(&server.encode_state_as_update(None).unwrap(), DocOrigin::Remote)
        .unwrap();

    let hsm = h
        .manager
        .register("g11", "adopt.md", Arc::clone(&remote))
        .await;
    hsm.send(Event::ProviderSynced);
    h.shims.open_editor("g11", "remote line\n");

    let hsm = h
        .manager
        .get_hsm("g11", "adopt.md", Arc::clone(&remote), "remote line\n")
        .await;
    assert_eq!(hsm.state_path(), StatePath::Active(ActiveState::Tracking));

    let snapshot = hsm.snapshot();
    assert_eq!(snapshot.local_state_vector, snapshot.remote_state_vector);
    // The mirrored history landed in local persistence.
    assert!(!h.hub.updates(&db_name(APP, "g11")).is_empty());
}

#[tokio::test]
async fn acquire_before_provider_sync_waits_in_awaiting_remote() {
    let h = harness();
    let remote = Arc::new(CrdtDoc::new());
    let hsm = h
        .manager
        .register("g9", "late.md", Arc::clone(&remote))
        .await;
    h.shims.open_editor("g9", "");

    let manager = Arc::clone(&h.manager);
    let remote_for_task = Arc::clone(&remote);
    let opener =
        tokio::spawn(async move { manager.get_hsm("g9", "late.md", remote_for_task, "").await });

    let hsm_wait = Arc::clone(&hsm);
    wait_until(move || {
        hsm_wait.state_path()
            == StatePath::Active(ActiveState::Entering(EnteringState::AwaitingRemote))
    })
    .await;

    // Server content arrives, then the provider reports synced.
    let server = CrdtDoc::new();
    server.set_text("from server\n", DocOrigin::SelfEdit);
    hsm.send(Event::RemoteUpdate {
        update: server.encode_state_as_update(None).unwrap(),
    });
    hsm.send(Event::ProviderSynced);

    let hsm = opener.await.unwrap();
    // Editor was empty and there is no ancestor: both sides become choices.
    assert_eq!(
        hsm.state_path(),
        StatePath::Active(ActiveState::Conflict(ConflictState::BannerShown))
    );

    hsm.send(Event::ResolveAcceptLocal);
    assert_eq!(hsm.state_path(), StatePath::Active(ActiveState::Tracking));
    assert_eq!(h.shims.editor("g9").text(), "from server\n");
}

#[tokio::test]
async fn local_doc_exists_exactly_while_active() {
    let h = harness();
    let (hsm, remote) = bootstrap_synced(&h, "g12", "inv.md", "x\n").await;
    assert!(!hsm.has_local_doc());

    h.shims.open_editor("g12", "x\n");
    let hsm = h
        .manager
        .get_hsm("g12", "inv.md", Arc::clone(&remote), "x\n")
        .await;
    assert!(hsm.has_local_doc());
    assert!(h.manager.active_docs().contains("g12"));

    h.manager.unload("g12").await;
    assert!(!hsm.has_local_doc());
    assert!(!h.manager.active_docs().contains("g12"));

    h.manager.unregister("g12").await;
    assert!(!h.manager.is_registered("g12"));
}

#[tokio::test]
async fn interleaved_editor_and_remote_edits_converge_without_duplication() {
    let h = harness();
    let (hsm, remote) = bootstrap_synced(&h, "g10", "mix.md", "shared\n").await;
    let _ = &hsm;

    let outbound: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let out_sink = Arc::clone(&outbound);
    h.shims
        .subscribe_outbound(Arc::new(move |(_, update): &(String, Vec<u8>)| {
            out_sink.lock().unwrap().push(update.clone());
        }));

    h.shims.open_editor("g10", "shared\n");
    let hsm = h
        .manager
        .get_hsm("g10", "mix.md", Arc::clone(&remote), "shared\n")
        .await;
    let _ = &hsm;

    // A second client, fully caught up.
    let replica = CrdtDoc::new();
    replica
        .apply_update(&remote.encode_state_as_update(None).unwrap(), DocOrigin::Remote)
        .unwrap();

    let editor = h.shims.editor("g10");
    for i in 0..3 {
        // Local typing at the top...
        let event = editor.edit(vec![PositionedChange::insert_at(0, format!("L{} ", i))]);
        hsm.send(event);

        // ...while the replica appends at the bottom and sends its state.
        let end = replica.text().chars().count() as u32;
        replica.apply_changes(
            &[PositionedChange::insert_at(end, format!("R{}\n", i))],
            DocOrigin::SelfEdit,
        );
        hsm.send(Event::RemoteUpdate {
            update: replica.encode_state_as_update(None).unwrap(),
        });

        // Wire traffic reaches the replica.
        for update in outbound.lock().unwrap().drain(..) {
            replica.apply_update(&update, DocOrigin::Remote).unwrap();
        }
    }
    for update in outbound.lock().unwrap().drain(..) {
        replica.apply_update(&update, DocOrigin::Remote).unwrap();
    }

    assert_eq!(editor.text(), replica.text());
    assert_eq!(remote.text(), replica.text());
    assert_eq!(editor.text().matches("shared").count(), 1);
    for i in 0..3 {
        assert!(editor.text().contains(&format!("L{} ", i)));
        assert!(editor.text().contains(&format!("R{}\n", i)));
    }
}

#[tokio::test]
async fn effects_for_one_editor_change_keep_source_order() {
    let h = harness();
    let (_hsm, remote) = bootstrap_synced(&h, "g13", "ord.md", "text\n").await;
    h.shims.open_editor("g13", "text\n");
    let hsm = h
        .manager
        .get_hsm("g13", "ord.md", Arc::clone(&remote), "text\n")
        .await;

    let names = record_effect_names(&hsm);
    let event = h
        .shims
        .editor("g13")
        .edit(vec![PositionedChange::insert_at(0, "! ")]);
    hsm.send(event);

    let names = names.lock().unwrap();
    let sync_pos = names.iter().position(|n| n == "SYNC_TO_REMOTE").unwrap();
    let persist_pos = names.iter().position(|n| n == "PERSIST_UPDATES").unwrap();
    let state_pos = names.iter().position(|n| n == "PERSIST_STATE").unwrap();
    assert!(sync_pos < persist_pos);
    assert!(persist_pos < state_pos);
}

#[tokio::test]
async fn status_map_tracks_documents_and_persists_index() {
    let h = harness();
    let statuses_seen = Arc::new(Mutex::new(0usize));
    let seen = Arc::clone(&statuses_seen);
    h.manager
        .subscribe_statuses(Arc::new(move |batch: &Vec<tandem_core::SyncStatus>| {
            *seen.lock().unwrap() += batch.len();
        }));

    let (_hsm, _remote) = bootstrap_synced(&h, "g14", "st.md", "s\n").await;
    assert!(*statuses_seen.lock().unwrap() >= 1);

    let status = h.manager.status_of("g14").unwrap();
    assert_eq!(status.status, tandem_core::SyncStatusKind::Synced);
    assert_eq!(status.path, "st.md");

    h.manager.persist_index().unwrap();
    let all = h.manager.statuses();
    assert_eq!(all.len(), 1);

    h.manager.unregister("g14").await;
    assert!(h.manager.statuses().is_empty());
}
