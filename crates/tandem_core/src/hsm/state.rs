//! Hierarchical state paths, the transition legality table, and the
//! per-document merge state snapshot.

use crate::crdt::sv_exceeds;
use crate::error::Result;
use crate::types::{
    DeferredConflict, HashFn, LcaState, MergeMetadata, SyncStatus, SyncStatusKind,
};

/// Substates of `idle.*`: which holders moved since the last common ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    /// Persistence is being inspected
    Loading,
    /// Nothing moved
    Synced,
    /// Only the local CRDT moved
    LocalAhead,
    /// Only the remote CRDT moved
    RemoteAhead,
    /// Only disk moved
    DiskAhead,
    /// Two or three holders moved
    Diverged,
    /// A fatal error parked this document
    Error,
}

/// Substates of `active.entering.*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnteringState {
    /// Waiting for local persistence to replay
    AwaitingPersistence,
    /// Persistence was empty; waiting for the provider's first sync
    AwaitingRemote,
    /// Comparing CRDT text to the editor buffer
    Reconciling,
}

/// Substates of `active.merging.*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergingState {
    /// No common ancestor: both sides become user choices
    TwoWay,
    /// A common ancestor exists: attempt an automatic merge
    ThreeWay,
}

/// Substates of `active.conflict.*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictState {
    /// The conflict banner and inline decorations are visible
    BannerShown,
    /// The side-by-side diff view is open
    Resolving,
}

/// Substates of `active.*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    /// Persistence snapshot still loading (lock acquired during load)
    Loading,
    /// Running the entry protocol
    Entering(EnteringState),
    /// Editor, CRDTs, and disk are being kept in step live
    Tracking,
    /// A reconcile merge is running
    Merging(MergingState),
    /// A merge conflict awaits the user
    Conflict(ConflictState),
}

/// Full hierarchical state path of one document's machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatePath {
    /// Machine constructed, nothing loaded
    Unloaded,
    /// Persistence snapshot loading
    Loading,
    /// No editor lock held; local CRDT not in memory
    Idle(IdleState),
    /// Editor lock held; local CRDT in memory
    Active(ActiveState),
    /// Tearing down towards idle or unloaded
    Unloading,
}

impl StatePath {
    /// Whether this is any `active.*` state.
    pub fn is_active(&self) -> bool {
        matches!(self, StatePath::Active(_))
    }

    /// Whether this is any `idle.*` state.
    pub fn is_idle(&self) -> bool {
        matches!(self, StatePath::Idle(_))
    }

    /// Whether the machine is settled in active mode (entry protocol done).
    pub fn is_active_settled(&self) -> bool {
        matches!(
            self,
            StatePath::Active(ActiveState::Tracking) | StatePath::Active(ActiveState::Conflict(_))
        )
    }

    /// Whether events that mutate documents should be accumulated instead of
    /// handled (loading and the active entry protocol).
    pub fn is_accumulating(&self) -> bool {
        matches!(
            self,
            StatePath::Loading
                | StatePath::Active(ActiveState::Loading)
                | StatePath::Active(ActiveState::Entering(_))
        )
    }
}

impl std::fmt::Display for StatePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatePath::Unloaded => "unloaded",
            StatePath::Loading => "loading",
            StatePath::Unloading => "unloading",
            StatePath::Idle(idle) => match idle {
                IdleState::Loading => "idle.loading",
                IdleState::Synced => "idle.synced",
                IdleState::LocalAhead => "idle.localAhead",
                IdleState::RemoteAhead => "idle.remoteAhead",
                IdleState::DiskAhead => "idle.diskAhead",
                IdleState::Diverged => "idle.diverged",
                IdleState::Error => "idle.error",
            },
            StatePath::Active(active) => match active {
                ActiveState::Loading => "active.loading",
                ActiveState::Entering(EnteringState::AwaitingPersistence) => {
                    "active.entering.awaitingPersistence"
                }
                ActiveState::Entering(EnteringState::AwaitingRemote) => {
                    "active.entering.awaitingRemote"
                }
                ActiveState::Entering(EnteringState::Reconciling) => "active.entering.reconciling",
                ActiveState::Tracking => "active.tracking",
                ActiveState::Merging(MergingState::TwoWay) => "active.merging.twoWay",
                ActiveState::Merging(MergingState::ThreeWay) => "active.merging.threeWay",
                ActiveState::Conflict(ConflictState::BannerShown) => "active.conflict.bannerShown",
                ActiveState::Conflict(ConflictState::Resolving) => "active.conflict.resolving",
            },
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for StatePath {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let path = match s {
            "unloaded" => StatePath::Unloaded,
            "loading" => StatePath::Loading,
            "unloading" => StatePath::Unloading,
            "idle.loading" => StatePath::Idle(IdleState::Loading),
            "idle.synced" => StatePath::Idle(IdleState::Synced),
            "idle.localAhead" => StatePath::Idle(IdleState::LocalAhead),
            "idle.remoteAhead" => StatePath::Idle(IdleState::RemoteAhead),
            "idle.diskAhead" => StatePath::Idle(IdleState::DiskAhead),
            "idle.diverged" => StatePath::Idle(IdleState::Diverged),
            "idle.error" => StatePath::Idle(IdleState::Error),
            "active.loading" => StatePath::Active(ActiveState::Loading),
            "active.entering.awaitingPersistence" => {
                StatePath::Active(ActiveState::Entering(EnteringState::AwaitingPersistence))
            }
            "active.entering.awaitingRemote" => {
                StatePath::Active(ActiveState::Entering(EnteringState::AwaitingRemote))
            }
            "active.entering.reconciling" => {
                StatePath::Active(ActiveState::Entering(EnteringState::Reconciling))
            }
            "active.tracking" => StatePath::Active(ActiveState::Tracking),
            "active.merging.twoWay" => StatePath::Active(ActiveState::Merging(MergingState::TwoWay)),
            "active.merging.threeWay" => {
                StatePath::Active(ActiveState::Merging(MergingState::ThreeWay))
            }
            "active.conflict.bannerShown" => {
                StatePath::Active(ActiveState::Conflict(ConflictState::BannerShown))
            }
            "active.conflict.resolving" => {
                StatePath::Active(ActiveState::Conflict(ConflictState::Resolving))
            }
            other => return Err(format!("unknown state path: {}", other)),
        };
        Ok(path)
    }
}

/// Whether a `from -> to` transition is allowed by the state chart.
///
/// An illegal transition is a programming bug; callers panic in debug builds
/// and log in release builds.
pub fn transition_is_legal(from: &StatePath, to: &StatePath) -> bool {
    use ActiveState as A;
    use ConflictState as C;
    use EnteringState as E;
    use StatePath as S;

    // Unloading is reachable from anywhere but itself and unloaded.
    if matches!(to, S::Unloading) {
        return !matches!(from, S::Unloading | S::Unloaded);
    }

    match (from, to) {
        (S::Unloaded, S::Loading) => true,
        (S::Loading, S::Idle(_)) => true,
        (S::Loading, S::Active(A::Loading)) => true,
        (S::Active(A::Loading), S::Active(A::Entering(E::AwaitingPersistence))) => true,
        // Idle re-evaluation, merges, and lock acquisition.
        (S::Idle(_), S::Idle(_)) => true,
        (S::Idle(_), S::Active(A::Entering(E::AwaitingPersistence))) => true,
        // Entry protocol.
        (S::Active(A::Entering(E::AwaitingPersistence)), S::Active(A::Entering(E::Reconciling))) => {
            true
        }
        (
            S::Active(A::Entering(E::AwaitingPersistence)),
            S::Active(A::Entering(E::AwaitingRemote)),
        ) => true,
        (S::Active(A::Entering(E::AwaitingRemote)), S::Active(A::Entering(E::Reconciling))) => true,
        (S::Active(A::Entering(E::Reconciling)), S::Active(A::Tracking)) => true,
        (S::Active(A::Entering(E::Reconciling)), S::Active(A::Merging(_))) => true,
        // Merge outcomes.
        (S::Active(A::Merging(_)), S::Active(A::Tracking)) => true,
        (S::Active(A::Merging(_)), S::Active(A::Conflict(C::BannerShown))) => true,
        // Conflict flow.
        (S::Active(A::Conflict(C::BannerShown)), S::Active(A::Conflict(C::Resolving))) => true,
        (S::Active(A::Conflict(C::Resolving)), S::Active(A::Conflict(C::BannerShown))) => true,
        (S::Active(A::Conflict(_)), S::Active(A::Tracking)) => true,
        // Teardown lands in idle or unloaded.
        (S::Unloading, S::Idle(_)) => true,
        (S::Unloading, S::Unloaded) => true,
        _ => false,
    }
}

/// Snapshot of one document's merge state.
#[derive(Debug, Clone)]
pub struct MergeState {
    /// Stable document id
    pub guid: String,
    /// Current virtual path
    pub path: String,
    /// Last common ancestor
    pub lca: Option<LcaState>,
    /// Last observed disk metadata
    pub disk: Option<MergeMetadata>,
    /// Encoded local CRDT state vector
    pub local_state_vector: Vec<u8>,
    /// Encoded remote CRDT state vector
    pub remote_state_vector: Vec<u8>,
    /// Current hierarchical state path
    pub state_path: StatePath,
    /// Error description when parked in an error state
    pub error: Option<String>,
    /// Dismissed conflict pair
    pub deferred_conflict: Option<DeferredConflict>,
    /// Advisory connectivity flag; never gates transitions
    pub is_online: bool,
    /// Editor buffer captured at lock acquisition, until reconciled
    pub pending_editor_content: Option<String>,
    /// Last text known to be displayed by the editor
    pub last_known_editor_text: Option<String>,
}

impl MergeState {
    /// Fresh state for a newly registered document.
    pub fn new(guid: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            path: path.into(),
            lca: None,
            disk: None,
            local_state_vector: Vec::new(),
            remote_state_vector: Vec::new(),
            state_path: StatePath::Unloaded,
            error: None,
            deferred_conflict: None,
            is_online: false,
            pending_editor_content: None,
            last_known_editor_text: None,
        }
    }

    /// Derive the observable status from this snapshot.
    pub fn sync_status(&self) -> SyncStatus {
        let status = if self.error.is_some() || self.state_path == StatePath::Idle(IdleState::Error)
        {
            SyncStatusKind::Error
        } else {
            match self.state_path {
                StatePath::Active(ActiveState::Conflict(_)) => SyncStatusKind::Conflict,
                StatePath::Idle(IdleState::Diverged) => SyncStatusKind::Conflict,
                StatePath::Idle(IdleState::Synced) => SyncStatusKind::Synced,
                StatePath::Active(ActiveState::Tracking)
                    if self.local_state_vector == self.remote_state_vector =>
                {
                    SyncStatusKind::Synced
                }
                _ => SyncStatusKind::Pending,
            }
        };
        SyncStatus {
            guid: self.guid.clone(),
            path: self.path.clone(),
            status,
            disk_mtime: self.disk.as_ref().map(|d| d.mtime),
            local_state_vector: self.local_state_vector.clone(),
            remote_state_vector: self.remote_state_vector.clone(),
        }
    }
}

/// Pick the idle substate by comparing local SV, remote SV, and disk hash to
/// the last common ancestor.
pub fn select_idle_substate(state: &MergeState, hash_fn: &HashFn) -> Result<IdleState> {
    let (lca_sv, lca_hash): (&[u8], String) = match &state.lca {
        Some(lca) => (&lca.state_vector, lca.meta.hash.clone()),
        None => (&[], hash_fn("")),
    };

    let local_changed = sv_exceeds(&state.local_state_vector, lca_sv)?;
    let remote_changed = sv_exceeds(&state.remote_state_vector, lca_sv)?;
    let disk_changed = state
        .disk
        .as_ref()
        .is_some_and(|disk| disk.hash != lca_hash);

    let substate = match (local_changed, disk_changed, remote_changed) {
        (false, false, false) => IdleState::Synced,
        (true, false, false) => IdleState::LocalAhead,
        (false, true, false) => IdleState::DiskAhead,
        (false, false, true) => IdleState::RemoteAhead,
        _ => IdleState::Diverged,
    };
    Ok(substate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{content_hash, default_hash_fn};
    use std::str::FromStr;

    #[test]
    fn test_display_round_trips_every_state() {
        let all = [
            StatePath::Unloaded,
            StatePath::Loading,
            StatePath::Unloading,
            StatePath::Idle(IdleState::Loading),
            StatePath::Idle(IdleState::Synced),
            StatePath::Idle(IdleState::LocalAhead),
            StatePath::Idle(IdleState::RemoteAhead),
            StatePath::Idle(IdleState::DiskAhead),
            StatePath::Idle(IdleState::Diverged),
            StatePath::Idle(IdleState::Error),
            StatePath::Active(ActiveState::Loading),
            StatePath::Active(ActiveState::Entering(EnteringState::AwaitingPersistence)),
            StatePath::Active(ActiveState::Entering(EnteringState::AwaitingRemote)),
            StatePath::Active(ActiveState::Entering(EnteringState::Reconciling)),
            StatePath::Active(ActiveState::Tracking),
            StatePath::Active(ActiveState::Merging(MergingState::TwoWay)),
            StatePath::Active(ActiveState::Merging(MergingState::ThreeWay)),
            StatePath::Active(ActiveState::Conflict(ConflictState::BannerShown)),
            StatePath::Active(ActiveState::Conflict(ConflictState::Resolving)),
        ];
        for path in all {
            let text = path.to_string();
            assert_eq!(StatePath::from_str(&text).unwrap(), path, "{}", text);
        }
        assert!(StatePath::from_str("idle.bogus").is_err());
    }

    #[test]
    fn test_transition_table_basics() {
        use ActiveState as A;
        use StatePath as S;

        assert!(transition_is_legal(&S::Unloaded, &S::Loading));
        assert!(transition_is_legal(
            &S::Loading,
            &S::Idle(IdleState::Loading)
        ));
        assert!(transition_is_legal(&S::Loading, &S::Active(A::Loading)));
        assert!(transition_is_legal(
            &S::Idle(IdleState::Synced),
            &S::Active(A::Entering(EnteringState::AwaitingPersistence))
        ));
        assert!(transition_is_legal(
            &S::Active(A::Tracking),
            &S::Unloading
        ));
        assert!(transition_is_legal(
            &S::Unloading,
            &S::Idle(IdleState::Synced)
        ));
        assert!(transition_is_legal(&S::Unloading, &S::Unloaded));

        // Illegal jumps.
        assert!(!transition_is_legal(&S::Unloaded, &S::Active(A::Tracking)));
        assert!(!transition_is_legal(
            &S::Idle(IdleState::Synced),
            &S::Active(A::Tracking)
        ));
        assert!(!transition_is_legal(&S::Unloading, &S::Unloading));
        assert!(!transition_is_legal(
            &S::Active(A::Tracking),
            &S::Idle(IdleState::Synced)
        ));
    }

    fn state_with(lca: Option<LcaState>) -> MergeState {
        let mut state = MergeState::new("g", "p.md");
        state.lca = lca;
        state
    }

    fn lca_for(contents: &str, sv: Vec<u8>) -> LcaState {
        LcaState {
            contents: contents.to_string(),
            meta: MergeMetadata {
                hash: content_hash(contents),
                mtime: 100,
            },
            state_vector: sv,
        }
    }

    #[test]
    fn test_idle_substate_selection_truth_table() {
        use crate::crdt::{CrdtDoc, DocOrigin};

        let hash_fn = default_hash_fn();

        // Build real state vectors: base, then one ahead of it.
        let doc = CrdtDoc::new();
        doc.set_text("base", DocOrigin::SelfEdit);
        let sv_base = doc.state_vector();
        doc.set_text("base more", DocOrigin::SelfEdit);
        let sv_ahead = doc.state_vector();

        let mut state = state_with(Some(lca_for("contents\n", sv_base.clone())));
        state.local_state_vector = sv_base.clone();
        state.remote_state_vector = sv_base.clone();
        state.disk = Some(MergeMetadata {
            hash: content_hash("contents\n"),
            mtime: 100,
        });
        assert_eq!(
            select_idle_substate(&state, &hash_fn).unwrap(),
            IdleState::Synced
        );

        state.local_state_vector = sv_ahead.clone();
        assert_eq!(
            select_idle_substate(&state, &hash_fn).unwrap(),
            IdleState::LocalAhead
        );

        state.local_state_vector = sv_base.clone();
        state.remote_state_vector = sv_ahead.clone();
        assert_eq!(
            select_idle_substate(&state, &hash_fn).unwrap(),
            IdleState::RemoteAhead
        );

        state.remote_state_vector = sv_base.clone();
        state.disk = Some(MergeMetadata {
            hash: content_hash("changed on disk\n"),
            mtime: 200,
        });
        assert_eq!(
            select_idle_substate(&state, &hash_fn).unwrap(),
            IdleState::DiskAhead
        );

        state.remote_state_vector = sv_ahead;
        assert_eq!(
            select_idle_substate(&state, &hash_fn).unwrap(),
            IdleState::Diverged
        );
    }

    #[test]
    fn test_idle_substate_without_lca() {
        let hash_fn = default_hash_fn();
        let mut state = state_with(None);
        assert_eq!(
            select_idle_substate(&state, &hash_fn).unwrap(),
            IdleState::Synced
        );

        // Disk content present and non-empty counts as disk ahead.
        state.disk = Some(MergeMetadata {
            hash: content_hash("something\n"),
            mtime: 10,
        });
        assert_eq!(
            select_idle_substate(&state, &hash_fn).unwrap(),
            IdleState::DiskAhead
        );
    }

    #[test]
    fn test_sync_status_derivation() {
        let mut state = MergeState::new("g", "notes/a.md");
        state.state_path = StatePath::Idle(IdleState::Synced);
        assert_eq!(state.sync_status().status, SyncStatusKind::Synced);

        state.state_path = StatePath::Idle(IdleState::Diverged);
        assert_eq!(state.sync_status().status, SyncStatusKind::Conflict);

        state.state_path = StatePath::Active(ActiveState::Conflict(ConflictState::BannerShown));
        assert_eq!(state.sync_status().status, SyncStatusKind::Conflict);

        state.state_path = StatePath::Active(ActiveState::Tracking);
        assert_eq!(state.sync_status().status, SyncStatusKind::Synced);
        state.local_state_vector = vec![1];
        assert_eq!(state.sync_status().status, SyncStatusKind::Pending);

        state.error = Some("boom".to_string());
        assert_eq!(state.sync_status().status, SyncStatusKind::Error);
    }
}
