//! Event and effect vocabulary of the per-document state machine.

use crate::persistence::PersistedMergeState;
use crate::types::{
    ConflictRegion, LcaState, PositionedChange, PositionedRegion, SyncStatus,
};

use super::state::StatePath;

/// How a single conflict hunk should be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HunkResolution {
    /// Keep the local side
    Local,
    /// Keep the remote side
    Remote,
    /// Keep both, local first
    Both,
}

/// Result data of a successful non-interactive merge, computed off-thread and
/// folded into the machine by the `MergeSuccess` event.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Contents to write to disk, if disk needs updating
    pub write_disk: Option<String>,
    /// Delta to send to the remote, if the remote is missing operations
    pub sync_to_remote: Option<Vec<u8>>,
    /// Delta to append to local persistence
    pub persist_update: Option<Vec<u8>>,
    /// Local state vector after the merge
    pub new_local_sv: Option<Vec<u8>>,
    /// Client id adopted by the merge, to record for later sessions
    pub new_client_id: Option<u64>,
}

/// Everything that can happen to one document.
#[derive(Debug, Clone)]
pub enum Event {
    // ==================== External ====================
    /// Begin loading persisted state for this document
    Load {
        /// Stable document id
        guid: String,
        /// Current virtual path
        path: String,
    },
    /// Tear the machine down to `unloaded`
    Unload,
    /// The editor opened this document and holds the lock
    AcquireLock {
        /// Editor buffer contents at open time
        editor_content: String,
    },
    /// The editor closed this document
    ReleaseLock,
    /// The file on disk changed outside of our own writes
    DiskChanged {
        /// New file contents
        contents: String,
        /// File modification time (ms)
        mtime: i64,
        /// Content digest
        hash: String,
    },
    /// An update arrived from the remote document
    RemoteUpdate {
        /// Encoded CRDT update
        update: Vec<u8>,
    },
    /// Our own disk write completed
    SaveComplete {
        /// File modification time (ms)
        mtime: i64,
        /// Content digest
        hash: String,
    },
    /// The editor buffer changed
    EditorChange {
        /// Positioned changes against the previous buffer
        changes: Vec<PositionedChange>,
        /// Full buffer text after the change
        doc_text: String,
        /// Whether the change was our own dispatch echoed back
        is_from_crdt: bool,
    },
    /// The provider finished its initial sync
    ProviderSynced,
    /// Connectivity gained
    Connected,
    /// Connectivity lost
    Disconnected,

    // ==================== User ====================
    /// Resolve the whole conflict by taking the disk side
    ResolveAcceptDisk,
    /// Resolve the whole conflict by keeping the local side
    ResolveAcceptLocal,
    /// Resolve the whole conflict with hand-merged contents
    ResolveAcceptMerged {
        /// The merged contents
        contents: String,
    },
    /// Resolve one conflict hunk inline
    ResolveHunk {
        /// Region index
        index: usize,
        /// Which side(s) to keep
        resolution: HunkResolution,
    },
    /// Dismiss the conflict banner, deferring the conflict
    DismissConflict,
    /// Open the side-by-side diff view
    OpenDiffView,
    /// Close the diff view without resolving
    Cancel,

    // ==================== Internal ====================
    /// Persisted snapshot and update log have been read
    PersistenceLoaded {
        /// The persisted merge state, if one was stored
        persisted: Option<PersistedMergeState>,
        /// State vector reconstructed from the stored update log
        local_sv: Vec<u8>,
    },
    /// The active-entry persistence replay finished
    PersistenceSynced {
        /// Whether the database replayed non-empty history
        has_content: bool,
        /// The stored update log, to apply to the fresh local doc
        updates: Vec<Vec<u8>>,
    },
    /// A non-interactive merge finished cleanly
    MergeSuccess {
        /// LCA to advance to, when merging in idle
        new_lca: Option<LcaState>,
        /// Effects and state-vector bookkeeping
        outcome: MergeOutcome,
    },
    /// A non-interactive merge hit conflicting hunks
    MergeConflict {
        /// Merge base
        base: String,
        /// Local side
        local: String,
        /// Remote side
        remote: String,
    },
    /// The shared remote document changed out-of-band
    RemoteDocUpdated,
    /// Teardown finished; fold results and settle
    CleanupComplete {
        /// LCA advanced at teardown, if content was stable
        new_lca: Option<LcaState>,
        /// Final local state vector captured before the doc was dropped
        final_state_vector: Vec<u8>,
        /// Whether to settle in `unloaded` instead of idle
        to_unloaded: bool,
    },
    /// An async operation failed
    Error {
        /// Description of the failure
        message: String,
    },
    /// Settle into an idle substate
    SetModeIdle,
    /// Settle into active mode
    SetModeActive,
}

impl Event {
    /// Short name for logs and transition records.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Load { .. } => "LOAD",
            Event::Unload => "UNLOAD",
            Event::AcquireLock { .. } => "ACQUIRE_LOCK",
            Event::ReleaseLock => "RELEASE_LOCK",
            Event::DiskChanged { .. } => "DISK_CHANGED",
            Event::RemoteUpdate { .. } => "REMOTE_UPDATE",
            Event::SaveComplete { .. } => "SAVE_COMPLETE",
            Event::EditorChange { .. } => "EDITOR_CHANGE",
            Event::ProviderSynced => "PROVIDER_SYNCED",
            Event::Connected => "CONNECTED",
            Event::Disconnected => "DISCONNECTED",
            Event::ResolveAcceptDisk => "RESOLVE_ACCEPT_DISK",
            Event::ResolveAcceptLocal => "RESOLVE_ACCEPT_LOCAL",
            Event::ResolveAcceptMerged { .. } => "RESOLVE_ACCEPT_MERGED",
            Event::ResolveHunk { .. } => "RESOLVE_HUNK",
            Event::DismissConflict => "DISMISS_CONFLICT",
            Event::OpenDiffView => "OPEN_DIFF_VIEW",
            Event::Cancel => "CANCEL",
            Event::PersistenceLoaded { .. } => "PERSISTENCE_LOADED",
            Event::PersistenceSynced { .. } => "PERSISTENCE_SYNCED",
            Event::MergeSuccess { .. } => "MERGE_SUCCESS",
            Event::MergeConflict { .. } => "MERGE_CONFLICT",
            Event::RemoteDocUpdated => "REMOTE_DOC_UPDATED",
            Event::CleanupComplete { .. } => "CLEANUP_COMPLETE",
            Event::Error { .. } => "ERROR",
            Event::SetModeIdle => "SET_MODE_IDLE",
            Event::SetModeActive => "SET_MODE_ACTIVE",
        }
    }
}

/// Declarative side effects emitted by the machine and executed by the
/// integration shims.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Apply positioned changes to the editor buffer
    DispatchEditor {
        /// Changes against the editor's current text
        changes: Vec<PositionedChange>,
    },
    /// Write contents to the file on disk
    WriteDisk {
        /// Vault path to write
        path: String,
        /// Full file contents
        contents: String,
    },
    /// Persist the merge-state snapshot
    PersistState {
        /// Document guid
        guid: String,
        /// Snapshot to store under the `state` sidecar key
        state: PersistedMergeState,
    },
    /// Append a CRDT update to local persistence
    PersistUpdates {
        /// Database name
        db_name: String,
        /// Encoded update
        update: Vec<u8>,
    },
    /// Send a CRDT update to the remote
    SyncToRemote {
        /// Encoded update
        update: Vec<u8>,
    },
    /// The observable status changed
    StatusChanged {
        /// Document guid
        guid: String,
        /// New status
        status: SyncStatus,
    },
    /// Show inline conflict decorations
    ShowConflictDecorations {
        /// Conflict regions
        regions: Vec<ConflictRegion>,
        /// Offsets of each region in the local text
        positions: Vec<PositionedRegion>,
    },
    /// Hide the decoration for one resolved hunk
    HideConflictDecoration {
        /// Region index
        index: usize,
    },
}

impl Effect {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Effect::DispatchEditor { .. } => "DISPATCH_EDITOR",
            Effect::WriteDisk { .. } => "WRITE_DISK",
            Effect::PersistState { .. } => "PERSIST_STATE",
            Effect::PersistUpdates { .. } => "PERSIST_UPDATES",
            Effect::SyncToRemote { .. } => "SYNC_TO_REMOTE",
            Effect::StatusChanged { .. } => "STATUS_CHANGED",
            Effect::ShowConflictDecorations { .. } => "SHOW_CONFLICT_DECORATIONS",
            Effect::HideConflictDecoration { .. } => "HIDE_CONFLICT_DECORATION",
        }
    }
}

/// One observed transition: `(from, to, event)`.
#[derive(Debug, Clone)]
pub struct Transition {
    /// State before
    pub from: StatePath,
    /// State after
    pub to: StatePath,
    /// Name of the event that caused it
    pub event: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(Event::Unload.name(), "UNLOAD");
        assert_eq!(
            Event::AcquireLock {
                editor_content: String::new()
            }
            .name(),
            "ACQUIRE_LOCK"
        );
        assert_eq!(Event::SetModeIdle.name(), "SET_MODE_IDLE");
    }

    #[test]
    fn test_effect_names() {
        assert_eq!(
            Effect::DispatchEditor { changes: vec![] }.name(),
            "DISPATCH_EDITOR"
        );
        assert_eq!(
            Effect::SyncToRemote { update: vec![] }.name(),
            "SYNC_TO_REMOTE"
        );
    }
}
