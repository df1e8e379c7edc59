//! Core data types shared across the synchronization system.
//!
//! These are the serialized building blocks: content digests, the last common
//! ancestor, per-document sync status, and the editor-facing change/region
//! types exported as TypeScript bindings for the plugin shell.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ts_rs::TS;

/// What we know about a file on disk: content digest plus modification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMetadata {
    /// Hex-encoded SHA-256 digest of the file contents
    pub hash: String,
    /// Unix timestamp of last modification (milliseconds)
    pub mtime: i64,
}

impl MergeMetadata {
    /// Create metadata from raw contents and a modification time.
    pub fn from_contents(contents: &str, mtime: i64) -> Self {
        Self {
            hash: content_hash(contents),
            mtime,
        }
    }
}

/// The last agreed base for three-way merges.
///
/// The LCA captures the exact point where disk, local CRDT, and remote CRDT
/// were last known to agree: its contents, the disk metadata at that moment,
/// and the CRDT state vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LcaState {
    /// Full document text at the agreement point
    pub contents: String,
    /// Disk metadata at the agreement point
    pub meta: MergeMetadata,
    /// Encoded CRDT state vector at the agreement point
    #[serde(with = "serde_bytes_base64")]
    pub state_vector: Vec<u8>,
}

/// A dismissed conflict, remembered by content so the same pair of sides is
/// not surfaced again until one of them changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredConflict {
    /// Digest of the disk-side content at dismissal
    pub disk_hash: String,
    /// Digest of the local-side content at dismissal
    pub local_hash: String,
}

/// Coarse sync state of one document, as shown in the file browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum SyncStatusKind {
    /// All four holders agree
    Synced,
    /// Work is queued or in flight
    Pending,
    /// A conflict needs user attention
    Conflict,
    /// The document is in an error state
    Error,
}

/// Observable per-document status, derived from the state machine snapshot
/// and emitted on every transition that changes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SyncStatus {
    /// Stable document id
    pub guid: String,
    /// Current virtual path inside the shared folder
    pub path: String,
    /// Coarse status bucket
    pub status: SyncStatusKind,
    /// Last observed disk mtime, if any
    pub disk_mtime: Option<i64>,
    /// Encoded local CRDT state vector
    pub local_state_vector: Vec<u8>,
    /// Encoded remote CRDT state vector
    pub remote_state_vector: Vec<u8>,
}

/// An editor-level edit description: replace `from..to` with `insert`.
///
/// Offsets are character offsets (Unicode scalar values) into the document
/// the change list was computed against, the unit the CRDT text indexes by;
/// a pure insertion has `from == to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PositionedChange {
    /// Start of the replaced range
    pub from: u32,
    /// End of the replaced range (exclusive)
    pub to: u32,
    /// Replacement text (empty for a deletion)
    pub insert: String,
}

impl PositionedChange {
    /// Create an insertion at `pos`.
    pub fn insert_at(pos: u32, text: impl Into<String>) -> Self {
        Self {
            from: pos,
            to: pos,
            insert: text.into(),
        }
    }

    /// Create a deletion of `from..to`.
    pub fn delete(from: u32, to: u32) -> Self {
        Self {
            from,
            to,
            insert: String::new(),
        }
    }
}

/// A contiguous conflict produced by line-oriented three-way merge.
///
/// `local` and `remote` carry the candidate texts without a trailing newline;
/// `base_start..base_end` is the line range in the merge base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ConflictRegion {
    /// First base line of the conflict
    pub base_start: u32,
    /// One past the last base line of the conflict
    pub base_end: u32,
    /// Local-side candidate text
    pub local: String,
    /// Remote-side candidate text
    pub remote: String,
}

/// Character-offset range of a conflict region within the local document text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PositionedRegion {
    /// Start offset of the region's local-side content
    pub from: u32,
    /// End offset (exclusive), excluding the region's trailing newline
    pub to: u32,
}

/// Credentials for one document's provider connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientToken {
    /// WebSocket endpoint for the document
    pub url: String,
    /// Server-side document id
    pub doc_id: String,
    /// Bearer token (usually a JWT)
    pub token: String,
    /// Expiry in epoch milliseconds, when the server includes it
    pub expiry_time: Option<i64>,
}

/// Injectable content digest function.
pub type HashFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Default content digest: hex-encoded SHA-256.
pub fn content_hash(contents: &str) -> String {
    let digest = Sha256::digest(contents.as_bytes());
    hex::encode(digest)
}

/// The default [`HashFn`].
pub fn default_hash_fn() -> HashFn {
    Arc::new(|contents| content_hash(contents))
}

/// Base64 transport for opaque byte strings inside JSON-persisted state.
///
/// State vectors are small but binary; base64 keeps the persisted KV payload
/// valid UTF-8 JSON the way the sidecar store expects.
pub(crate) mod serde_bytes_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
