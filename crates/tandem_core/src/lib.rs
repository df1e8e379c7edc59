//! Core library for Tandem: document synchronization for collaborative notes.
//!
//! Per document, four state holders can diverge: the file on disk, the open
//! editor buffer, the locally persisted CRDT, and the remote CRDT maintained
//! by the sync server. This crate keeps them mutually consistent through a
//! hierarchical state machine per document ([`hsm::MergeHsm`]), a registry
//! that owns those machines ([`manager::MergeManager`]), a refreshing
//! credential cache ([`token_store::TokenStore`]), and a path/metadata
//! overlay store that survives folder renames from legacy clients
//! ([`store::SyncStore`]).
//!
//! Disk, editor, provider, and persistence are reached through injected
//! adapters; in-memory doubles for all of them ship in [`adapters`] and
//! [`persistence`].
#![warn(missing_docs)]

/// Error (common error types)
pub mod error;

/// Injectable clock and timers
pub mod time;

/// Synchronous multicast observables
pub mod observable;

/// Shared data types (digests, LCA, status, positioned changes)
pub mod types;

/// CRDT document layer: doc wrapper, diffing, three-way merge
pub mod crdt;

/// Per-document persistence and the persisted merge-state snapshot
pub mod persistence;

/// Bounded, refreshing credential cache
pub mod token_store;

/// Path→metadata overlay store
pub mod store;

/// The per-document merge state machine
pub mod hsm;

/// Registry and lifecycle of per-document machines
pub mod manager;

/// Integration shims and in-memory doubles
pub mod adapters;

pub use error::{Result, SerializableError, TandemError};
pub use hsm::{Effect, Event, HsmContext, MergeHsm, StatePath};
pub use manager::{ManagerConfig, MergeManager};
pub use store::{Meta, SyncStore};
pub use token_store::TokenStore;
pub use types::{SyncStatus, SyncStatusKind};
