//! The per-document hierarchical merge state machine.
//!
//! # Structure
//!
//! - `state`: state paths, the transition table, idle substate selection
//! - `event`: the event/effect vocabulary
//! - `machine`: the machine itself: `send`, loading, teardown
//! - `active`: entry protocol, reconciliation, live tracking
//! - `idle_merge`: non-interactive merges while no lock is held
//! - `conflict`: conflict surfacing and resolution
//! - `tasks`: cancellable async operations, one pending per category

mod active;
mod conflict;
mod event;
mod idle_merge;
mod machine;
mod state;
mod tasks;

pub use conflict::ConflictData;
pub use event::{Effect, Event, HunkResolution, MergeOutcome, Transition};
pub use machine::{HsmContext, MergeHsm};
pub use state::{
    ActiveState, ConflictState, EnteringState, IdleState, MergeState, MergingState, StatePath,
    select_idle_substate, transition_is_legal,
};
pub use tasks::{CancelFlag, OpRegistry};
