//! CRDT document layer: the Y.Doc wrapper, structural diffing, and the
//! line-based three-way merge used by reconciliation.

mod diff;
mod doc;
mod three_way;

pub use diff::{apply_positioned, positioned_changes};
pub use doc::{
    CrdtDoc, DocOrigin, EditSink, ObservedEdit, TEXT_NAME, decode_state_vector, is_noop_update,
    merge_updates, state_vector_of_update, sv_equal, sv_exceeds, text_of_update,
};
pub use three_way::{MergeOutput, MergeSection, three_way_merge};
