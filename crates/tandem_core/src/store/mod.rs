//! Path→metadata overlay store coordinating legacy and new file layouts.

mod meta;
mod sync_store;

pub use meta::{BinaryFields, Meta, MetaKind, TypeRegistry};
pub use sync_store::SyncStore;
