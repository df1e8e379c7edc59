//! CRDT document wrapper.
//!
//! `CrdtDoc` wraps a Y.Doc holding a single Y.Text named `contents`, with
//! origin-tagged transactions so observers can tell local edits from remote
//! ones, v1 update/state-vector codecs, and a minimal-diff `set_text` that
//! never replaces the whole document.

use std::sync::{Arc, Mutex};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, Observable, Origin, ReadTxn, StateVector, Text, Transact, Update,
};

use crate::error::{Result, TandemError};
use crate::types::PositionedChange;

/// Name of the Y.Text holding the document content.
pub const TEXT_NAME: &str = "contents";

/// An encoded update that carries no operations (Yjs v1 empty form).
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Transaction origin, routing observer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocOrigin {
    /// The user edited this replica
    SelfEdit,
    /// The change arrived from the remote document
    Remote,
    /// Internal bookkeeping (persistence replay, scratch reconstruction)
    System,
}

impl DocOrigin {
    fn tag(&self) -> &'static str {
        match self {
            DocOrigin::SelfEdit => "self",
            DocOrigin::Remote => "remote",
            DocOrigin::System => "system",
        }
    }

    fn origin(&self) -> Origin {
        Origin::from(self.tag())
    }

    fn from_txn_origin(origin: Option<&Origin>) -> Option<DocOrigin> {
        let origin = origin?;
        for candidate in [DocOrigin::SelfEdit, DocOrigin::Remote, DocOrigin::System] {
            if *origin == candidate.origin() {
                return Some(candidate);
            }
        }
        None
    }
}

/// One observed Y.Text transaction, translated to positioned changes.
#[derive(Debug, Clone)]
pub struct ObservedEdit {
    /// Origin of the transaction, if it was tagged
    pub origin: Option<DocOrigin>,
    /// Positioned changes against the pre-transaction text
    pub changes: Vec<PositionedChange>,
}

/// Queue filled by the text observer and drained by the state machine after
/// each transaction. Observers must not call back into the machine directly:
/// they run inside the transaction, while the machine's lock is held.
pub type EditSink = Arc<Mutex<Vec<ObservedEdit>>>;

/// A Y.Doc holding one collaborative text.
pub struct CrdtDoc {
    doc: Doc,
    text: yrs::TextRef,
}

impl CrdtDoc {
    /// Create a new empty document with a fresh client id.
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self { doc, text }
    }

    /// Create a new empty document reusing a previously recorded client id.
    ///
    /// Reusing the client id prevents content duplication when local
    /// persistence has been cleared between sessions: edits replayed from the
    /// remote carry the same operation identity as the ones we would re-create.
    pub fn with_client_id(client_id: u64) -> Self {
        let doc = Doc::with_client_id(client_id);
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self { doc, text }
    }

    /// This replica's client id.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Get the full document text.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Length of the document text in characters (Unicode scalar values),
    /// the unit Y.Text indexes by.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    /// Whether the document text is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode the current state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the state as an update, optionally as a delta against `from_sv`.
    pub fn encode_state_as_update(&self, from_sv: Option<&[u8]>) -> Result<Vec<u8>> {
        let sv = match from_sv {
            Some(bytes) => decode_state_vector(bytes)?,
            None => StateVector::default(),
        };
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an encoded update inside a transaction tagged with `origin`.
    pub fn apply_update(&self, update: &[u8], origin: DocOrigin) -> Result<()> {
        if is_noop_update(update) {
            return Ok(());
        }
        let decoded = Update::decode_v1(update)
            .map_err(|e| TandemError::Crdt(format!("Failed to decode update: {}", e)))?;
        let mut txn = self.doc.transact_mut_with(origin.origin());
        txn.apply_update(decoded)
            .map_err(|e| TandemError::Crdt(format!("Failed to apply update: {}", e)))?;
        Ok(())
    }

    /// Apply a positioned change list in a single transaction.
    ///
    /// Offsets are character offsets against the pre-change text (editor
    /// change-set semantics), matching Y.Text's own indexing; changes are
    /// applied back to front so earlier offsets stay valid.
    pub fn apply_changes(&self, changes: &[PositionedChange], origin: DocOrigin) {
        if changes.is_empty() {
            return;
        }
        let mut ordered: Vec<&PositionedChange> = changes.iter().collect();
        ordered.sort_by_key(|c| c.from);

        let mut txn = self.doc.transact_mut_with(origin.origin());
        for change in ordered.iter().rev() {
            if change.to > change.from {
                self.text
                    .remove_range(&mut txn, change.from, change.to - change.from);
            }
            if !change.insert.is_empty() {
                self.text.insert(&mut txn, change.from, &change.insert);
            }
        }
    }

    /// Set the document text via a structural diff, in one transaction.
    ///
    /// Returns `true` if the document changed.
    pub fn set_text(&self, new_text: &str, origin: DocOrigin) -> bool {
        let current = self.text();
        if current == new_text {
            return false;
        }
        let mut txn = self.doc.transact_mut_with(origin.origin());
        super::diff::apply_text_diff(&self.text, &mut txn, &current, new_text);
        true
    }

    /// Observe text changes, pushing positioned-change records into `sink`.
    ///
    /// Delta retain/delete counts arrive in Y.Text's native character units,
    /// so the produced offsets are character offsets as well.
    ///
    /// The returned subscription must be kept alive for the observer to fire.
    pub fn observe_edits(&self, sink: EditSink) -> yrs::Subscription {
        self.text.observe(move |txn, event| {
            let mut changes = Vec::new();
            let mut pos: u32 = 0;
            for delta in event.delta(txn) {
                match delta {
                    yrs::types::Delta::Retain(len, _) => {
                        pos += len;
                    }
                    yrs::types::Delta::Inserted(value, _) => {
                        let inserted = match value {
                            yrs::Value::Any(Any::String(s)) => s.to_string(),
                            other => {
                                log::warn!("[CrdtDoc] Non-string insert in text delta: {:?}", other);
                                String::new()
                            }
                        };
                        if !inserted.is_empty() {
                            changes.push(PositionedChange::insert_at(pos, inserted));
                        }
                    }
                    yrs::types::Delta::Deleted(len) => {
                        changes.push(PositionedChange::delete(pos, pos + len));
                        pos += len;
                    }
                }
            }
            if !changes.is_empty() {
                let origin = DocOrigin::from_txn_origin(txn.origin());
                let mut queue = sink.lock().unwrap();
                queue.push(ObservedEdit { origin, changes });
            }
        })
    }
}

impl Default for CrdtDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CrdtDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtDoc")
            .field("client_id", &self.client_id())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Whether an encoded update carries no operations.
pub fn is_noop_update(update: &[u8]) -> bool {
    update.is_empty() || update == EMPTY_UPDATE
}

/// Decode an encoded v1 state vector.
pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector> {
    if bytes.is_empty() {
        return Ok(StateVector::default());
    }
    StateVector::decode_v1(bytes)
        .map_err(|e| TandemError::Crdt(format!("Failed to decode state vector: {}", e)))
}

/// Merge encoded updates into a single encoded update.
pub fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut decoded = Vec::with_capacity(updates.len());
    for update in updates {
        if is_noop_update(update) {
            continue;
        }
        decoded.push(
            Update::decode_v1(update)
                .map_err(|e| TandemError::Crdt(format!("Failed to decode update: {}", e)))?,
        );
    }
    if decoded.is_empty() {
        return Ok(EMPTY_UPDATE.to_vec());
    }
    Ok(Update::merge_updates(decoded).encode_v1())
}

/// Materialize the text content an encoded update reconstructs.
pub fn text_of_update(update: &[u8]) -> Result<String> {
    let doc = CrdtDoc::new();
    doc.apply_update(update, DocOrigin::System)?;
    Ok(doc.text())
}

/// State vector of the document an encoded update reconstructs.
pub fn state_vector_of_update(update: &[u8]) -> Result<Vec<u8>> {
    let doc = CrdtDoc::new();
    doc.apply_update(update, DocOrigin::System)?;
    Ok(doc.state_vector())
}

/// Whether state vector `a` has any client clock exceeding `b`.
pub fn sv_exceeds(a: &[u8], b: &[u8]) -> Result<bool> {
    let a = decode_state_vector(a)?;
    let b = decode_state_vector(b)?;
    for (client, clock) in a.iter() {
        if *clock > b.get(client) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether two encoded state vectors describe the same clocks.
pub fn sv_equal(a: &[u8], b: &[u8]) -> Result<bool> {
    Ok(!sv_exceeds(a, b)? && !sv_exceeds(b, a)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_doc_is_empty() {
        let doc = CrdtDoc::new();
        assert_eq!(doc.text(), "");
        assert!(doc.is_empty());
    }

    #[test]
    fn test_set_text_and_read_back() {
        let doc = CrdtDoc::new();
        assert!(doc.set_text("# Hello\n\nWorld", DocOrigin::SelfEdit));
        assert_eq!(doc.text(), "# Hello\n\nWorld");
        // No-op set returns false.
        assert!(!doc.set_text("# Hello\n\nWorld", DocOrigin::SelfEdit));
    }

    #[test]
    fn test_with_client_id_is_stable() {
        let doc = CrdtDoc::with_client_id(42);
        assert_eq!(doc.client_id(), 42);
    }

    #[test]
    fn test_apply_changes_back_to_front() {
        let doc = CrdtDoc::new();
        doc.set_text("one two three", DocOrigin::SelfEdit);
        doc.apply_changes(
            &[
                PositionedChange {
                    from: 0,
                    to: 3,
                    insert: "1".to_string(),
                },
                PositionedChange::insert_at(13, "!"),
            ],
            DocOrigin::SelfEdit,
        );
        assert_eq!(doc.text(), "1 two three!");
    }

    #[test]
    fn test_update_exchange_converges() {
        let a = CrdtDoc::new();
        let b = CrdtDoc::new();

        a.set_text("Hello World", DocOrigin::SelfEdit);
        let full = a.encode_state_as_update(None).unwrap();
        b.apply_update(&full, DocOrigin::Remote).unwrap();
        assert_eq!(b.text(), "Hello World");

        // Concurrent edits on both sides.
        a.apply_changes(&[PositionedChange::insert_at(0, "A: ")], DocOrigin::SelfEdit);
        b.apply_changes(&[PositionedChange::insert_at(11, "!")], DocOrigin::SelfEdit);

        let delta_ab = a.encode_state_as_update(Some(&b.state_vector())).unwrap();
        let delta_ba = b.encode_state_as_update(Some(&a.state_vector())).unwrap();
        b.apply_update(&delta_ab, DocOrigin::Remote).unwrap();
        a.apply_update(&delta_ba, DocOrigin::Remote).unwrap();

        assert_eq!(a.text(), b.text());
        assert!(a.text().contains("A: "));
        assert!(a.text().contains('!'));
    }

    #[test]
    fn test_reapplying_update_is_noop() {
        let a = CrdtDoc::new();
        let b = CrdtDoc::new();
        a.set_text("stable", DocOrigin::SelfEdit);
        let update = a.encode_state_as_update(None).unwrap();

        b.apply_update(&update, DocOrigin::Remote).unwrap();
        let sv_once = b.state_vector();
        b.apply_update(&update, DocOrigin::Remote).unwrap();
        assert_eq!(b.state_vector(), sv_once);
        assert_eq!(b.text(), "stable");
    }

    #[test]
    fn test_empty_delta_when_in_sync() {
        let a = CrdtDoc::new();
        a.set_text("content", DocOrigin::SelfEdit);
        let delta = a.encode_state_as_update(Some(&a.state_vector())).unwrap();
        assert!(is_noop_update(&delta));
    }

    #[test]
    fn test_merge_updates_reconstructs_content() {
        let doc = CrdtDoc::new();
        let sv0 = doc.state_vector();
        doc.set_text("first", DocOrigin::SelfEdit);
        let u1 = doc.encode_state_as_update(Some(&sv0)).unwrap();
        let sv1 = doc.state_vector();
        doc.set_text("first second", DocOrigin::SelfEdit);
        let u2 = doc.encode_state_as_update(Some(&sv1)).unwrap();

        let merged = merge_updates(&[u1, u2]).unwrap();
        assert_eq!(text_of_update(&merged).unwrap(), "first second");
        assert!(sv_equal(&state_vector_of_update(&merged).unwrap(), &doc.state_vector()).unwrap());
    }

    #[test]
    fn test_merge_updates_empty_input() {
        let merged = merge_updates(&[]).unwrap();
        assert!(is_noop_update(&merged));
        assert_eq!(text_of_update(&merged).unwrap(), "");
    }

    #[test]
    fn test_sv_exceeds() {
        let doc = CrdtDoc::new();
        let sv_before = doc.state_vector();
        doc.set_text("x", DocOrigin::SelfEdit);
        let sv_after = doc.state_vector();

        assert!(sv_exceeds(&sv_after, &sv_before).unwrap());
        assert!(!sv_exceeds(&sv_before, &sv_after).unwrap());
        assert!(sv_equal(&sv_after, &sv_after).unwrap());
    }

    #[test]
    fn test_observer_reports_remote_changes_with_origin() {
        let a = CrdtDoc::new();
        let b = CrdtDoc::new();
        b.set_text("shared base", DocOrigin::SelfEdit);
        a.apply_update(&b.encode_state_as_update(None).unwrap(), DocOrigin::Remote)
            .unwrap();

        let sink: EditSink = Arc::new(Mutex::new(Vec::new()));
        let _sub = a.observe_edits(Arc::clone(&sink));

        b.apply_changes(&[PositionedChange::insert_at(0, ">> ")], DocOrigin::SelfEdit);
        let delta = b.encode_state_as_update(Some(&a.state_vector())).unwrap();
        a.apply_update(&delta, DocOrigin::Remote).unwrap();

        let edits = sink.lock().unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].origin, Some(DocOrigin::Remote));
        assert_eq!(edits[0].changes.len(), 1);
        assert_eq!(edits[0].changes[0].insert, ">> ");
        assert_eq!(edits[0].changes[0].from, 0);
        drop(edits);

        assert_eq!(a.text(), ">> shared base");
    }

    #[test]
    fn test_observer_tags_self_edits() {
        let doc = CrdtDoc::new();
        let sink: EditSink = Arc::new(Mutex::new(Vec::new()));
        let _sub = doc.observe_edits(Arc::clone(&sink));

        doc.set_text("typed", DocOrigin::SelfEdit);

        let edits = sink.lock().unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].origin, Some(DocOrigin::SelfEdit));
    }

    #[test]
    fn test_apply_changes_uses_char_offsets() {
        let doc = CrdtDoc::new();
        doc.set_text("höhe 🌋 tal", DocOrigin::SelfEdit);
        // "höhe " is 5 chars (6 bytes); the emoji is 1 char (4 bytes).
        doc.apply_changes(
            &[PositionedChange {
                from: 5,
                to: 6,
                insert: "⛰".to_string(),
            }],
            DocOrigin::SelfEdit,
        );
        assert_eq!(doc.text(), "höhe ⛰ tal");
        assert_eq!(doc.len(), "höhe ⛰ tal".chars().count() as u32);
    }

    #[test]
    fn test_observer_positions_are_char_offsets() {
        let a = CrdtDoc::new();
        let b = CrdtDoc::new();
        b.set_text("café\n", DocOrigin::SelfEdit);
        a.apply_update(&b.encode_state_as_update(None).unwrap(), DocOrigin::Remote)
            .unwrap();

        let sink: EditSink = Arc::new(Mutex::new(Vec::new()));
        let _sub = a.observe_edits(Arc::clone(&sink));

        // Insert after the accented char: char offset 4, byte offset 5.
        b.apply_changes(&[PositionedChange::insert_at(4, "!")], DocOrigin::SelfEdit);
        let delta = b.encode_state_as_update(Some(&a.state_vector())).unwrap();
        a.apply_update(&delta, DocOrigin::Remote).unwrap();
        assert_eq!(a.text(), "café!\n");

        let edits = sink.lock().unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].changes.len(), 1);
        assert_eq!(edits[0].changes[0].from, 4);
        assert_eq!(edits[0].changes[0].insert, "!");
        // The observed changes splice a plain string at the same offsets.
        assert_eq!(
            crate::crdt::apply_positioned("café\n", &edits[0].changes),
            "café!\n"
        );
    }

    #[test]
    fn test_set_text_diff_with_multibyte_content_converges() {
        let a = CrdtDoc::new();
        a.set_text("über\nalles\n", DocOrigin::SelfEdit);
        let base = a.encode_state_as_update(None).unwrap();

        let b = CrdtDoc::new();
        b.apply_update(&base, DocOrigin::Remote).unwrap();

        a.set_text("über\nalles\nvon a 🅰\n", DocOrigin::SelfEdit);
        b.set_text("über\nalles\nvon b 🅱\n", DocOrigin::SelfEdit);

        let delta_ab = a.encode_state_as_update(Some(&b.state_vector())).unwrap();
        let delta_ba = b.encode_state_as_update(Some(&a.state_vector())).unwrap();
        b.apply_update(&delta_ab, DocOrigin::Remote).unwrap();
        a.apply_update(&delta_ba, DocOrigin::Remote).unwrap();

        assert_eq!(a.text(), b.text());
        assert_eq!(a.text().matches("über").count(), 1);
        assert!(a.text().contains("🅰"));
        assert!(a.text().contains("🅱"));
    }

    #[test]
    fn test_set_text_preserves_operation_identity() {
        // Two replicas bulk-update to overlapping content; a structural diff
        // must not duplicate the shared part when they merge.
        let a = CrdtDoc::new();
        a.set_text("shared line\n", DocOrigin::SelfEdit);
        let base = a.encode_state_as_update(None).unwrap();

        let b = CrdtDoc::new();
        b.apply_update(&base, DocOrigin::Remote).unwrap();

        a.set_text("shared line\nfrom a\n", DocOrigin::SelfEdit);
        b.set_text("shared line\nfrom b\n", DocOrigin::SelfEdit);

        let delta_ab = a.encode_state_as_update(Some(&b.state_vector())).unwrap();
        let delta_ba = b.encode_state_as_update(Some(&a.state_vector())).unwrap();
        b.apply_update(&delta_ab, DocOrigin::Remote).unwrap();
        a.apply_update(&delta_ba, DocOrigin::Remote).unwrap();

        assert_eq!(a.text(), b.text());
        let occurrences = a.text().matches("shared line").count();
        assert_eq!(occurrences, 1);
    }
}
