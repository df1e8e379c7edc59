//! Structural text diffing between editor/disk text and CRDT text.
//!
//! Bulk content updates must never be applied as delete-all + insert-all:
//! that destroys the operation identity that lets concurrent edits merge, and
//! duplicates content when two replicas do it at once. Everything here goes
//! through `dissimilar` (a diff-match-patch port with semantic cleanup) and
//! produces positioned inserts and deletes only.
//!
//! All offsets are character offsets (Unicode scalar values), the unit Y.Text
//! indexes by. `dissimilar` hands back `&str` chunks, so chunk lengths are
//! re-counted in chars before they become positions; byte offsets appear only
//! when splicing plain Rust strings in [`apply_positioned`].

use dissimilar::Chunk;

use crate::types::PositionedChange;

/// Compute the minimal positioned change list turning `old` into `new`.
///
/// Offsets are character offsets into `old`. Adjacent delete+insert pairs are
/// coalesced into a single replacement, matching how editors describe edits.
pub fn positioned_changes(old: &str, new: &str) -> Vec<PositionedChange> {
    if old == new {
        return Vec::new();
    }

    let chunks = dissimilar::diff(old, new);
    let mut changes: Vec<PositionedChange> = Vec::new();
    let mut pos: usize = 0;

    for chunk in chunks {
        match chunk {
            Chunk::Equal(text) => {
                pos += text.chars().count();
            }
            Chunk::Delete(text) => {
                let len = text.chars().count();
                changes.push(PositionedChange::delete(pos as u32, (pos + len) as u32));
                pos += len;
            }
            Chunk::Insert(text) => {
                // Coalesce with an immediately preceding deletion at the same spot.
                if let Some(last) = changes.last_mut() {
                    if last.insert.is_empty() && last.to as usize == pos {
                        last.insert = text.to_string();
                        continue;
                    }
                }
                changes.push(PositionedChange::insert_at(pos as u32, text));
            }
        }
    }

    changes
}

/// Apply the minimal diff from `old` to `new` to a Y.Text inside an open
/// transaction, as a sequence of positioned inserts and deletes.
///
/// Indices passed to Y.Text are character offsets, the same unit its own
/// insert/remove API counts in.
///
/// The caller must guarantee that the text currently equals `old`.
pub(crate) fn apply_text_diff(
    text: &yrs::TextRef,
    txn: &mut yrs::TransactionMut<'_>,
    old: &str,
    new: &str,
) {
    use yrs::Text;

    if old == new {
        return;
    }

    let chunks = dissimilar::diff(old, new);
    // Position tracks the evolving document, so deletions do not advance it.
    let mut pos: usize = 0;
    for chunk in chunks {
        match chunk {
            Chunk::Equal(s) => {
                pos += s.chars().count();
            }
            Chunk::Delete(s) => {
                text.remove_range(txn, pos as u32, s.chars().count() as u32);
            }
            Chunk::Insert(s) => {
                text.insert(txn, pos as u32, s);
                pos += s.chars().count();
            }
        }
    }
}

/// Apply a positioned change list to a string, producing the edited text.
///
/// Changes must be non-overlapping and sorted by `from`, with character
/// offsets against the original string (editor change-set semantics). Used to
/// keep the last-known editor text in step with dispatched changes, and by
/// the in-memory editor double.
pub fn apply_positioned(text: &str, changes: &[PositionedChange]) -> String {
    // Char offset -> byte offset, with one past-the-end sentinel.
    let byte_at: Vec<usize> = text
        .char_indices()
        .map(|(byte, _)| byte)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_len = byte_at.len() - 1;

    let mut result = String::with_capacity(text.len());
    let mut cursor: usize = 0;
    for change in changes {
        let from = change.from as usize;
        let to = change.to as usize;
        if from >= cursor && from <= to && to <= char_len {
            result.push_str(&text[byte_at[cursor]..byte_at[from]]);
            result.push_str(&change.insert);
            cursor = to;
        } else {
            log::warn!(
                "[diff] Skipping out-of-order positioned change {}..{} (cursor {})",
                from,
                to,
                cursor
            );
        }
    }
    result.push_str(&text[byte_at[cursor]..]);
    result
}
