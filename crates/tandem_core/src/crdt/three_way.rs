//! Line-based three-way merge.
//!
//! Given the last common ancestor and two descendant texts, produce either a
//! cleanly merged document or a list of conflict regions carrying both
//! candidate texts. Line diffs come from `similar`; the merge walk clusters
//! overlapping changes from the two sides over the base.

use similar::{DiffOp, TextDiff};

use crate::types::{ConflictRegion, PositionedRegion};

/// One segment of merge output.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeSection {
    /// Both sides agree on this text (possibly because only one side changed it).
    ///
    /// `merged` is the output text; `local` is what the local side has in the
    /// same span, used to position conflict decorations against the local
    /// document.
    Stable {
        /// Output text for this span
        merged: String,
        /// Local-side text for this span
        local: String,
    },
    /// Both sides changed the same base region differently.
    Conflict {
        /// First base line of the region
        base_start: usize,
        /// One past the last base line of the region
        base_end: usize,
        /// Local-side candidate (raw, newline-terminated lines)
        local: String,
        /// Remote-side candidate (raw, newline-terminated lines)
        remote: String,
    },
}

/// Result of a three-way merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    /// Ordered output segments.
    pub sections: Vec<MergeSection>,
}

impl MergeOutput {
    /// Whether the merge completed without conflicts.
    pub fn is_clean(&self) -> bool {
        self.sections
            .iter()
            .all(|s| matches!(s, MergeSection::Stable { .. }))
    }

    /// The merged text, if the merge was clean.
    pub fn merged(&self) -> Option<String> {
        if !self.is_clean() {
            return None;
        }
        let mut out = String::new();
        for section in &self.sections {
            if let MergeSection::Stable { merged, .. } = section {
                out.push_str(merged);
            }
        }
        Some(out)
    }

    /// Conflict regions with candidate texts, trailing newline stripped.
    pub fn regions(&self) -> Vec<ConflictRegion> {
        self.sections
            .iter()
            .filter_map(|section| match section {
                MergeSection::Conflict {
                    base_start,
                    base_end,
                    local,
                    remote,
                } => Some(ConflictRegion {
                    base_start: *base_start as u32,
                    base_end: *base_end as u32,
                    local: strip_final_newline(local).to_string(),
                    remote: strip_final_newline(remote).to_string(),
                }),
                MergeSection::Stable { .. } => None,
            })
            .collect()
    }

    /// Character-offset ranges of each conflict region against the local text.
    ///
    /// The range covers the region's local-side content excluding its trailing
    /// newline, so per-hunk replacement preserves the line structure around it.
    pub fn positions(&self) -> Vec<PositionedRegion> {
        let mut positions = Vec::new();
        let mut local_offset: usize = 0;
        for section in &self.sections {
            match section {
                MergeSection::Stable { local, .. } => {
                    local_offset += local.chars().count();
                }
                MergeSection::Conflict { local, .. } => {
                    let trimmed = strip_final_newline(local);
                    positions.push(PositionedRegion {
                        from: local_offset as u32,
                        to: (local_offset + trimmed.chars().count()) as u32,
                    });
                    local_offset += local.chars().count();
                }
            }
        }
        positions
    }
}

fn strip_final_newline(text: &str) -> &str {
    text.strip_suffix('\n').unwrap_or(text)
}

fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// A non-equal diff segment: base range and the side range replacing it.
#[derive(Debug, Clone, Copy)]
struct Change {
    base_start: usize,
    base_end: usize,
}

/// Per-side diff description against the base.
struct SideDiff<'a> {
    lines: Vec<&'a str>,
    changes: Vec<Change>,
    /// Side line index at each base boundary, taken *before* an insertion at
    /// that boundary.
    map_lo: Vec<usize>,
    /// Side line index at each base boundary, taken *after* an insertion at
    /// that boundary.
    map_hi: Vec<usize>,
}

impl<'a> SideDiff<'a> {
    fn compute(base_lines: &[&'a str], side_text: &'a str) -> Self {
        let lines = split_lines(side_text);
        let diff = TextDiff::from_slices(base_lines, &lines);

        let base_len = base_lines.len();
        let unset = usize::MAX;
        let mut map_lo = vec![unset; base_len + 1];
        let mut map_hi = vec![unset; base_len + 1];
        let mut changes = Vec::new();

        for op in diff.ops() {
            let old = op.old_range();
            let new = op.new_range();
            match op {
                DiffOp::Equal { .. } => {
                    for i in 0..=old.len() {
                        let b = old.start + i;
                        let v = new.start + i;
                        if map_lo[b] == unset {
                            map_lo[b] = v;
                        }
                        map_hi[b] = v;
                    }
                }
                _ => {
                    if map_lo[old.start] == unset {
                        map_lo[old.start] = new.start;
                    }
                    map_hi[old.end] = new.end;
                    changes.push(Change {
                        base_start: old.start,
                        base_end: old.end,
                    });
                }
            }
        }

        // Interior boundaries of change segments are never queried; fill the
        // remaining holes so indexing stays safe.
        let mut last = 0;
        for b in 0..=base_len {
            if map_lo[b] == unset {
                map_lo[b] = if map_hi[b] != unset { map_hi[b] } else { last };
            }
            if map_hi[b] == unset {
                map_hi[b] = map_lo[b];
            }
            last = map_hi[b];
        }

        Self {
            lines,
            changes,
            map_lo,
            map_hi,
        }
    }

    /// Side text spanned by base lines `start..end` of a cluster.
    fn span(&self, start: usize, end: usize) -> String {
        let s = self.map_lo[start];
        let e = self.map_hi[end];
        self.lines[s..e].concat()
    }
}

/// Merge `local` and `remote` against their common ancestor `base`.
///
/// Conflict regions carry the local side first; callers decide which side is
/// which (the active machine passes the CRDT text as `local` and the
/// disk/editor text as `remote`; the idle diverged merge passes disk as
/// `local` and the merged CRDT as `remote`).
pub fn three_way_merge(base: &str, local: &str, remote: &str) -> MergeOutput {
    let base_lines = split_lines(base);
    let local_diff = SideDiff::compute(&base_lines, local);
    let remote_diff = SideDiff::compute(&base_lines, remote);

    let mut sections = Vec::new();
    let mut cursor = 0usize;
    let mut li = 0usize;
    let mut ri = 0usize;

    loop {
        let next_local = local_diff.changes.get(li).map(|c| c.base_start);
        let next_remote = remote_diff.changes.get(ri).map(|c| c.base_start);
        let next = match (next_local, next_remote) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                if cursor < base_lines.len() {
                    let text = base_lines[cursor..].concat();
                    sections.push(MergeSection::Stable {
                        merged: text.clone(),
                        local: text,
                    });
                }
                break;
            }
        };

        if next > cursor {
            let text = base_lines[cursor..next].concat();
            sections.push(MergeSection::Stable {
                merged: text.clone(),
                local: text,
            });
            cursor = next;
        }

        // Grow a cluster over every change (from either side) that overlaps
        // it. Changes merely touching the cluster boundary stay separate, so
        // disjoint edits on neighboring lines still merge cleanly; insertions
        // sit in the gap at the boundary and must be absorbed (and once one
        // is, anything else starting at that boundary shares its gap).
        let start = next;
        let mut end = next;
        let mut insert_at_end = false;
        let joins = |c: &Change, start: usize, end: usize, insert_at_end: bool| {
            c.base_start < end
                || (c.base_start == end
                    && (c.base_start == c.base_end || end == start || insert_at_end))
        };
        loop {
            let mut advanced = false;
            while let Some(c) = local_diff.changes.get(li) {
                if joins(c, start, end, insert_at_end) {
                    if c.base_end > end {
                        end = c.base_end;
                        insert_at_end = false;
                    } else if c.base_start == c.base_end && c.base_start == end {
                        insert_at_end = true;
                    }
                    li += 1;
                    advanced = true;
                } else {
                    break;
                }
            }
            while let Some(c) = remote_diff.changes.get(ri) {
                if joins(c, start, end, insert_at_end) {
                    if c.base_end > end {
                        end = c.base_end;
                        insert_at_end = false;
                    } else if c.base_start == c.base_end && c.base_start == end {
                        insert_at_end = true;
                    }
                    ri += 1;
                    advanced = true;
                } else {
                    break;
                }
            }
            if !advanced {
                break;
            }
        }

        let base_span = base_lines[start..end].concat();
        let local_span = local_diff.span(start, end);
        let remote_span = remote_diff.span(start, end);

        if local_span == base_span {
            sections.push(MergeSection::Stable {
                merged: remote_span,
                local: local_span,
            });
        } else if remote_span == base_span || local_span == remote_span {
            sections.push(MergeSection::Stable {
                merged: local_span.clone(),
                local: local_span,
            });
        } else {
            sections.push(MergeSection::Conflict {
                base_start: start,
                base_end: end,
                local: local_span,
                remote: remote_span,
            });
        }
        cursor = end;
    }

    MergeOutput { sections }
}
