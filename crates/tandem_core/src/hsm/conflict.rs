//! Conflict surfacing and resolution.
//!
//! A failed merge produces [`ConflictData`]: the three texts, the conflict
//! regions, and their character offsets against the local document. The user
//! resolves the whole conflict at once, hunk by hunk, or dismisses it; a
//! dismissed `(disk, local)` pair is remembered and not surfaced again until
//! one side changes.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::crdt::{self, DocOrigin, MergeOutput};
use crate::types::{ConflictRegion, DeferredConflict, PositionedChange, PositionedRegion};

use super::event::{Effect, Event, HunkResolution};
use super::machine::{EffectBuf, HsmInner, MergeHsm};
use super::state::{ActiveState, ConflictState, StatePath};

/// Live state of one surfaced conflict.
#[derive(Debug, Clone)]
pub struct ConflictData {
    /// Merge base (empty for two-way conflicts)
    pub base: String,
    /// Local-side full text at detection time
    pub local: String,
    /// Remote/disk-side full text at detection time
    pub remote: String,
    /// Conflict regions, candidate texts without trailing newlines
    pub regions: Vec<ConflictRegion>,
    /// Offsets of each region against the local document text, kept current
    /// as hunks resolve
    pub positions: Vec<PositionedRegion>,
    /// Indices of resolved regions
    pub resolved: BTreeSet<usize>,
}

impl ConflictData {
    /// Build conflict data from a failed three-way merge.
    pub fn from_merge(
        base: String,
        local: String,
        remote: String,
        output: &MergeOutput,
    ) -> Self {
        Self {
            base,
            local,
            remote,
            regions: output.regions(),
            positions: output.positions(),
            resolved: BTreeSet::new(),
        }
    }

    /// Build a whole-document two-way conflict (no common ancestor).
    pub fn two_way(local: String, remote: String) -> Self {
        let local_trimmed = local.strip_suffix('\n').unwrap_or(&local).to_string();
        let remote_trimmed = remote.strip_suffix('\n').unwrap_or(&remote).to_string();
        let position = PositionedRegion {
            from: 0,
            to: local_trimmed.chars().count() as u32,
        };
        Self {
            base: String::new(),
            regions: vec![ConflictRegion {
                base_start: 0,
                base_end: 0,
                local: local_trimmed,
                remote: remote_trimmed,
            }],
            positions: vec![position],
            resolved: BTreeSet::new(),
            local,
            remote,
        }
    }

    /// Whether every region has been resolved.
    pub fn is_fully_resolved(&self) -> bool {
        self.resolved.len() == self.regions.len()
    }

    /// Shift the positions of all unresolved regions after `index` by `delta`.
    pub fn shift_after(&mut self, index: usize, delta: i64) {
        for (i, position) in self.positions.iter_mut().enumerate() {
            if i > index && !self.resolved.contains(&i) {
                position.from = (position.from as i64 + delta).max(0) as u32;
                position.to = (position.to as i64 + delta).max(0) as u32;
            }
        }
    }
}

impl MergeHsm {
    /// Record conflict data and surface the banner with inline decorations.
    pub(super) fn show_conflict(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        conflict: ConflictData,
    ) {
        out.effects.push(Effect::ShowConflictDecorations {
            regions: conflict.regions.clone(),
            positions: conflict.positions.clone(),
        });
        inner.conflict = Some(conflict);
        self.transition_to(
            inner,
            out,
            StatePath::Active(ActiveState::Conflict(ConflictState::BannerShown)),
            "MERGE_CONFLICT",
        );
    }

    /// Route a user conflict event; invalid in other states.
    pub(super) fn handle_conflict_event(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        event: Event,
    ) {
        let path = inner.state.state_path;
        let in_conflict = matches!(path, StatePath::Active(ActiveState::Conflict(_)));
        if !in_conflict {
            log::debug!("[MergeHsm] {} ignored in {}", event.name(), path);
            return;
        }

        match event {
            Event::OpenDiffView => {
                self.transition_to(
                    inner,
                    out,
                    StatePath::Active(ActiveState::Conflict(ConflictState::Resolving)),
                    "OPEN_DIFF_VIEW",
                );
            }
            Event::Cancel => {
                self.transition_to(
                    inner,
                    out,
                    StatePath::Active(ActiveState::Conflict(ConflictState::BannerShown)),
                    "CANCEL",
                );
            }
            Event::ResolveAcceptLocal => {
                let target = inner.local.as_ref().map(|l| l.text()).unwrap_or_default();
                self.resolve_whole(inner, out, target, "RESOLVE_ACCEPT_LOCAL");
            }
            Event::ResolveAcceptDisk => {
                let Some(target) = inner.conflict.as_ref().map(|c| c.remote.clone()) else {
                    return;
                };
                self.resolve_whole(inner, out, target, "RESOLVE_ACCEPT_DISK");
            }
            Event::ResolveAcceptMerged { contents } => {
                self.resolve_whole(inner, out, contents, "RESOLVE_ACCEPT_MERGED");
            }
            Event::ResolveHunk { index, resolution } => {
                self.resolve_hunk(inner, out, index, resolution);
            }
            Event::DismissConflict => {
                let Some(conflict) = inner.conflict.take() else {
                    return;
                };
                inner.state.deferred_conflict = Some(DeferredConflict {
                    disk_hash: (self.ctx.hash_fn)(&conflict.remote),
                    local_hash: (self.ctx.hash_fn)(&conflict.local),
                });
                log::info!(
                    "[MergeHsm:{}] Conflict dismissed and deferred",
                    inner.state.guid
                );
                self.settle_tracking(inner, out, "DISMISS_CONFLICT");
            }
            _ => unreachable!("non-conflict event routed to conflict handler"),
        }
    }

    /// Apply a whole-document resolution: the chosen content becomes the
    /// CRDT text, the editor is brought to it with a minimal delta, and the
    /// machine returns to tracking.
    fn resolve_whole(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        target: String,
        event: &'static str,
    ) {
        if inner.conflict.take().is_none() {
            return;
        }
        inner.edit_sink.lock().unwrap().clear();
        {
            let local = inner.local.as_ref().expect("conflict without local doc");
            local.set_text(&target, DocOrigin::SelfEdit);
            inner.state.local_state_vector = local.state_vector();
        }
        inner.edit_sink.lock().unwrap().clear();
        self.push_local_delta(inner, out);

        let displayed = inner
            .state
            .last_known_editor_text
            .clone()
            .unwrap_or_default();
        if displayed != target {
            out.effects.push(Effect::DispatchEditor {
                changes: crdt::positioned_changes(&displayed, &target),
            });
        }
        inner.state.last_known_editor_text = Some(target);
        inner.state.deferred_conflict = None;
        self.settle_tracking(inner, out, event);
    }

    /// Resolve one hunk inline: replace its positioned range in the local doc
    /// with the chosen side(s), recompute remaining positions, and finalize
    /// once every region is resolved.
    fn resolve_hunk(
        self: &Arc<Self>,
        inner: &mut HsmInner,
        out: &mut EffectBuf,
        index: usize,
        resolution: HunkResolution,
    ) {
        let (region, position) = {
            let Some(conflict) = inner.conflict.as_ref() else {
                return;
            };
            if index >= conflict.regions.len() || conflict.resolved.contains(&index) {
                log::debug!("[MergeHsm] RESOLVE_HUNK with stale index {}", index);
                return;
            }
            (conflict.regions[index].clone(), conflict.positions[index])
        };

        let replacement = match resolution {
            HunkResolution::Local => region.local.clone(),
            HunkResolution::Remote => region.remote.clone(),
            HunkResolution::Both => format!("{}\n{}", region.local, region.remote),
        };

        inner.edit_sink.lock().unwrap().clear();
        {
            let local = inner.local.as_ref().expect("conflict without local doc");
            local.apply_changes(
                &[PositionedChange {
                    from: position.from,
                    to: position.to,
                    insert: replacement.clone(),
                }],
                DocOrigin::SelfEdit,
            );
            inner.state.local_state_vector = local.state_vector();
        }
        inner.edit_sink.lock().unwrap().clear();
        self.push_local_delta(inner, out);

        let new_text = inner.local.as_ref().map(|l| l.text()).unwrap_or_default();
        let displayed = inner
            .state
            .last_known_editor_text
            .clone()
            .unwrap_or_default();
        if displayed != new_text {
            out.effects.push(Effect::DispatchEditor {
                changes: crdt::positioned_changes(&displayed, &new_text),
            });
        }
        inner.state.last_known_editor_text = Some(new_text);

        let fully_resolved = {
            let conflict = inner.conflict.as_mut().expect("conflict vanished");
            conflict.resolved.insert(index);
            // Positions are char offsets; measure the replacement the same way.
            let delta =
                replacement.chars().count() as i64 - (position.to - position.from) as i64;
            conflict.shift_after(index, delta);
            conflict.is_fully_resolved()
        };
        out.effects.push(Effect::HideConflictDecoration { index });

        if fully_resolved {
            inner.conflict = None;
            inner.state.deferred_conflict = None;
            self.settle_tracking(inner, out, "RESOLVE_HUNK");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_way_covers_whole_document() {
        let conflict = ConflictData::two_way("mine\n".to_string(), "theirs\n".to_string());
        assert_eq!(conflict.regions.len(), 1);
        assert_eq!(conflict.regions[0].local, "mine");
        assert_eq!(conflict.regions[0].remote, "theirs");
        assert_eq!(conflict.positions[0].from, 0);
        assert_eq!(conflict.positions[0].to, 4);
        assert!(!conflict.is_fully_resolved());
    }

    #[test]
    fn test_two_way_position_counts_chars() {
        // "mïne 🅰" is 6 chars but 11 bytes.
        let conflict = ConflictData::two_way("mïne 🅰\n".to_string(), "thëirs\n".to_string());
        assert_eq!(conflict.regions[0].local, "mïne 🅰");
        assert_eq!(conflict.regions[0].remote, "thëirs");
        assert_eq!(conflict.positions[0].from, 0);
        assert_eq!(conflict.positions[0].to, 6);
    }

    #[test]
    fn test_hunk_shift_measures_multibyte_replacements_in_chars() {
        let base = "één\ntwo\ndrie\n";
        let local = "ÉÉN\ntwo\nDRIE\n";
        let remote = "1\ntwo\n3\n";
        let out = crdt::three_way_merge(base, local, remote);
        let mut conflict = ConflictData::from_merge(
            base.to_string(),
            local.to_string(),
            remote.to_string(),
            &out,
        );
        assert_eq!(conflict.positions.len(), 2);
        assert_eq!(conflict.positions[0].to, 3);
        assert_eq!(conflict.positions[1].from, 8);

        // Resolving hunk 0 with both sides ("ÉÉN\n1", 5 chars) grows the
        // document by 2 chars, so the next region shifts by 2.
        let replacement = "ÉÉN\n1";
        let delta = replacement.chars().count() as i64
            - (conflict.positions[0].to - conflict.positions[0].from) as i64;
        conflict.resolved.insert(0);
        conflict.shift_after(0, delta);
        assert_eq!(conflict.positions[1].from, 10);
        assert_eq!(conflict.positions[1].to, 14);
    }

    #[test]
    fn test_shift_after_skips_resolved() {
        let output = crdt::three_way_merge(
            "one\ntwo\nthree\nfour\nfive\n",
            "ONE\ntwo\nthree\nFOUR\nfive\n",
            "1\ntwo\nthree\n4\nfive\n",
        );
        let mut conflict = ConflictData::from_merge(
            "one\ntwo\nthree\nfour\nfive\n".to_string(),
            "ONE\ntwo\nthree\nFOUR\nfive\n".to_string(),
            "1\ntwo\nthree\n4\nfive\n".to_string(),
            &output,
        );
        assert_eq!(conflict.positions.len(), 2);
        let before = conflict.positions[1];

        conflict.resolved.insert(0);
        conflict.shift_after(0, -2);
        assert_eq!(conflict.positions[1].from, before.from - 2);
        assert_eq!(conflict.positions[1].to, before.to - 2);

        // Resolved regions keep their last position.
        let frozen = conflict.positions[1];
        conflict.resolved.insert(1);
        conflict.shift_after(0, 10);
        assert_eq!(conflict.positions[1], frozen);
    }
}
