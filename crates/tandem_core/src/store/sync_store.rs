//! Path→metadata store with a deferred-commit overlay.
//!
//! The store serves two client generations at once: the new protocol speaks
//! explicit path/metadata operations, while legacy clients only maintain a
//! flat `path → guid` map of documents. Folder renames performed by a legacy
//! client are detected from that map and propagated to every descendant the
//! legacy client doesn't know about (images, PDFs, nested folders).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use super::meta::{Meta, TypeRegistry};
use crate::error::{Result, TandemError};
use crate::time::TimeProvider;

/// Path→metadata map for all syncable entries in a shared folder.
///
/// Reads see pending inserts (`overlay`) and hide pending deletes
/// (`delete_set`); [`commit`](SyncStore::commit) folds both into main storage.
pub struct SyncStore {
    /// Committed main storage
    meta: HashMap<String, Meta>,
    /// Pending inserts/updates, visible to reads
    overlay: HashMap<String, Meta>,
    /// Pending deletes, hiding paths from reads
    delete_set: HashSet<String>,
    /// Parallel legacy map: document paths only
    legacy_ids: HashMap<String, String>,
    /// Newly created local entries awaiting upload confirmation
    pending_upload: HashMap<String, String>,
    time: Arc<dyn TimeProvider>,
}

impl SyncStore {
    /// Create an empty store.
    pub fn new(time: Arc<dyn TimeProvider>) -> Self {
        Self {
            meta: HashMap::new(),
            overlay: HashMap::new(),
            delete_set: HashSet::new(),
            legacy_ids: HashMap::new(),
            pending_upload: HashMap::new(),
            time,
        }
    }

    // ==================== Read path ====================

    /// Metadata for a path: overlay first, deletes hide, then main storage.
    pub fn get_meta(&self, path: &str) -> Option<&Meta> {
        if let Some(meta) = self.overlay.get(path) {
            return Some(meta);
        }
        if self.delete_set.contains(path) {
            return None;
        }
        self.meta.get(path)
    }

    /// Guid for a path, if present.
    pub fn get(&self, path: &str) -> Option<String> {
        self.get_meta(path).map(|m| m.id().to_string())
    }

    /// Whether a path is visible.
    pub fn has(&self, path: &str) -> bool {
        self.get_meta(path).is_some()
    }

    /// Visit every visible entry.
    pub fn for_each(&self, mut f: impl FnMut(&str, &Meta)) {
        for (path, meta) in self.visible_entries() {
            f(&path, meta);
        }
    }

    /// The set of guids known to the remote: every visible entry except the
    /// ones still awaiting upload confirmation.
    pub fn remote_ids(&self) -> HashSet<String> {
        let pending: HashSet<&String> = self.pending_upload.values().collect();
        self.visible_entries()
            .into_iter()
            .map(|(_, m)| m.id().to_string())
            .filter(|id| !pending.contains(id))
            .collect()
    }

    /// Access the legacy path→guid map.
    pub fn legacy_ids(&self) -> &HashMap<String, String> {
        &self.legacy_ids
    }

    /// Replace one legacy map entry (what a legacy client write looks like).
    pub fn set_legacy(&mut self, path: impl Into<String>, guid: impl Into<String>) {
        self.legacy_ids.insert(path.into(), guid.into());
    }

    /// Remove one legacy map entry.
    pub fn remove_legacy(&mut self, path: &str) -> Option<String> {
        self.legacy_ids.remove(path)
    }

    // ==================== Mutation ====================

    /// Create a new entry for `path`, returning its generated guid.
    ///
    /// The entry kind comes from the path's extension; the guid is recorded
    /// as pending upload until [`mark_uploaded`](SyncStore::mark_uploaded).
    pub fn new_entry(&mut self, path: &str) -> Result<String> {
        validate_path(path)?;
        let guid = Uuid::new_v4().to_string();
        let meta = TypeRegistry::meta_for_new(path, guid.clone(), self.time.now());
        self.ensure_parents(path);
        self.overlay.insert(path.to_string(), meta);
        self.delete_set.remove(path);
        self.pending_upload.insert(path.to_string(), guid.clone());
        if TypeRegistry::kind_for_path(path) == super::meta::MetaKind::Document {
            self.legacy_ids.insert(path.to_string(), guid.clone());
        }
        Ok(guid)
    }

    /// Create a new folder entry for `path`, returning its generated guid.
    pub fn new_folder(&mut self, path: &str) -> Result<String> {
        validate_path(path)?;
        let guid = Uuid::new_v4().to_string();
        self.ensure_parents(path);
        self.overlay
            .insert(path.to_string(), Meta::folder(guid.clone()));
        self.delete_set.remove(path);
        Ok(guid)
    }

    /// Insert or update the metadata at `path`, auto-creating parent folders.
    pub fn set(&mut self, path: &str, meta: Meta) -> Result<()> {
        validate_path(path)?;
        self.ensure_parents(path);
        if meta.is_document() {
            self.legacy_ids.insert(path.to_string(), meta.id().to_string());
        }
        self.overlay.insert(path.to_string(), meta);
        self.delete_set.remove(path);
        Ok(())
    }

    /// Mark `path` deleted. The delete is pending until commit; a matching
    /// create with the same folder guid turns it into a move at resolve time.
    pub fn delete(&mut self, path: &str) {
        self.overlay.remove(path);
        self.pending_upload.remove(path);
        self.legacy_ids.remove(path);
        self.delete_set.insert(path.to_string());
    }

    /// Move an entry (and, for folders, its whole subtree) to a new path.
    pub fn move_entry(&mut self, old: &str, new: &str) -> Result<()> {
        validate_path(new)?;
        let meta = self
            .get_meta(old)
            .cloned()
            .ok_or_else(|| TandemError::Store(format!("move source not found: {}", old)))?;

        self.ensure_parents(new);
        if meta.is_folder() {
            let affected: Vec<String> = self
                .visible_entries()
                .into_iter()
                .map(|(p, _)| p)
                .filter(|p| p == old || p.starts_with(&format!("{}/", old)))
                .collect();
            for path in affected {
                let new_path = format!("{}{}", new, &path[old.len()..]);
                self.rekey(&path, &new_path);
            }
        } else {
            self.rekey(old, new);
        }
        Ok(())
    }

    /// Confirm an upload: the entry stops being pending and takes the
    /// server-acknowledged metadata.
    pub fn mark_uploaded(&mut self, path: &str, meta: Meta) {
        self.pending_upload.remove(path);
        if meta.is_document() {
            self.legacy_ids.insert(path.to_string(), meta.id().to_string());
        }
        self.overlay.insert(path.to_string(), meta);
        self.delete_set.remove(path);
    }

    /// Create an entry for a legacy document at `path` with a known guid.
    ///
    /// The entry kind is inferred from the extension via the type registry;
    /// unknown extensions become generic file entries.
    pub fn migrate_file(&mut self, guid: &str, path: &str) -> Result<()> {
        validate_path(path)?;
        let meta = TypeRegistry::meta_for_new(path, guid, self.time.now());
        self.ensure_parents(path);
        if meta.is_document() {
            self.legacy_ids.insert(path.to_string(), guid.to_string());
        }
        self.overlay.insert(path.to_string(), meta);
        self.delete_set.remove(path);
        Ok(())
    }

    /// Pull legacy-only documents into the main map.
    ///
    /// Entries whose guid already exists somewhere (possibly under another
    /// path) are left for [`resolve_all`](SyncStore::resolve_all) to
    /// reconcile as renames.
    pub fn migrate_up(&mut self) -> Result<()> {
        let known: HashSet<String> = self
            .visible_entries()
            .into_iter()
            .map(|(_, m)| m.id().to_string())
            .collect();
        let entries: Vec<(String, String)> = self
            .legacy_ids
            .iter()
            .map(|(p, g)| (p.clone(), g.clone()))
            .collect();
        for (path, guid) in entries {
            if !known.contains(&guid) {
                log::debug!("[SyncStore] migrate_up creating {} at {}", guid, path);
                self.migrate_file(&guid, &path)?;
            }
        }
        Ok(())
    }

    // ==================== Resolution ====================

    /// Resolve one pending delete as a move, if a visible entry with the same
    /// folder guid exists elsewhere.
    pub fn resolve_move(&mut self, old: &str) {
        if !self.delete_set.contains(old) {
            return;
        }
        let Some(old_meta) = self.meta.get(old).cloned() else {
            return;
        };
        if !old_meta.is_folder() {
            return;
        }
        let target = self
            .visible_entries()
            .into_iter()
            .find(|(p, m)| p != old && m.is_folder() && m.id() == old_meta.id())
            .map(|(p, _)| p);
        let Some(new_folder) = target else {
            return;
        };

        log::debug!("[SyncStore] Treating delete of {} as move to {}", old, new_folder);
        let prefix = format!("{}/", old);
        let descendants: Vec<String> = self
            .visible_entries()
            .into_iter()
            .map(|(p, _)| p)
            .filter(|p| p.starts_with(&prefix))
            .collect();
        for path in descendants {
            let new_path = format!("{}{}", new_folder, &path[old.len()..]);
            self.rekey(&path, &new_path);
        }
    }

    /// Resolve every pending delete, reconcile legacy renames, and commit.
    pub fn resolve_all(&mut self) -> Result<()> {
        let pending: Vec<String> = self.delete_set.iter().cloned().collect();
        for path in pending {
            self.resolve_move(&path);
        }
        self.reconcile_legacy_renames()?;
        self.commit();
        Ok(())
    }

    /// Fold the overlay and delete set into main storage.
    pub fn commit(&mut self) {
        for (path, meta) in self.overlay.drain() {
            self.meta.insert(path, meta);
        }
        let deletes: Vec<String> = self.delete_set.drain().collect();
        for path in &deletes {
            let removed = self.meta.remove(path);
            self.legacy_ids.remove(path);
            // A committed folder delete takes its remaining descendants with it.
            if removed.as_ref().is_some_and(|m| m.is_folder()) {
                let prefix = format!("{}/", path);
                let orphans: Vec<String> = self
                    .meta
                    .keys()
                    .filter(|p| p.starts_with(&prefix))
                    .cloned()
                    .collect();
                for orphan in orphans {
                    self.meta.remove(&orphan);
                    self.legacy_ids.remove(&orphan);
                }
            }
        }
    }

    /// Detect folder renames performed by legacy clients and propagate them.
    ///
    /// A guid listed in the legacy map under a new path but stored under an
    /// old path is a legacy rename. The differing ancestor pair is derived by
    /// stripping the parents' common trailing segments; if a folder exists at
    /// the old ancestor, the whole subtree moves.
    fn reconcile_legacy_renames(&mut self) -> Result<()> {
        let entries: Vec<(String, String)> = self
            .legacy_ids
            .iter()
            .map(|(p, g)| (p.clone(), g.clone()))
            .collect();

        for (legacy_path, guid) in entries {
            let current = self
                .visible_entries()
                .into_iter()
                .find(|(_, m)| m.is_document() && m.id() == guid)
                .map(|(p, _)| p);
            let Some(current_path) = current else {
                continue;
            };
            if current_path == legacy_path {
                continue;
            }

            let old_parent = dirname(&current_path);
            let new_parent = dirname(&legacy_path);
            if old_parent == new_parent {
                // Same folder: a plain file rename.
                self.ensure_parents(&legacy_path);
                self.rekey(&current_path, &legacy_path);
                continue;
            }

            let (old_folder, new_folder) = strip_common_suffix(old_parent, new_parent);
            let folder_guid = (!old_folder.is_empty())
                .then(|| self.get_meta(&old_folder).filter(|m| m.is_folder()).cloned())
                .flatten();

            match folder_guid {
                Some(_) if !new_folder.is_empty() => {
                    log::debug!(
                        "[SyncStore] Legacy rename detected: {} -> {}",
                        old_folder,
                        new_folder
                    );
                    self.ensure_parents(&new_folder);
                    let affected: Vec<String> = self
                        .visible_entries()
                        .into_iter()
                        .map(|(p, _)| p)
                        .filter(|p| {
                            p == &old_folder || p.starts_with(&format!("{}/", old_folder))
                        })
                        .collect();
                    for path in affected {
                        let new_path = format!("{}{}", new_folder, &path[old_folder.len()..]);
                        self.rekey(&path, &new_path);
                    }
                }
                _ => {
                    // No folder to carry along: move just the document.
                    self.ensure_parents(&legacy_path);
                    self.rekey(&current_path, &legacy_path);
                }
            }
        }
        Ok(())
    }

    // ==================== Internals ====================

    fn visible_entries(&self) -> Vec<(String, &Meta)> {
        let mut entries: Vec<(String, &Meta)> = Vec::new();
        for (path, meta) in &self.overlay {
            entries.push((path.clone(), meta));
        }
        for (path, meta) in &self.meta {
            if !self.delete_set.contains(path) && !self.overlay.contains_key(path) {
                entries.push((path.clone(), meta));
            }
        }
        entries
    }

    fn rekey(&mut self, old: &str, new: &str) {
        if old == new {
            return;
        }
        let Some(meta) = self.get_meta(old).cloned() else {
            return;
        };
        self.overlay.remove(old);
        self.delete_set.insert(old.to_string());
        self.overlay.insert(new.to_string(), meta);
        self.delete_set.remove(new);

        if let Some(guid) = self.pending_upload.remove(old) {
            self.pending_upload.insert(new.to_string(), guid);
        }
        if let Some(guid) = self.legacy_ids.remove(old) {
            self.legacy_ids.insert(new.to_string(), guid);
        }
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut prefix = String::new();
        let segments: Vec<&str> = path.split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            if self.overlay.contains_key(&prefix) {
                continue;
            }
            if self.meta.contains_key(&prefix) {
                // Revive a pending-deleted ancestor rather than re-minting it.
                self.delete_set.remove(&prefix);
                continue;
            }
            let guid = Uuid::new_v4().to_string();
            log::debug!("[SyncStore] Auto-creating folder {} ({})", prefix, guid);
            self.overlay.insert(prefix.clone(), Meta::folder(guid));
            self.delete_set.remove(&prefix);
        }
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
        return Err(TandemError::InvalidPath {
            path: path.to_string(),
            message: "paths are relative, non-empty, and slash-free at the edges".to_string(),
        });
    }
    Ok(())
}

fn dirname(path: &str) -> String {
    path.rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_default()
}

/// Strip the longest common trailing segment run from two parent paths,
/// returning the differing ancestor pair.
fn strip_common_suffix(a: String, b: String) -> (String, String) {
    let mut a_segments: Vec<&str> = if a.is_empty() { Vec::new() } else { a.split('/').collect() };
    let mut b_segments: Vec<&str> = if b.is_empty() { Vec::new() } else { b.split('/').collect() };
    while let (Some(last_a), Some(last_b)) = (a_segments.last(), b_segments.last()) {
        if last_a == last_b {
            a_segments.pop();
            b_segments.pop();
        } else {
            break;
        }
    }
    (a_segments.join("/"), b_segments.join("/"))
}
