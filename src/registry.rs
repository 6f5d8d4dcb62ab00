// src/registry.rs

//! The directory registry: ground truth for event newness.
//!
//! For every directory producing events the registry tracks the set of known
//! child basenames and their types. An incoming `add` for an already-known
//! child is a duplicate; an `unlink` for an unknown child is noise. The
//! per-dir backend also diffs directory listings against this state to turn
//! "something changed here" signals into concrete events.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Type of a tracked child entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    File,
    Dir,
}

/// Result of [`DirRegistry::remove_child`].
#[derive(Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The child was known and is now forgotten.
    Removed(ChildKind),
    /// The child was not tracked; nothing to emit.
    NotTracked,
    /// The parent directory itself is gone; the caller should release the
    /// backend handle rooted there.
    DirVanished(ChildKind),
}

#[derive(Debug, Default)]
struct DirEntry {
    children: HashMap<String, ChildKind>,
}

/// Map of watched directory → known children.
#[derive(Debug, Default)]
pub struct DirRegistry {
    dirs: HashMap<PathBuf, DirEntry>,
}

impl DirRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure an entry exists for `dir`. Idempotent.
    pub fn touch(&mut self, dir: &Path) {
        self.dirs.entry(dir.to_path_buf()).or_default();
    }

    /// Is this directory currently tracked?
    pub fn contains(&self, dir: &Path) -> bool {
        self.dirs.contains_key(dir)
    }

    /// Record a child under `dir`. Returns true when the child was new,
    /// false for a duplicate of something already tracked with the same
    /// kind.
    ///
    /// A kind flip (file replaced by directory of the same name) counts as
    /// new: the caller owes the corresponding remove/add pair.
    pub fn add_child(&mut self, dir: &Path, basename: &str, kind: ChildKind) -> bool {
        let entry = self.dirs.entry(dir.to_path_buf()).or_default();
        match entry.children.insert(basename.to_string(), kind) {
            None => true,
            Some(prev) => prev != kind,
        }
    }

    /// Whether `basename` is already known under `dir`.
    pub fn has_child(&self, dir: &Path, basename: &str) -> bool {
        self.dirs
            .get(dir)
            .map(|e| e.children.contains_key(basename))
            .unwrap_or(false)
    }

    /// Kind of a tracked child, if known.
    pub fn child_kind(&self, dir: &Path, basename: &str) -> Option<ChildKind> {
        self.dirs.get(dir).and_then(|e| e.children.get(basename).copied())
    }

    /// Forget a child, verifying the parent directory still exists.
    ///
    /// The verification read is what lets the orchestrator notice that a
    /// watched directory vanished out from under its backend handle.
    pub fn remove_child(&mut self, dir: &Path, basename: &str) -> RemoveOutcome {
        let Some(entry) = self.dirs.get_mut(dir) else {
            return RemoveOutcome::NotTracked;
        };
        let Some(kind) = entry.children.remove(basename) else {
            return RemoveOutcome::NotTracked;
        };

        match std::fs::read_dir(dir) {
            Ok(_) => RemoveOutcome::Removed(kind),
            Err(_) => {
                debug!(dir = ?dir, "directory vanished during child removal");
                RemoveOutcome::DirVanished(kind)
            }
        }
    }

    /// Known children of `dir`, unsorted.
    pub fn children(&self, dir: &Path) -> Vec<(String, ChildKind)> {
        self.dirs
            .get(dir)
            .map(|e| {
                e.children
                    .iter()
                    .map(|(name, kind)| (name.clone(), *kind))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop a single directory entry.
    pub fn drop_dir(&mut self, dir: &Path) {
        self.dirs.remove(dir);
    }

    /// Tear down `root` and everything registered beneath it.
    ///
    /// Returns the full paths that were tracked under the subtree (children
    /// first, directories after their contents) so the caller can emit
    /// `unlink`/`unlinkDir` for each.
    pub fn remove_subtree(&mut self, root: &Path) -> Vec<(PathBuf, ChildKind)> {
        let doomed: Vec<PathBuf> = self
            .dirs
            .keys()
            .filter(|dir| *dir == root || dir.starts_with(root))
            .cloned()
            .collect();

        let mut lost = Vec::new();
        for dir in &doomed {
            if let Some(entry) = self.dirs.remove(dir) {
                for (name, kind) in entry.children {
                    lost.push((dir.join(name), kind));
                }
            }
        }

        // Deepest entries first so files report before their parents.
        lost.sort_by(|(a, _), (b, _)| b.components().count().cmp(&a.components().count()));
        lost
    }

    /// Snapshot for `get_watched`: directory → sorted child basenames.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        let mut out = BTreeMap::new();
        for (dir, entry) in &self.dirs {
            let mut names: Vec<String> = entry.children.keys().cloned().collect();
            names.sort();
            out.insert(crate::path::to_slash(dir), names);
        }
        out
    }

    /// Number of tracked directories.
    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    /// Drop everything. Used on close.
    pub fn clear(&mut self) {
        self.dirs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn add_child_reports_newness_once() {
        let mut reg = DirRegistry::new();
        let dir = Path::new("/watched");

        assert!(reg.add_child(dir, "a.txt", ChildKind::File));
        assert!(!reg.add_child(dir, "a.txt", ChildKind::File));
        // Same name, different kind: treated as new.
        assert!(reg.add_child(dir, "a.txt", ChildKind::Dir));
    }

    #[test]
    fn remove_child_verifies_parent_exists() {
        let tmp = TempDir::new().unwrap();
        let mut reg = DirRegistry::new();

        reg.add_child(tmp.path(), "x", ChildKind::File);
        assert_eq!(
            reg.remove_child(tmp.path(), "x"),
            RemoveOutcome::Removed(ChildKind::File)
        );
        assert_eq!(reg.remove_child(tmp.path(), "x"), RemoveOutcome::NotTracked);
    }

    #[test]
    fn remove_child_detects_vanished_dir() {
        let tmp = TempDir::new().unwrap();
        let gone = tmp.path().join("sub");
        std::fs::create_dir(&gone).unwrap();

        let mut reg = DirRegistry::new();
        reg.add_child(&gone, "x", ChildKind::File);

        std::fs::remove_dir_all(&gone).unwrap();
        assert_eq!(
            reg.remove_child(&gone, "x"),
            RemoveOutcome::DirVanished(ChildKind::File)
        );
    }

    #[test]
    fn subtree_teardown_reports_deepest_first() {
        let mut reg = DirRegistry::new();
        let root = Path::new("/w");
        reg.add_child(root, "sub", ChildKind::Dir);
        reg.add_child(&root.join("sub"), "f.txt", ChildKind::File);

        let lost = reg.remove_subtree(root);
        assert_eq!(lost.len(), 2);
        assert_eq!(lost[0].0, root.join("sub/f.txt"));
        assert_eq!(lost[1].0, root.join("sub"));
        assert_eq!(reg.dir_count(), 0);
    }

    #[test]
    fn snapshot_sorts_children() {
        let mut reg = DirRegistry::new();
        let dir = Path::new("/w");
        reg.add_child(dir, "b", ChildKind::File);
        reg.add_child(dir, "a", ChildKind::File);

        let snap = reg.snapshot();
        assert_eq!(snap["/w"], vec!["a".to_string(), "b".to_string()]);
    }
}
