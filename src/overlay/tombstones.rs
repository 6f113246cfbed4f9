//! Tombstones: the record of guest-visible deletions.
//!
//! The set of guest paths explicitly deleted. A tombstoned path is
//! invisible to lookups regardless of whether a physical overlay copy
//! still exists underneath it.

use std::collections::BTreeSet;

#[derive(Default)]
pub struct Tombstones {
    paths: BTreeSet<String>,
}

impl Tombstones {
    pub fn new() -> Tombstones {
        Tombstones::default()
    }

    pub fn is_tombstoned(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    /// True if any ancestor directory of `path` (not `path` itself) is
    /// tombstoned.
    pub fn is_ancestor_tombstoned(&self, path: &str) -> bool {
        let mut current = path;
        loop {
            let parent = match current.rfind('/') {
                Some(0) if current.len() > 1 => "/",
                Some(idx) => &current[..idx],
                None => break,
            };
            if parent.is_empty() {
                break;
            }
            if self.paths.contains(parent) {
                return true;
            }
            if parent == "/" {
                break;
            }
            current = parent;
        }
        false
    }

    pub fn add(&mut self, path: &str) {
        self.paths.insert(path.to_string());
    }

    pub fn remove(&mut self, path: &str) {
        self.paths.remove(path);
    }

    /// Evicts every tombstone strictly under `path` (subtree eviction),
    /// used when `path` is recreated as a directory after having been
    /// removed.
    pub fn remove_children(&mut self, path: &str) {
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        self.paths.retain(|p| !p.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstoned_path_is_hidden() {
        let mut t = Tombstones::new();
        t.add("/tmp/d/a");
        assert!(t.is_tombstoned("/tmp/d/a"));
        assert!(!t.is_tombstoned("/tmp/d/b"));
    }

    #[test]
    fn ancestor_tombstone_hides_descendants() {
        let mut t = Tombstones::new();
        t.add("/tmp/d");
        assert!(t.is_ancestor_tombstoned("/tmp/d/a"));
        assert!(t.is_ancestor_tombstoned("/tmp/d/a/b"));
        assert!(!t.is_ancestor_tombstoned("/tmp/other"));
    }

    #[test]
    fn remove_clears_tombstone() {
        let mut t = Tombstones::new();
        t.add("/tmp/x");
        t.remove("/tmp/x");
        assert!(!t.is_tombstoned("/tmp/x"));
    }

    #[test]
    fn remove_children_evicts_subtree_only() {
        let mut t = Tombstones::new();
        t.add("/tmp/d/a");
        t.add("/tmp/d/b");
        t.add("/tmp/other");
        t.remove_children("/tmp/d");
        assert!(!t.is_tombstoned("/tmp/d/a"));
        assert!(!t.is_tombstoned("/tmp/d/b"));
        assert!(t.is_tombstoned("/tmp/other"));
    }
}
