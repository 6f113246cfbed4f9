//! Per-thread file descriptor table.
//!
//! Keyed on a plain `BTreeMap` rather than a custom slab: fd numbers are
//! sparse and
//! guest-chosen (via `dup2`/`F_DUPFD` to a specific minimum), so a vector
//! would need the same gap-handling logic a `BTreeMap` gives for free.

use crate::backend::File;
use crate::error::{ErrorKind, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The lowest fd number ever handed out automatically; 0/1/2 are reserved
/// for the guest's inherited stdio.
pub const FIRST_AUTO_FD: i32 = 3;

#[derive(Clone)]
pub struct FdEntry {
    pub file: Arc<File>,
    pub cloexec: bool,
}

#[derive(Default)]
pub struct FdTable {
    entries: BTreeMap<i32, FdEntry>,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable::default()
    }

    /// Lowest fd at or above `min` not currently in use.
    fn lowest_available(&self, min: i32) -> i32 {
        let mut candidate = min;
        for &fd in self.entries.keys() {
            if fd < candidate {
                continue;
            }
            if fd == candidate {
                candidate += 1;
            } else {
                break;
            }
        }
        candidate
    }

    /// Installs `file` at the lowest available slot `>= min`, returning
    /// the assigned fd. Used by `openat`, `F_DUPFD`, and `dup`.
    pub fn insert(&mut self, file: Arc<File>, cloexec: bool, min: i32) -> i32 {
        let fd = self.lowest_available(min.max(0));
        self.entries.insert(fd, FdEntry { file, cloexec });
        fd
    }

    /// `dup2`/`dup3`-style: installs `file` at the exact fd `target`,
    /// closing (dropping) whatever was there first.
    pub fn insert_at(&mut self, target: i32, file: Arc<File>, cloexec: bool) {
        self.entries.insert(target, FdEntry { file, cloexec });
    }

    pub fn get(&self, fd: i32) -> Result<&FdEntry> {
        self.entries.get(&fd).ok_or(ErrorKind::BadF)
    }

    pub fn get_mut(&mut self, fd: i32) -> Result<&mut FdEntry> {
        self.entries.get_mut(&fd).ok_or(ErrorKind::BadF)
    }

    /// Removes and returns the entry at `fd`; dropping the returned
    /// `Arc<File>` releases this table's reference. The `File`'s own
    /// `Drop` only runs — and the backing fd only closes — once every
    /// other `Arc` clone (shared via `dup`/`fork`) has also been dropped.
    pub fn remove(&mut self, fd: i32) -> Result<FdEntry> {
        self.entries.remove(&fd).ok_or(ErrorKind::BadF)
    }

    pub fn set_cloexec(&mut self, fd: i32, cloexec: bool) -> Result<()> {
        self.get_mut(fd)?.cloexec = cloexec;
        Ok(())
    }

    pub fn cloexec(&self, fd: i32) -> Result<bool> {
        Ok(self.get(fd)?.cloexec)
    }

    /// A fresh table sharing the same `Arc<File>`s, as `fork` without
    /// `CLONE_FILES` does: each entry's refcount goes up by one.
    pub fn fork_clone(&self) -> FdTable {
        FdTable {
            entries: self.entries.clone(),
        }
    }

    /// Drops every entry whose `cloexec` bit is set, as `execve` does.
    pub fn close_on_exec(&mut self) {
        self.entries.retain(|_, entry| !entry.cloexec);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&i32, &FdEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, OpenFlags, PassthroughFile};

    fn dummy_file() -> Arc<File> {
        // -1 is never a valid fd; closing it on drop just yields EBADF,
        // which `PassthroughFile::drop` already discards.
        let backend = BackendKind::Passthrough(PassthroughFile::new(-1));
        Arc::new(File::new(backend, OpenFlags::empty(), None))
    }

    #[test]
    fn insert_picks_lowest_available_from_three() {
        let mut table = FdTable::new();
        let a = table.insert(dummy_file(), false, FIRST_AUTO_FD);
        let b = table.insert(dummy_file(), false, FIRST_AUTO_FD);
        assert_eq!(a, 3);
        assert_eq!(b, 4);
        table.remove(3).unwrap();
        let c = table.insert(dummy_file(), false, FIRST_AUTO_FD);
        assert_eq!(c, 3);
    }

    #[test]
    fn dupfd_respects_minimum() {
        let mut table = FdTable::new();
        table.insert(dummy_file(), false, FIRST_AUTO_FD);
        let fd = table.insert(dummy_file(), false, 10);
        assert_eq!(fd, 10);
    }

    #[test]
    fn close_on_exec_drops_flagged_entries_only() {
        let mut table = FdTable::new();
        let kept = table.insert(dummy_file(), false, FIRST_AUTO_FD);
        let dropped = table.insert(dummy_file(), true, FIRST_AUTO_FD);
        table.close_on_exec();
        assert!(table.get(kept).is_ok());
        assert!(table.get(dropped).is_err());
    }
}
