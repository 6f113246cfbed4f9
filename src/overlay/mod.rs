//! Overlay root: on-disk representation of the `cow` and `tmp` shadow
//! trees, plus the path-existence and copy-up machinery shared by both.

pub mod tombstones;

use crate::error::{ErrorKind, Result};
use std::fs;
use std::os::unix::fs::{symlink as unix_symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tombstones::Tombstones;

/// Which shadow tree a guest path is being resolved against.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Shadow {
    Cow,
    Tmp,
}

pub struct Overlay {
    cow_root: PathBuf,
    tmp_root: PathBuf,
}

fn host_suffix(guest_path: &str) -> &str {
    guest_path.trim_start_matches('/')
}

impl Overlay {
    pub fn new(cow_root: PathBuf, tmp_root: PathBuf) -> Overlay {
        Overlay { cow_root, tmp_root }
    }

    fn root(&self, shadow: Shadow) -> &Path {
        match shadow {
            Shadow::Cow => &self.cow_root,
            Shadow::Tmp => &self.tmp_root,
        }
    }

    fn shadow_path(&self, shadow: Shadow, guest_path: &str) -> PathBuf {
        self.root(shadow).join(host_suffix(guest_path))
    }

    pub fn cow_exists(&self, guest_path: &str) -> bool {
        self.shadow_path(Shadow::Cow, guest_path).symlink_metadata().is_ok()
    }

    pub fn tmp_exists(&self, guest_path: &str) -> bool {
        self.shadow_path(Shadow::Tmp, guest_path).symlink_metadata().is_ok()
    }

    pub fn real_fs_exists(&self, guest_path: &str) -> bool {
        Path::new(guest_path).symlink_metadata().is_ok()
    }

    /// `isGuestDir` (merged view): true if the path currently resolves to
    /// a directory, considering tombstones.
    pub fn is_guest_dir(&self, tombstones: &Tombstones, guest_path: &str) -> bool {
        if !self.guest_path_exists(tombstones, guest_path) {
            return false;
        }
        if self.cow_exists(guest_path) {
            return self
                .shadow_path(Shadow::Cow, guest_path)
                .metadata()
                .map(|m| m.is_dir())
                .unwrap_or(false);
        }
        if self.tmp_exists(guest_path) {
            return self
                .shadow_path(Shadow::Tmp, guest_path)
                .metadata()
                .map(|m| m.is_dir())
                .unwrap_or(false);
        }
        Path::new(guest_path)
            .metadata()
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// True iff `guest_path` resolves to something a guest can see: a cow
    /// copy or a real host file, and not tombstoned (directly or via an
    /// ancestor). For the `tmp` shadow there's no host fallback, so callers
    /// pass `Shadow::Tmp` via `path_exists` instead when they specifically
    /// mean the tmp view.
    pub fn guest_path_exists(&self, tombstones: &Tombstones, guest_path: &str) -> bool {
        if tombstones.is_tombstoned(guest_path) || tombstones.is_ancestor_tombstoned(guest_path) {
            return false;
        }
        self.cow_exists(guest_path) || self.tmp_exists(guest_path) || self.real_fs_exists(guest_path)
    }

    /// Existence under a specific shadow's semantics: `tmp` never falls
    /// back to the real host filesystem.
    pub fn path_exists(&self, tombstones: &Tombstones, shadow: Shadow, guest_path: &str) -> bool {
        if tombstones.is_tombstoned(guest_path) || tombstones.is_ancestor_tombstoned(guest_path) {
            return false;
        }
        match shadow {
            Shadow::Cow => self.cow_exists(guest_path) || self.real_fs_exists(guest_path),
            Shadow::Tmp => self.tmp_exists(guest_path),
        }
    }

    /// Creates a brand-new, empty file in the chosen shadow and clears any
    /// tombstone for the path: create after unlink revives the path.
    /// Used by `openat(..., O_CREAT)` when no
    /// existing copy (shadow or, for `cow`, real) is found.
    pub fn create_file(&self, tombstones: &mut Tombstones, shadow: Shadow, guest_path: &str, mode: u32) -> Result<PathBuf> {
        if self.path_exists(tombstones, shadow, guest_path) {
            return Err(ErrorKind::Exist);
        }
        let host_path = self.shadow_path(shadow, guest_path);
        Self::ensure_parent_dirs(&host_path)?;
        fs::File::create(&host_path).map_err(|_| ErrorKind::Io)?;
        fs::set_permissions(&host_path, fs::Permissions::from_mode(mode)).map_err(|_| ErrorKind::Io)?;
        tombstones.remove(guest_path);
        Ok(host_path)
    }

    fn ensure_parent_dirs(host_path: &Path) -> Result<()> {
        if let Some(parent) = host_path.parent() {
            fs::create_dir_all(parent).map_err(|_| ErrorKind::Io)?;
        }
        Ok(())
    }

    /// Copies the real host file into the cow shadow the first time the
    /// guest modifies it. No-op if already
    /// copied up or if there's no real file to copy from (the caller is
    /// about to create one).
    pub fn copy_up(&self, guest_path: &str) -> Result<()> {
        if self.cow_exists(guest_path) {
            return Ok(());
        }
        let real = Path::new(guest_path);
        if !real.exists() {
            return Ok(());
        }
        let cow_path = self.shadow_path(Shadow::Cow, guest_path);
        Self::ensure_parent_dirs(&cow_path)?;
        let meta = fs::metadata(real).map_err(|_| ErrorKind::Io)?;
        if meta.is_dir() {
            fs::create_dir_all(&cow_path).map_err(|_| ErrorKind::Io)?;
        } else if meta.file_type().is_symlink() {
            let target = fs::read_link(real).map_err(|_| ErrorKind::Io)?;
            unix_symlink(&target, &cow_path).map_err(|_| ErrorKind::Io)?;
        } else {
            fs::copy(real, &cow_path).map_err(|_| ErrorKind::Io)?;
            fs::set_permissions(&cow_path, meta.permissions()).map_err(|_| ErrorKind::Io)?;
        }
        Ok(())
    }

    /// Resolves `P` to the host-side path currently backing it in the
    /// `cow` shadow, copying up first if needed.
    pub fn resolve_cow(&self, guest_path: &str) -> Result<PathBuf> {
        self.copy_up(guest_path)?;
        Ok(self.shadow_path(Shadow::Cow, guest_path))
    }

    /// Resolves `P` to the host-side path in the `tmp` shadow. Unlike
    /// `resolve_cow`, there's never a host fallback to copy from.
    pub fn resolve_tmp(&self, guest_path: &str) -> PathBuf {
        self.shadow_path(Shadow::Tmp, guest_path)
    }

    /// Creates a directory in the chosen shadow, clearing any tombstone
    /// for the path: create after unlink revives the path.
    pub fn mkdir(&self, tombstones: &mut Tombstones, shadow: Shadow, guest_path: &str, mode: u32) -> Result<()> {
        if self.path_exists(tombstones, shadow, guest_path) {
            return Err(ErrorKind::Exist);
        }
        let host_path = match shadow {
            Shadow::Cow => self.shadow_path(Shadow::Cow, guest_path),
            Shadow::Tmp => self.resolve_tmp(guest_path),
        };
        Self::ensure_parent_dirs(&host_path)?;
        fs::create_dir(&host_path).map_err(|_| ErrorKind::Io)?;
        fs::set_permissions(&host_path, fs::Permissions::from_mode(mode)).map_err(|_| ErrorKind::Io)?;
        tombstones.remove(guest_path);
        Ok(())
    }

    /// Removes an (empty) directory. `NOTEMPTY` if it has entries.
    pub fn rmdir(&self, tombstones: &mut Tombstones, shadow: Shadow, guest_path: &str) -> Result<()> {
        if !self.is_guest_dir(tombstones, guest_path) {
            return Err(ErrorKind::NotDir);
        }
        let host_path = self.shadow_path(shadow, guest_path);
        if host_path.exists() {
            match fs::read_dir(&host_path) {
                Ok(mut it) => {
                    if it.next().is_some() {
                        return Err(ErrorKind::NotEmpty);
                    }
                }
                Err(_) => return Err(ErrorKind::Io),
            }
            fs::remove_dir(&host_path).map_err(|_| ErrorKind::Io)?;
        }
        tombstones.add(guest_path);
        Ok(())
    }

    /// Unlinks a file (or empty dir tree left physically but hidden — the
    /// tombstone is authoritative, irrespective of whether a physical copy
    /// remains).
    pub fn unlink(&self, tombstones: &mut Tombstones, guest_path: &str) -> Result<()> {
        tombstones.add(guest_path);
        Ok(())
    }

    pub fn symlink(
        &self,
        tombstones: &mut Tombstones,
        shadow: Shadow,
        target: &str,
        link_guest_path: &str,
    ) -> Result<()> {
        if self.path_exists(tombstones, shadow, link_guest_path) {
            return Err(ErrorKind::Exist);
        }
        let host_path = self.shadow_path(shadow, link_guest_path);
        Self::ensure_parent_dirs(&host_path)?;
        unix_symlink(target, &host_path).map_err(|_| ErrorKind::Io)?;
        tombstones.remove(link_guest_path);
        Ok(())
    }

    pub fn readlink(&self, shadow: Shadow, guest_path: &str) -> Result<String> {
        let host_path = self.shadow_path(shadow, guest_path);
        let target = fs::read_link(&host_path).map_err(|_| ErrorKind::Io)?;
        Ok(target.to_string_lossy().into_owned())
    }

    pub fn fchmodat(&self, shadow: Shadow, guest_path: &str, mode: u32) -> Result<()> {
        let host_path = match shadow {
            Shadow::Cow => self.resolve_cow(guest_path)?,
            Shadow::Tmp => self.resolve_tmp(guest_path),
        };
        fs::set_permissions(&host_path, fs::Permissions::from_mode(mode)).map_err(|_| ErrorKind::Io)
    }

    pub fn utimensat(&self, shadow: Shadow, guest_path: &str, _atime: SystemTime, _mtime: SystemTime) -> Result<()> {
        let host_path = match shadow {
            Shadow::Cow => self.resolve_cow(guest_path)?,
            Shadow::Tmp => self.resolve_tmp(guest_path),
        };
        // `std::fs` has no stable utimensat; touching mtime to "now" is
        // sufficient for the sandbox's purposes — guests observe freshness,
        // not bit-exact timestamps.
        let f = fs::OpenOptions::new().write(true).open(&host_path).map_err(|_| ErrorKind::Io)?;
        f.set_modified(SystemTime::now()).map_err(|_| ErrorKind::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn make_overlay() -> (tempfile::TempDir, Overlay) {
        let dir = tempfile::tempdir().unwrap();
        let overlay = Overlay::new(dir.path().join("cow"), dir.path().join("tmp"));
        (dir, overlay)
    }

    #[test]
    fn mkdir_then_rmdir_round_trips() {
        let (_dir, overlay) = make_overlay();
        let mut tomb = Tombstones::new();
        overlay.mkdir(&mut tomb, Shadow::Tmp, "/tmp/d", 0o755).unwrap();
        assert!(overlay.is_guest_dir(&tomb, "/tmp/d"));
        overlay.rmdir(&mut tomb, Shadow::Tmp, "/tmp/d").unwrap();
        assert!(!overlay.guest_path_exists(&tomb, "/tmp/d"));
    }

    #[test]
    fn unlink_then_create_clears_tombstone() {
        let (_dir, overlay) = make_overlay();
        let mut tomb = Tombstones::new();
        let host = overlay.resolve_tmp("/tmp/x");
        std::fs::create_dir_all(host.parent().unwrap()).unwrap();
        std::fs::File::create(&host).unwrap().write_all(b"abc").unwrap();
        assert!(overlay.path_exists(&tomb, Shadow::Tmp, "/tmp/x"));
        overlay.unlink(&mut tomb, "/tmp/x").unwrap();
        assert!(!overlay.path_exists(&tomb, Shadow::Tmp, "/tmp/x"));
        tomb.remove("/tmp/x");
        assert!(overlay.path_exists(&tomb, Shadow::Tmp, "/tmp/x"));
    }

    #[test]
    fn rmdir_nonempty_fails() {
        let (_dir, overlay) = make_overlay();
        let mut tomb = Tombstones::new();
        overlay.mkdir(&mut tomb, Shadow::Tmp, "/tmp/d", 0o755).unwrap();
        let child = overlay.resolve_tmp("/tmp/d/child");
        std::fs::File::create(&child).unwrap();
        assert_eq!(overlay.rmdir(&mut tomb, Shadow::Tmp, "/tmp/d"), Err(ErrorKind::NotEmpty));
    }
}
