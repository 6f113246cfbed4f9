//! Copy-on-write backend for the `cow` route.
//!
//! A `cow` file starts out reading through a host fd opened directly
//! against the real filesystem. The first write triggers
//! `Overlay::copy_up`, after which the fd is swapped for one opened
//! against the shadow copy; every following operation — on this handle or
//! any other open against the same guest path — sees the shadow copy.
//! The fd swap is guarded by this file's own small mutex rather than the
//! supervisor's single global lock: copy-up does host filesystem I/O that
//! must not run inside that lock's critical section, and the swap itself
//! only ever touches this file's own state.

use super::dirstream::DirStream;
use super::passthrough::whence_from_raw;
use super::build_filtered_dir_stream;
use crate::error::{ErrorKind, Result};
use crate::overlay::{tombstones::Tombstones, Overlay};
use std::os::unix::io::RawFd;
use std::sync::Mutex;

struct Inner {
    fd: RawFd,
    copied_up: bool,
}

pub struct CowFile {
    guest_path: String,
    inner: Mutex<Inner>,
}

impl CowFile {
    /// `fd` is opened against whichever of the real filesystem or the cow
    /// shadow already backs `guest_path` at open time; `copied_up`
    /// records which one it is.
    pub fn new(guest_path: String, fd: RawFd, copied_up: bool) -> CowFile {
        CowFile {
            guest_path,
            inner: Mutex::new(Inner { fd, copied_up }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.lock().unwrap().fd
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.fd();
        nix::unistd::read(fd, buf).map_err(|e| e.into())
    }

    /// Copies up before the first write, then reopens against the shadow
    /// path and swaps the fd, preserving the current offset.
    fn ensure_copied_up(&self, overlay: &Overlay) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if guard.copied_up {
            return Ok(());
        }
        let offset = nix::unistd::lseek(guard.fd, 0, nix::unistd::Whence::SeekCur).unwrap_or(0);
        overlay.copy_up(&self.guest_path)?;
        let shadow_path = overlay.resolve_cow(&self.guest_path)?;
        let new_fd = nix::fcntl::open(
            &shadow_path,
            nix::fcntl::OFlag::O_RDWR,
            nix::sys::stat::Mode::empty(),
        )
        .map_err(|e| ErrorKind::from(e))?;
        let _ = nix::unistd::lseek(new_fd, offset, nix::unistd::Whence::SeekSet);
        let old_fd = std::mem::replace(&mut guard.fd, new_fd);
        guard.copied_up = true;
        let _ = nix::unistd::close(old_fd);
        Ok(())
    }

    pub fn write_with_overlay(&self, buf: &[u8], overlay: &Overlay) -> Result<usize> {
        self.ensure_copied_up(overlay)?;
        let fd = self.fd();
        nix::unistd::write(fd, buf).map_err(|e| e.into())
    }

    /// `File::write` has no overlay handle to hand it copy-up machinery;
    /// callers that may need to copy up (anything opened `O_RDWR`/`O_WRONLY`
    /// against a cow path) should route through `write_with_overlay` from
    /// the handler layer, which does have the supervisor's overlay.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let guard = self.inner.lock().unwrap();
        if !guard.copied_up {
            return Err(ErrorKind::Io);
        }
        let fd = guard.fd;
        drop(guard);
        nix::unistd::write(fd, buf).map_err(|e| e.into())
    }

    pub fn lseek(&self, offset: i64, whence: i32) -> Result<i64> {
        let whence = whence_from_raw(whence)?;
        let fd = self.fd();
        nix::unistd::lseek(fd, offset, whence).map_err(|e| e.into())
    }

    pub fn statx(&self) -> Result<libc::stat> {
        let fd = self.fd();
        nix::sys::stat::fstat(fd).map_err(|e| e.into())
    }

    pub fn build_dir_stream(&self, overlay: &Overlay, tombstones: &Tombstones) -> Result<DirStream> {
        let _ = overlay;
        let fd = self.fd();
        build_filtered_dir_stream(fd, &self.guest_path, tombstones)
    }
}

impl Drop for CowFile {
    fn drop(&mut self) {
        let fd = self.inner.lock().unwrap().fd;
        let _ = nix::unistd::close(fd);
    }
}
