//! tmpfs-shadow backend for the `tmp` route: every path under the
//! guest's `/tmp` lives only in the shadow tree, never on the real
//! filesystem. Simpler than `cow` — there is no copy-up, the fd just
//! stays open against the shadow path for the file's lifetime.

use super::dirstream::DirStream;
use super::passthrough::whence_from_raw;
use super::build_filtered_dir_stream;
use crate::error::Result;
use crate::overlay::{tombstones::Tombstones, Overlay};
use std::os::unix::io::RawFd;

pub struct TmpFile {
    guest_path: String,
    fd: RawFd,
}

impl TmpFile {
    pub fn new(guest_path: String, fd: RawFd) -> TmpFile {
        TmpFile { guest_path, fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        nix::unistd::read(self.fd, buf).map_err(|e| e.into())
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        nix::unistd::write(self.fd, buf).map_err(|e| e.into())
    }

    pub fn lseek(&self, offset: i64, whence: i32) -> Result<i64> {
        let whence = whence_from_raw(whence)?;
        nix::unistd::lseek(self.fd, offset, whence).map_err(|e| e.into())
    }

    pub fn statx(&self) -> Result<libc::stat> {
        nix::sys::stat::fstat(self.fd).map_err(|e| e.into())
    }

    pub fn build_dir_stream(&self, overlay: &Overlay, tombstones: &Tombstones) -> Result<DirStream> {
        let _ = overlay;
        build_filtered_dir_stream(self.fd, &self.guest_path, tombstones)
    }
}

impl Drop for TmpFile {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fd);
    }
}
