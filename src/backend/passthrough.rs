//! Passthrough backend for the `passthrough` route: the guest's fd is a
//! thin wrapper over a real, already-open host fd. Every operation
//! forwards to the kernel unchanged.

use super::dirstream::DirStream;
use super::{parse_raw_dirents, read_raw_dirents};
use crate::error::{ErrorKind, Result};
use nix::sys::socket::{shutdown as nix_shutdown, Shutdown};
use std::os::unix::io::RawFd;

pub struct PassthroughFile {
    fd: RawFd,
}

impl PassthroughFile {
    /// Takes ownership of an already-open host fd (e.g. one returned by a
    /// real `openat(2)` against an `always_passthrough` prefix, or a
    /// socket/pipe fd created directly on the host).
    pub fn new(fd: RawFd) -> PassthroughFile {
        PassthroughFile { fd }
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

    /// Passthrough entries are never tombstone-filtered; the kernel's own
    /// records are re-encoded through the shared name/type parser so the
    /// resumable-chunk cursor semantics stay identical to cow/tmp.
    pub fn build_dir_stream(&self) -> Result<DirStream> {
        let mut raw = Vec::new();
        loop {
            let chunk = read_raw_dirents(self.fd, 32 * 1024)?;
            if chunk.is_empty() {
                break;
            }
            raw.extend_from_slice(&chunk);
        }
        let entries = parse_raw_dirents(&raw)
            .into_iter()
            .map(|e| (e.name.to_string(), e.d_type))
            .collect();
        Ok(DirStream::with_dots(entries))
    }

    pub fn connect(&self, addr: &[u8]) -> Result<()> {
        let sockaddr = raw_sockaddr(addr)?;
        nix::sys::socket::connect(self.fd, &sockaddr).map_err(|e| e.into())
    }

    pub fn send_to(&self, buf: &[u8], addr: Option<&[u8]>) -> Result<usize> {
        match addr {
            Some(raw) => {
                let sockaddr = raw_sockaddr(raw)?;
                nix::sys::socket::sendto(self.fd, buf, &sockaddr, nix::sys::socket::MsgFlags::empty())
                    .map_err(|e| e.into())
            }
            None => nix::unistd::write(self.fd, buf).map_err(|e| e.into()),
        }
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<usize> {
        nix::sys::socket::recv(self.fd, buf, nix::sys::socket::MsgFlags::empty()).map_err(|e| e.into())
    }

    pub fn shutdown(&self, how: i32) -> Result<()> {
        let how = match how {
            libc::SHUT_RD => Shutdown::Read,
            libc::SHUT_WR => Shutdown::Write,
            libc::SHUT_RDWR => Shutdown::Both,
            _ => return Err(ErrorKind::Inval),
        };
        nix_shutdown(self.fd, how).map_err(|e| e.into())
    }
}

impl Drop for PassthroughFile {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fd);
    }
}

/// Maps a raw `SEEK_*` constant to `nix`'s `Whence`; shared by every
/// backend's `lseek`.
pub(crate) fn whence_from_raw(whence: i32) -> Result<nix::unistd::Whence> {
    use nix::unistd::Whence::*;
    match whence {
        libc::SEEK_SET => Ok(SeekSet),
        libc::SEEK_CUR => Ok(SeekCur),
        libc::SEEK_END => Ok(SeekEnd),
        _ => Err(ErrorKind::Inval),
    }
}

/// A raw sockaddr as bridged from guest memory has no Rust type on this
/// side; `UnixAddr`/`SockaddrStorage` round-trip arbitrary bytes, which is
/// all a passthrough connect/send needs (the kernel validates the family).
fn raw_sockaddr(bytes: &[u8]) -> Result<nix::sys::socket::SockaddrStorage> {
    use std::mem::MaybeUninit;
    if bytes.len() > std::mem::size_of::<libc::sockaddr_storage>() {
        return Err(ErrorKind::Inval);
    }
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            storage.as_mut_ptr() as *mut u8,
            bytes.len(),
        );
        let len = bytes.len() as libc::socklen_t;
        nix::sys::socket::SockaddrStorage::from_raw(
            storage.as_ptr() as *const libc::sockaddr,
            Some(len),
        )
        .ok_or(ErrorKind::Inval)
    }
}
