//! Backend file objects.
//!
//! The four backend kinds are modeled as a sealed tagged `enum`; dispatch
//! is a `match` on the tag, not runtime virtual dispatch. Absent operations
//! (socket ops on a
//! non-socket backend, writes to a read-only `proc` file) return the
//! appropriate `ErrorKind` from the method itself rather than panicking.

pub mod cow;
pub mod dirstream;
pub mod passthrough;
pub mod procfs;
pub mod tmp;

use crate::error::{ErrorKind, Result};
use crate::overlay::{tombstones::Tombstones, Overlay};
use dirstream::DirStream;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

bitflags::bitflags! {
    /// Open flags as stored on a `File`. A strict subset of `O_*` — just
    /// the bits the `fcntl`/`openat` handlers care about.
    pub struct OpenFlags: i32 {
        const ACCMODE   = libc::O_ACCMODE;
        const RDONLY    = libc::O_RDONLY;
        const WRONLY    = libc::O_WRONLY;
        const RDWR      = libc::O_RDWR;
        const APPEND    = libc::O_APPEND;
        const CREAT     = libc::O_CREAT;
        const EXCL      = libc::O_EXCL;
        const TRUNC     = libc::O_TRUNC;
        const NONBLOCK  = libc::O_NONBLOCK;
        const DIRECT    = libc::O_DIRECT;
        const NOATIME   = libc::O_NOATIME;
        const ASYNC     = libc::O_ASYNC;
        const CLOEXEC   = libc::O_CLOEXEC;
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

impl OpenFlags {
    /// `fcntl(F_SETFL, ...)` may only change these bits;
    /// `ACCMODE`/`CREAT`/`EXCL`/`TRUNC` are preserved.
    pub const MUTABLE_BY_SETFL: OpenFlags = OpenFlags {
        bits: libc::O_APPEND | libc::O_ASYNC | libc::O_DIRECT | libc::O_NOATIME | libc::O_NONBLOCK,
    };
}

pub use cow::CowFile;
pub use passthrough::PassthroughFile;
pub use procfs::ProcFile;
pub use tmp::TmpFile;

pub enum BackendKind {
    Passthrough(PassthroughFile),
    Cow(CowFile),
    Tmp(TmpFile),
    Proc(ProcFile),
}

pub struct File {
    pub backend: BackendKind,
    open_flags: Mutex<OpenFlags>,
    pub opened_path: Option<String>,
    dir_stream: Mutex<Option<DirStream>>,
}

impl File {
    pub fn new(backend: BackendKind, open_flags: OpenFlags, opened_path: Option<String>) -> File {
        File {
            backend,
            open_flags: Mutex::new(open_flags),
            opened_path,
            dir_stream: Mutex::new(None),
        }
    }

    pub fn open_flags(&self) -> OpenFlags {
        *self.open_flags.lock().unwrap()
    }

    pub fn set_open_flags(&self, flags: OpenFlags) {
        *self.open_flags.lock().unwrap() = flags;
    }

    /// The host fd currently backing this file, if any.
    pub fn backing_fd(&self) -> Option<RawFd> {
        match &self.backend {
            BackendKind::Passthrough(p) => Some(p.fd()),
            BackendKind::Cow(c) => Some(c.fd()),
            BackendKind::Tmp(t) => Some(t.fd()),
            BackendKind::Proc(_) => None,
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match &self.backend {
            BackendKind::Passthrough(p) => p.read(buf),
            BackendKind::Cow(c) => c.read(buf),
            BackendKind::Tmp(t) => t.read(buf),
            BackendKind::Proc(p) => p.read(buf),
        }
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        match &self.backend {
            BackendKind::Passthrough(p) => p.write(buf),
            BackendKind::Cow(c) => c.write(buf),
            BackendKind::Tmp(t) => t.write(buf),
            BackendKind::Proc(_) => Err(ErrorKind::Io),
        }
    }

    pub fn lseek(&self, offset: i64, whence: i32) -> Result<i64> {
        match &self.backend {
            BackendKind::Passthrough(p) => p.lseek(offset, whence),
            BackendKind::Cow(c) => c.lseek(offset, whence),
            BackendKind::Tmp(t) => t.lseek(offset, whence),
            BackendKind::Proc(p) => p.lseek(offset, whence),
        }
    }

    pub fn statx(&self) -> Result<libc::stat> {
        match &self.backend {
            BackendKind::Passthrough(p) => p.statx(),
            BackendKind::Cow(c) => c.statx(),
            BackendKind::Tmp(t) => t.statx(),
            BackendKind::Proc(p) => p.statx(),
        }
    }

    /// True for a backend whose directory listing needs no supervisor
    /// state (`overlay`/`tombstones`) to build — just a raw kernel read.
    pub fn is_passthrough(&self) -> bool {
        matches!(self.backend, BackendKind::Passthrough(_))
    }

    /// Directory listing for `passthrough`/`proc`, which read straight
    /// from the kernel or a frozen snapshot and need no overlay state.
    /// Callers must not hold the supervisor lock across this call.
    pub fn getdents64_unlocked(&self, cap: usize) -> Result<Vec<u8>> {
        let mut guard = self.dir_stream.lock().unwrap();
        if guard.is_none() {
            let built = match &self.backend {
                BackendKind::Passthrough(p) => p.build_dir_stream()?,
                BackendKind::Proc(p) => p.build_dir_stream()?,
                BackendKind::Cow(_) | BackendKind::Tmp(_) => return Err(ErrorKind::Inval),
            };
            *guard = Some(built);
        }
        Ok(guard.as_mut().unwrap().next_chunk(cap))
    }

    /// Directory listing for `cow`/`tmp`, merging physical entries with
    /// tombstone state. Requires the caller to hold the supervisor lock
    /// for the duration of the call (the overlay/tombstones borrow it).
    pub fn getdents64(&self, cap: usize, overlay: &Overlay, tombstones: &Tombstones) -> Result<Vec<u8>> {
        let mut guard = self.dir_stream.lock().unwrap();
        if guard.is_none() {
            let built = match &self.backend {
                BackendKind::Passthrough(p) => p.build_dir_stream()?,
                BackendKind::Cow(c) => c.build_dir_stream(overlay, tombstones)?,
                BackendKind::Tmp(t) => t.build_dir_stream(overlay, tombstones)?,
                BackendKind::Proc(p) => p.build_dir_stream()?,
            };
            *guard = Some(built);
        }
        Ok(guard.as_mut().unwrap().next_chunk(cap))
    }

    pub fn connect(&self, addr: &[u8]) -> Result<()> {
        match &self.backend {
            BackendKind::Passthrough(p) => p.connect(addr),
            _ => Err(ErrorKind::NotSock),
        }
    }

    pub fn send_to(&self, buf: &[u8], addr: Option<&[u8]>) -> Result<usize> {
        match &self.backend {
            BackendKind::Passthrough(p) => p.send_to(buf, addr),
            _ => Err(ErrorKind::NotSock),
        }
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<usize> {
        match &self.backend {
            BackendKind::Passthrough(p) => p.recv_from(buf),
            _ => Err(ErrorKind::NotSock),
        }
    }

    pub fn shutdown(&self, how: i32) -> Result<()> {
        match &self.backend {
            BackendKind::Passthrough(p) => p.shutdown(how),
            _ => Err(ErrorKind::NotSock),
        }
    }
}

/// Raw `getdents64(2)` on an already-open directory fd, looping until the
/// kernel reports no more entries or `cap` bytes have been requested.
pub(crate) fn read_raw_dirents(fd: RawFd, cap: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; cap.max(1)];
    let n = unsafe { libc::syscall(libc::SYS_getdents64, fd, buf.as_mut_ptr(), buf.len()) };
    if n < 0 {
        return Err(ErrorKind::Io);
    }
    buf.truncate(n as usize);
    Ok(buf)
}

pub(crate) struct RawDirent<'a> {
    pub(crate) name: &'a str,
    pub(crate) d_type: u8,
}

pub(crate) fn parse_raw_dirents(bytes: &[u8]) -> Vec<RawDirent<'_>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 19 <= bytes.len() {
        let reclen = u16::from_ne_bytes([bytes[pos + 16], bytes[pos + 17]]) as usize;
        if reclen == 0 || pos + reclen > bytes.len() {
            break;
        }
        let d_type = bytes[pos + 18];
        let name_start = pos + 19;
        let nul = bytes[name_start..pos + reclen]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(reclen - 19);
        if let Ok(name) = std::str::from_utf8(&bytes[name_start..name_start + nul]) {
            if name != "." && name != ".." {
                out.push(RawDirent { name, d_type });
            }
        }
        pos += reclen;
    }
    out
}

/// Builds a tombstone-filtered `DirStream` for a cow/tmp host directory fd,
/// draining the kernel's `getdents64` into an in-memory snapshot once. The
/// resulting stream stores a resumption offset so successive calls return
/// new records until exhaustion.
pub(crate) fn build_filtered_dir_stream(
    fd: RawFd,
    guest_dir: &str,
    tombstones: &Tombstones,
) -> Result<DirStream> {
    let mut raw = Vec::new();
    loop {
        let chunk = read_raw_dirents(fd, 32 * 1024)?;
        if chunk.is_empty() {
            break;
        }
        raw.extend_from_slice(&chunk);
    }
    let parsed = parse_raw_dirents(&raw);
    let mut entries = Vec::new();
    for entry in parsed {
        let child_path = if guest_dir.ends_with('/') {
            format!("{}{}", guest_dir, entry.name)
        } else {
            format!("{}/{}", guest_dir, entry.name)
        };
        if tombstones.is_tombstoned(&child_path) || tombstones.is_ancestor_tombstoned(&child_path) {
            continue;
        }
        entries.push((entry.name.to_string(), entry.d_type));
    }
    Ok(DirStream::with_dots(entries))
}
