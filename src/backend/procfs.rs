//! Synthesized `/proc` backend for the `proc` route.
//!
//! `proc` files have no backing host fd. Their content — or, for a
//! directory, their entry list — is computed once at `openat` time from
//! supervisor state (by the handler layer, which has the registry this
//! module doesn't) and frozen for the life of the fd: a guest that reads
//! `/proc/self/status` twice through the same fd after another thread
//! has changed state still sees what was true when it opened the file.
//! This sidesteps needing to hold any lock while a read is outstanding.

use super::dirstream::DirStream;
use super::passthrough::whence_from_raw;
use crate::error::{ErrorKind, Result};
use std::sync::Mutex;

enum Content {
    Bytes(Vec<u8>),
    Dir(Vec<(String, u8)>),
}

pub struct ProcFile {
    content: Content,
    offset: Mutex<u64>,
}

impl ProcFile {
    pub fn new_file(bytes: Vec<u8>) -> ProcFile {
        ProcFile {
            content: Content::Bytes(bytes),
            offset: Mutex::new(0),
        }
    }

    pub fn new_dir(entries: Vec<(String, u8)>) -> ProcFile {
        ProcFile {
            content: Content::Dir(entries),
            offset: Mutex::new(0),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let bytes = match &self.content {
            Content::Bytes(b) => b,
            Content::Dir(_) => return Err(ErrorKind::IsDir),
        };
        let mut offset = self.offset.lock().unwrap();
        let start = (*offset as usize).min(bytes.len());
        let n = (bytes.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        *offset += n as u64;
        Ok(n)
    }

    pub fn lseek(&self, offset: i64, whence: i32) -> Result<i64> {
        let whence = whence_from_raw(whence)?;
        let len = match &self.content {
            Content::Bytes(b) => b.len() as i64,
            Content::Dir(_) => return Err(ErrorKind::IsDir),
        };
        let mut cur = self.offset.lock().unwrap();
        let base = match whence {
            nix::unistd::Whence::SeekSet => 0,
            nix::unistd::Whence::SeekCur => *cur as i64,
            nix::unistd::Whence::SeekEnd => len,
            _ => return Err(ErrorKind::Inval),
        };
        let new_off = base + offset;
        if new_off < 0 {
            return Err(ErrorKind::Inval);
        }
        *cur = new_off as u64;
        Ok(new_off)
    }

    pub fn statx(&self) -> Result<libc::stat> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        match &self.content {
            Content::Bytes(b) => {
                st.st_mode = libc::S_IFREG | 0o444;
                st.st_size = b.len() as i64;
            }
            Content::Dir(_) => {
                st.st_mode = libc::S_IFDIR | 0o555;
            }
        }
        Ok(st)
    }

    pub fn build_dir_stream(&self) -> Result<DirStream> {
        match &self.content {
            Content::Dir(entries) => Ok(DirStream::with_dots(entries.clone())),
            Content::Bytes(_) => Err(ErrorKind::NotDir),
        }
    }
}
