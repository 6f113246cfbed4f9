//! Shared `getdents64` record encoding.
//!
//! Each call's output is a concatenation of variable-length records with a
//! 16-bit record-length field at a fixed byte offset and a NUL-terminated
//! name, matching the kernel's `struct linux_dirent64` layout so guest
//! readers that walk records by `d_reclen` work unmodified:
//!
//! ```text
//! u64 d_ino; i64 d_off; u16 d_reclen; u8 d_type; char d_name[]; // NUL-terminated
//! ```

use std::mem::size_of;

#[repr(C)]
struct Header {
    d_ino: u64,
    d_off: i64,
    d_reclen: u16,
    d_type: u8,
}

fn record_len(name: &[u8]) -> usize {
    let raw = size_of::<Header>() + name.len() + 1;
    // Kernel records are 8-byte aligned; harmless to round up here too.
    (raw + 7) & !7
}

fn encode_record(out: &mut Vec<u8>, ino: u64, off: i64, d_type: u8, name: &[u8]) {
    let reclen = record_len(name);
    let start = out.len();
    out.resize(start + reclen, 0);
    out[start..start + 8].copy_from_slice(&ino.to_ne_bytes());
    out[start + 8..start + 16].copy_from_slice(&off.to_ne_bytes());
    out[start + 16..start + 18].copy_from_slice(&(reclen as u16).to_ne_bytes());
    out[start + 18] = d_type;
    out[start + 19..start + 19 + name.len()].copy_from_slice(name);
    // out[start + 19 + name.len()] left as the NUL terminator (already zeroed).
}

/// A cursor over a snapshot of directory entries, handed out one
/// buffer-sized chunk at a time across successive `getdents64` calls,
/// terminating with an empty (EOF) chunk.
pub struct DirStream {
    entries: Vec<(String, u8)>,
    next: usize,
}

/// d_type values (see `<dirent.h>`).
pub const DT_UNKNOWN: u8 = 0;
pub const DT_DIR: u8 = 4;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;

impl DirStream {
    pub fn new(entries: Vec<(String, u8)>) -> DirStream {
        DirStream { entries, next: 0 }
    }

    /// Builds the canonical `.`/`..` prefix plus the given entries.
    pub fn with_dots(mut entries: Vec<(String, u8)>) -> DirStream {
        let mut all = vec![(".".to_string(), DT_DIR), ("..".to_string(), DT_DIR)];
        all.append(&mut entries);
        DirStream::new(all)
    }

    /// Serializes up to `cap` bytes worth of records starting from the
    /// cursor, advancing it. Returns an empty vec once exhausted (EOF).
    pub fn next_chunk(&mut self, cap: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while self.next < self.entries.len() {
            let (name, d_type) = &self.entries[self.next];
            let reclen = record_len(name.as_bytes());
            if !out.is_empty() && out.len() + reclen > cap {
                break;
            }
            if out.is_empty() && reclen > cap {
                // Single record doesn't fit; nothing we can do but stop.
                break;
            }
            encode_record(&mut out, (self.next + 1) as u64, (self.next + 1) as i64, *d_type, name.as_bytes());
            self.next += 1;
        }
        out
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names_in(bytes: &[u8]) -> Vec<String> {
        let mut names = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let reclen = u16::from_ne_bytes([bytes[pos + 16], bytes[pos + 17]]) as usize;
            let name_start = pos + 19;
            let nul = bytes[name_start..pos + reclen].iter().position(|&b| b == 0).unwrap();
            names.push(String::from_utf8(bytes[name_start..name_start + nul].to_vec()).unwrap());
            pos += reclen;
        }
        names
    }

    #[test]
    fn emits_dot_and_dotdot_then_entries() {
        let mut stream = DirStream::with_dots(vec![("a".into(), DT_REG), ("b".into(), DT_REG)]);
        let chunk = stream.next_chunk(4096);
        assert_eq!(names_in(&chunk), vec![".", "..", "a", "b"]);
        assert!(stream.next_chunk(4096).is_empty());
    }

    #[test]
    fn small_cap_splits_across_calls() {
        let mut stream = DirStream::with_dots(vec![("a".into(), DT_REG), ("b".into(), DT_REG)]);
        let mut all_names = Vec::new();
        loop {
            let chunk = stream.next_chunk(32);
            if chunk.is_empty() {
                break;
            }
            all_names.extend(names_in(&chunk));
        }
        assert_eq!(all_names, vec![".", "..", "a", "b"]);
    }
}
