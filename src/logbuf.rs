//! Append-only capture sinks for virtualized stdout/stderr.
//!
//! A log buffer supports `write(bytes)` (append) and `read() -> bytes`
//! (drain). After a drain, subsequent reads return only data written
//! since. The supervisor owns one per guest stdio stream; handlers reach
//! it through the coordination mutex like any other shared state.

use std::sync::Mutex;

#[derive(Default)]
pub struct LogBuffer {
    inner: Mutex<Vec<u8>>,
}

impl LogBuffer {
    pub fn new() -> LogBuffer {
        LogBuffer {
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn write(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().extend_from_slice(bytes);
    }

    /// Drains and returns everything written since the last drain.
    pub fn read(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_then_read_only_sees_new_writes() {
        let buf = LogBuffer::new();
        buf.write(b"hello ");
        buf.write(b"world");
        assert_eq!(buf.read(), b"hello world");
        assert!(buf.is_empty());
        buf.write(b"again");
        assert_eq!(buf.read(), b"again");
    }
}
