//! Notification protocol.
//!
//! A notification becomes exactly one of three responses before the kernel
//! resumes the caller. This module only builds and parses the in-process
//! representation of those records; translating them to/from the kernel's
//! actual `seccomp_notif`/`seccomp_notif_resp` wire layout is the
//! launcher's job — `Notification::from_raw` is the narrow seam it uses to
//! hand a request in.

use crate::error::ErrorKind;
use libc::pid_t;

/// `flags` bit indicating "continue to kernel" in the reply.
pub const RESP_FLAG_CONTINUE: u32 = 1;

/// A notification request as delivered by the kernel:
/// `{ id, syscall, arch, pid, args: [6]u64, instruction_pointer }`.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct Notification {
    pub id: u64,
    pub syscall: i32,
    pub arch: u32,
    pub pid: pid_t,
    pub args: [u64; 6],
    pub instruction_pointer: u64,
}

impl Notification {
    /// Constructs a `Notification` from the raw wire fields. The launcher
    /// reads the kernel's notification struct and calls this; this crate
    /// never parses raw bytes off a `seccomp_notify` fd itself.
    pub fn from_raw(
        id: u64,
        syscall: i32,
        arch: u32,
        pid: pid_t,
        args: [u64; 6],
        instruction_pointer: u64,
    ) -> Notification {
        Notification {
            id,
            syscall,
            arch,
            pid,
            args,
            instruction_pointer,
        }
    }

    pub fn arg(&self, n: usize) -> u64 {
        self.args[n]
    }
}

/// The three possible outcomes of handling a notification.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Response {
    /// The syscall returns `value` (non-negative).
    Success(u64),
    /// The syscall returns -1 with this errno.
    Error(ErrorKind),
    /// The kernel executes the original syscall unmodified, possibly
    /// after guest memory has already been rewritten.
    Continue,
}

impl Response {
    pub fn from_result(r: crate::error::Result<u64>) -> Response {
        match r {
            Ok(v) => Response::Success(v),
            Err(e) => Response::Error(e),
        }
    }
}

/// The wire reply: `{ id, value, error, flags }`, where non-zero `error`
/// takes precedence over `value`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct RawReply {
    pub id: u64,
    pub value: i64,
    pub error: i32,
    pub flags: u32,
}

/// Builds the wire reply for a given notification id and response. Exactly
/// one reply is produced per call.
pub fn build_reply(id: u64, response: Response) -> RawReply {
    match response {
        Response::Success(value) => RawReply {
            id,
            value: value as i64,
            error: 0,
            flags: 0,
        },
        Response::Error(kind) => RawReply {
            id,
            value: -1,
            error: kind.errno(),
            flags: 0,
        },
        Response::Continue => RawReply {
            id,
            value: 0,
            error: 0,
            flags: RESP_FLAG_CONTINUE,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_reply_has_no_error() {
        let reply = build_reply(7, Response::Success(42));
        assert_eq!(reply.id, 7);
        assert_eq!(reply.value, 42);
        assert_eq!(reply.error, 0);
        assert_eq!(reply.flags, 0);
    }

    #[test]
    fn error_reply_takes_precedence_over_value() {
        let reply = build_reply(1, Response::Error(ErrorKind::NoEnt));
        assert_eq!(reply.value, -1);
        assert_eq!(reply.error, libc::ENOENT);
    }

    #[test]
    fn continue_reply_sets_flag() {
        let reply = build_reply(2, Response::Continue);
        assert_eq!(reply.flags & RESP_FLAG_CONTINUE, RESP_FLAG_CONTINUE);
    }
}
