//! The closed POSIX-flavored error taxonomy shared by every handler.
//!
//! Unknown/unexpected failures are mapped to `Io` (for I/O paths) or
//! `Inval` (for argument paths) at the point they're produced — nothing
//! downstream of a handler ever sees a raw `std::io::Error` or
//! `nix::Error`.

use thiserror::Error;

/// A semantic error kind, mirroring POSIX errno names rather than their
/// numeric values. `dispatch` is the only place that knows the mapping to
/// an actual errno integer (see `ErrorKind::errno`).
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    #[error("operation not permitted")]
    Perm,
    #[error("no such file or directory")]
    NoEnt,
    #[error("no such process")]
    Srch,
    #[error("bad file descriptor")]
    BadF,
    #[error("out of memory")]
    NoMem,
    #[error("permission denied")]
    Acces,
    #[error("bad address")]
    Fault,
    #[error("file exists")]
    Exist,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("invalid argument")]
    Inval,
    #[error("too many open files")]
    MFile,
    #[error("illegal seek")]
    SPipe,
    #[error("result too large")]
    Range,
    #[error("file name too long")]
    NameTooLong,
    #[error("function not implemented")]
    NoSys,
    #[error("I/O error")]
    Io,
    #[error("socket operation on non-socket")]
    NotSock,
    #[error("operation not supported")]
    OpNotSupp,
    #[error("directory not empty")]
    NotEmpty,
}

impl ErrorKind {
    /// The errno value the guest observes when this kind is returned as
    /// a notification's error reply.
    pub fn errno(self) -> i32 {
        match self {
            ErrorKind::Perm => libc::EPERM,
            ErrorKind::NoEnt => libc::ENOENT,
            ErrorKind::Srch => libc::ESRCH,
            ErrorKind::BadF => libc::EBADF,
            ErrorKind::NoMem => libc::ENOMEM,
            ErrorKind::Acces => libc::EACCES,
            ErrorKind::Fault => libc::EFAULT,
            ErrorKind::Exist => libc::EEXIST,
            ErrorKind::NotDir => libc::ENOTDIR,
            ErrorKind::IsDir => libc::EISDIR,
            ErrorKind::Inval => libc::EINVAL,
            ErrorKind::MFile => libc::EMFILE,
            ErrorKind::SPipe => libc::ESPIPE,
            ErrorKind::Range => libc::ERANGE,
            ErrorKind::NameTooLong => libc::ENAMETOOLONG,
            ErrorKind::NoSys => libc::ENOSYS,
            ErrorKind::Io => libc::EIO,
            ErrorKind::NotSock => libc::ENOTSOCK,
            ErrorKind::OpNotSupp => libc::EOPNOTSUPP,
            ErrorKind::NotEmpty => libc::ENOTEMPTY,
        }
    }
}

impl From<nix::errno::Errno> for ErrorKind {
    fn from(e: nix::errno::Errno) -> ErrorKind {
        use nix::errno::Errno;
        match e {
            Errno::EPERM => ErrorKind::Perm,
            Errno::ENOENT => ErrorKind::NoEnt,
            Errno::ESRCH => ErrorKind::Srch,
            Errno::EBADF => ErrorKind::BadF,
            Errno::ENOMEM => ErrorKind::NoMem,
            Errno::EACCES => ErrorKind::Acces,
            Errno::EFAULT => ErrorKind::Fault,
            Errno::EEXIST => ErrorKind::Exist,
            Errno::ENOTDIR => ErrorKind::NotDir,
            Errno::EISDIR => ErrorKind::IsDir,
            Errno::EINVAL => ErrorKind::Inval,
            Errno::EMFILE => ErrorKind::MFile,
            Errno::ESPIPE => ErrorKind::SPipe,
            Errno::ERANGE => ErrorKind::Range,
            Errno::ENAMETOOLONG => ErrorKind::NameTooLong,
            Errno::ENOSYS => ErrorKind::NoSys,
            Errno::ENOTSOCK => ErrorKind::NotSock,
            Errno::EOPNOTSUPP => ErrorKind::OpNotSupp,
            Errno::ENOTEMPTY => ErrorKind::NotEmpty,
            _ => ErrorKind::Io,
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(e: std::io::Error) -> ErrorKind {
        match e.raw_os_error() {
            Some(code) => nix::errno::Errno::from_i32(code).into(),
            None => ErrorKind::Io,
        }
    }
}

/// Every fallible operation in the core returns this.
pub type Result<T> = std::result::Result<T, ErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(ErrorKind::NoEnt.errno(), libc::ENOENT);
        assert_eq!(ErrorKind::BadF.errno(), libc::EBADF);
    }

    #[test]
    fn nix_errno_round_trips_known_kinds() {
        let k: ErrorKind = nix::errno::Errno::ENOTEMPTY.into();
        assert_eq!(k, ErrorKind::NotEmpty);
    }

    #[test]
    fn unmapped_errno_falls_back_to_io() {
        let k: ErrorKind = nix::errno::Errno::ECONNREFUSED.into();
        assert_eq!(k, ErrorKind::Io);
    }
}
