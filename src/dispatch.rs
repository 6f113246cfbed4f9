//! Syscall dispatch.
//!
//! Maps a `Notification`'s syscall number to the matching handler, invokes
//! it, and turns the handler's `Result<Response>` into the one `Response`
//! that gets posted back for this notification — exactly one response per
//! notification, always. This is the only place in the crate that knows
//! the mapping from `libc::SYS_*` numbers to `handlers::*` functions.

use crate::handlers::{fd, fs, io, process};
use crate::log::LogLevel::*;
use crate::namespace::AbsTid;
use crate::notify::{Notification, Response};
use crate::supervisor::Supervisor;
use crate::{error::ErrorKind, log};

/// Handles one notification end to end. Never panics on an unrecognized
/// syscall number — it reports `NOSYS` instead. Bit-exact error codes for
/// unimplemented syscalls are not attempted; they uniformly report "not
/// supported".
pub fn dispatch(sup: &Supervisor, notif: &Notification) -> Response {
    let tid = AbsTid(notif.pid);
    log!(LogTrace, "dispatch: syscall={} tid={}", notif.syscall, tid.0);

    let result = match notif.syscall {
        libc::SYS_read => io::read(sup, tid, notif),
        libc::SYS_write => io::write(sup, tid, notif),
        libc::SYS_readv => io::readv(sup, tid, notif),
        libc::SYS_writev => io::writev(sup, tid, notif),
        libc::SYS_recvfrom => io::recvfrom(sup, tid, notif),
        libc::SYS_recvmsg => io::recvmsg(sup, tid, notif),
        libc::SYS_sendto => io::sendto(sup, tid, notif),
        libc::SYS_sendmsg => io::sendmsg(sup, tid, notif),
        libc::SYS_socket => io::socket(sup, tid, notif),
        libc::SYS_socketpair => io::socketpair(sup, tid, notif),
        libc::SYS_pipe2 => io::pipe2(sup, tid, notif),
        libc::SYS_connect => io::connect(sup, tid, notif),
        libc::SYS_shutdown => io::shutdown(sup, tid, notif),

        libc::SYS_openat => fs::openat(sup, tid, notif),
        libc::SYS_close => fs::close(sup, tid, notif),
        libc::SYS_chdir => fs::chdir(sup, tid, notif),
        libc::SYS_fchdir => fs::fchdir(sup, tid, notif),
        libc::SYS_getcwd => fs::getcwd(sup, tid, notif),
        libc::SYS_mkdirat => fs::mkdirat(sup, tid, notif),
        libc::SYS_unlinkat => fs::unlinkat(sup, tid, notif),
        libc::SYS_symlinkat => fs::symlinkat(sup, tid, notif),
        libc::SYS_readlinkat => fs::readlinkat(sup, tid, notif),
        libc::SYS_fchmodat => fs::fchmodat(sup, tid, notif),
        libc::SYS_utimensat => fs::utimensat(sup, tid, notif),
        libc::SYS_faccessat => fs::faccessat(sup, tid, notif),
        libc::SYS_execve => fs::execve(sup, tid, notif),

        libc::SYS_dup => fd::dup(sup, tid, notif),
        libc::SYS_dup3 => fd::dup3(sup, tid, notif),
        libc::SYS_fcntl => fd::fcntl(sup, tid, notif),
        libc::SYS_lseek => fd::lseek(sup, tid, notif),
        libc::SYS_getdents64 => fd::getdents64(sup, tid, notif),

        libc::SYS_sysinfo => process::sysinfo(sup, tid, notif),
        libc::SYS_uname => process::uname(sup, tid, notif),
        libc::SYS_getppid => process::getppid(sup, tid, notif),
        libc::SYS_gettid => process::gettid(sup, tid, notif),
        libc::SYS_kill => process::kill(sup, tid, notif),
        libc::SYS_tkill => process::tkill(sup, tid, notif),
        libc::SYS_exit => process::exit(sup, tid, notif),
        libc::SYS_exit_group => process::exit_group(sup, tid, notif),

        other => {
            log!(LogDebug, "dispatch: unsupported syscall {} from tid={}", other, tid.0);
            Err(ErrorKind::NoSys)
        }
    };

    let response = result.unwrap_or_else(|e| {
        log!(LogDebug, "dispatch: syscall={} tid={} -> error {:?}", notif.syscall, tid.0, e);
        Response::Error(e)
    });
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn notif(syscall: i32, args: [u64; 6]) -> Notification {
        Notification::from_raw(1, syscall, 0, std::process::id() as i32, args, 0)
    }

    #[test]
    fn unknown_syscall_yields_nosys() {
        let sup = Supervisor::new(Config::default(), AbsTid(std::process::id() as i32), "/".to_string());
        let resp = dispatch(&sup, &notif(999_999, [0; 6]));
        assert_eq!(resp, Response::Error(ErrorKind::NoSys));
    }

    #[test]
    fn gettid_returns_one_for_root_thread() {
        let sup = Supervisor::new(Config::default(), AbsTid(std::process::id() as i32), "/".to_string());
        let resp = dispatch(&sup, &notif(libc::SYS_gettid, [0; 6]));
        assert_eq!(resp, Response::Success(1));
    }

    #[test]
    fn unknown_tid_yields_srch() {
        let sup = Supervisor::new(Config::default(), AbsTid(1), "/".to_string());
        let mut n = notif(libc::SYS_gettid, [0; 6]);
        n.pid = 999_999;
        let resp = dispatch(&sup, &n);
        assert_eq!(resp, Response::Error(ErrorKind::Srch));
    }
}
