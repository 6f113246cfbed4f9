//! Per-handler behavior: one handler per virtualized syscall. Every
//! handler shares the shape parse -> (route) -> (critical section) ->
//! effect -> reply; `dispatch` is the only caller of these functions.
//!
//! Handlers never hold the supervisor mutex across a blocking I/O call:
//! the common pattern here is
//! `sup.lock()` just long enough to resolve a path or clone an `Arc<File>`,
//! then drop the guard before touching the filesystem or a guest's memory.

pub mod fd;
pub mod fs;
pub mod io;
pub mod process;

use crate::backend::File;
use crate::error::{ErrorKind, Result};
use crate::namespace::AbsTid;
use crate::notify::Notification;
use crate::router::{self, Route};
use crate::supervisor::Supervisor;
use crate::thread::ThreadId;
use std::sync::Arc;

/// `AT_FDCWD`, as used by every `*at` syscall's `dirfd` argument.
pub const AT_FDCWD: i32 = libc::AT_FDCWD;

/// Looks up the caller's `ThreadId`, mapping an unknown tid to `SRCH` —
/// every handler treats an unrecognized caller tid the same way.
pub fn require_thread(sup: &Supervisor, tid: AbsTid) -> Result<ThreadId> {
    sup.lock().registry.get(tid)
}

/// Reads a NUL-terminated path string out of the caller's address space
/// into a fixed `PATH_MAX`-sized scratch buffer.
pub fn read_path(tid: AbsTid, addr: crate::memory::GuestAddr) -> Result<String> {
    let mut buf = [0u8; 4096];
    let bytes = crate::memory::read_string(&mut buf, tid.0, addr)?;
    std::str::from_utf8(bytes).map(str::to_string).map_err(|_| ErrorKind::Inval)
}

/// Resolves the base directory a relative path argument is joined
/// against: the thread's cwd for `AT_FDCWD`, or the `opened_path` of an
/// already-open directory fd otherwise, via that fd's `opened_path`.
pub fn resolve_base(sup: &Supervisor, tid: AbsTid, dirfd: i32) -> Result<String> {
    if dirfd == AT_FDCWD {
        let state = sup.lock();
        let thread_id = state.registry.get(tid)?;
        return Ok(state.registry.thread(thread_id)?.fs.cwd.clone());
    }
    let state = sup.lock();
    let thread_id = state.registry.get(tid)?;
    let thread = state.registry.thread(thread_id)?;
    let entry = thread.fds.get(dirfd)?;
    entry.file.opened_path.clone().ok_or(ErrorKind::NotDir)
}

/// Routes `user_path` relative to `dirfd` against the configured policy
/// table. A blocked path maps to `PERM` here (most callers want that
/// directly rather than matching on `Route::Block` themselves).
pub fn route(sup: &Supervisor, tid: AbsTid, dirfd: i32, user_path: &str) -> Result<(crate::router::Backend, String)> {
    let base = resolve_base(sup, tid, dirfd)?;
    match router::resolve_and_route(&sup.config, &base, user_path)? {
        Route::Block => Err(ErrorKind::Perm),
        Route::Handle { backend, normalized_path } => Ok((backend, normalized_path)),
    }
}

/// Clones the `Arc<File>` behind `fd` in the caller's table so the rest of
/// the handler can do I/O after releasing the mutex.
pub fn get_file(sup: &Supervisor, tid: AbsTid, fd: i32) -> Result<Arc<File>> {
    let state = sup.lock();
    let thread_id = state.registry.get(tid)?;
    let thread = state.registry.thread(thread_id)?;
    Ok(thread.fds.get(fd)?.file.clone())
}

/// The three kernel-reserved stdio fds.
pub fn is_stdio(fd: i32) -> bool {
    (0..=2).contains(&fd)
}

pub const STDOUT_FD: i32 = 1;
pub const STDERR_FD: i32 = 2;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn require_thread_unknown_tid_is_srch() {
        let sup = Supervisor::new(Config::default(), AbsTid(1), "/".to_string());
        assert_eq!(require_thread(&sup, AbsTid(999)), Err(ErrorKind::Srch));
    }

    #[test]
    fn resolve_base_at_fdcwd_returns_cwd() {
        let sup = Supervisor::new(Config::default(), AbsTid(1), "/home/guest".to_string());
        assert_eq!(resolve_base(&sup, AbsTid(1), AT_FDCWD).unwrap(), "/home/guest");
    }
}
