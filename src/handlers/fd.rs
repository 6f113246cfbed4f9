//! Fd-table handlers: `dup`, `dup3`, `fcntl`, `lseek`, `getdents64`.

use super::{get_file, is_stdio, require_thread};
use crate::backend::OpenFlags;
use crate::error::{ErrorKind, Result};
use crate::fdtable::FIRST_AUTO_FD;
use crate::memory::GuestAddr;
use crate::namespace::AbsTid;
use crate::notify::{Notification, Response};
use crate::supervisor::Supervisor;

pub fn dup(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let old = notif.arg(0) as i32;
    let thread_id = require_thread(sup, tid)?;
    let mut state = sup.lock();
    let thread = state.registry.thread_mut(thread_id)?;
    let file = thread.fds.get(old)?.file.clone();
    let fd = thread.fds.insert(file, false, FIRST_AUTO_FD);
    Ok(Response::Success(fd as u64))
}

pub fn dup3(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let old = notif.arg(0) as i32;
    let new = notif.arg(1) as i32;
    let flags = notif.arg(2) as i32;

    if flags & !libc::O_CLOEXEC != 0 {
        return Err(ErrorKind::Inval);
    }
    if old == new {
        return Err(ErrorKind::Inval);
    }
    if is_stdio(new) {
        // Stdio fds aren't reassignable — they stay bound to the capture sinks.
        return Err(ErrorKind::Inval);
    }

    let thread_id = require_thread(sup, tid)?;
    let mut state = sup.lock();
    let thread = state.registry.thread_mut(thread_id)?;
    let file = thread.fds.get(old)?.file.clone();
    thread.fds.insert_at(new, file, flags & libc::O_CLOEXEC != 0);
    Ok(Response::Success(new as u64))
}

const F_DUPFD: i32 = libc::F_DUPFD;
const F_DUPFD_CLOEXEC: i32 = libc::F_DUPFD_CLOEXEC;
const F_GETFD: i32 = libc::F_GETFD;
const F_SETFD: i32 = libc::F_SETFD;
const F_GETFL: i32 = libc::F_GETFL;
const F_SETFL: i32 = libc::F_SETFL;

/// Cmds that are knowingly imprecise and simply stubbed to success:
/// `GETLK`/`SETLK(W)`, `OFD_*`, `OWN*`, `SIG*`.
fn is_stubbed_cmd(cmd: i32) -> bool {
    matches!(
        cmd,
        libc::F_GETLK
            | libc::F_SETLK
            | libc::F_SETLKW
            | libc::F_OFD_GETLK
            | libc::F_OFD_SETLK
            | libc::F_OFD_SETLKW
            | libc::F_GETOWN
            | libc::F_SETOWN
            | libc::F_GETSIG
            | libc::F_SETSIG
    )
}

pub fn fcntl(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let cmd = notif.arg(1) as i32;
    let arg = notif.arg(2);

    match cmd {
        F_DUPFD | F_DUPFD_CLOEXEC => {
            let min = arg as i32;
            let thread_id = require_thread(sup, tid)?;
            let mut state = sup.lock();
            let thread = state.registry.thread_mut(thread_id)?;
            let file = thread.fds.get(fd)?.file.clone();
            let new_fd = thread.fds.insert(file, cmd == F_DUPFD_CLOEXEC, min.max(FIRST_AUTO_FD));
            Ok(Response::Success(new_fd as u64))
        }
        F_GETFD => {
            let thread_id = require_thread(sup, tid)?;
            let state = sup.lock();
            let cloexec = state.registry.thread(thread_id)?.fds.cloexec(fd)?;
            Ok(Response::Success(if cloexec { libc::FD_CLOEXEC as u64 } else { 0 }))
        }
        F_SETFD => {
            let thread_id = require_thread(sup, tid)?;
            let mut state = sup.lock();
            state
                .registry
                .thread_mut(thread_id)?
                .fds
                .set_cloexec(fd, arg as i32 & libc::FD_CLOEXEC != 0)?;
            Ok(Response::Success(0))
        }
        F_GETFL => {
            let file = get_file(sup, tid, fd)?;
            Ok(Response::Success(file.open_flags().bits() as u64))
        }
        F_SETFL => {
            let file = get_file(sup, tid, fd)?;
            let requested = OpenFlags::from_bits_truncate(arg as i32);
            let preserved = file.open_flags() & !OpenFlags::MUTABLE_BY_SETFL;
            let mutable = requested & OpenFlags::MUTABLE_BY_SETFL;
            let new_flags = preserved | mutable;
            file.set_open_flags(new_flags);
            if let Some(raw_fd) = file.backing_fd() {
                let oflag = nix::fcntl::OFlag::from_bits_truncate(new_flags.bits());
                let _ = nix::fcntl::fcntl(raw_fd, nix::fcntl::FcntlArg::F_SETFL(oflag));
            }
            Ok(Response::Success(0))
        }
        cmd if is_stubbed_cmd(cmd) => Ok(Response::Success(0)),
        _ => Err(ErrorKind::Inval),
    }
}

pub fn lseek(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let offset = notif.arg(1) as i64;
    let whence = notif.arg(2) as i32;
    if is_stdio(fd) {
        return Err(ErrorKind::SPipe);
    }
    if whence == libc::SEEK_SET && offset < 0 {
        return Err(ErrorKind::Inval);
    }
    let file = get_file(sup, tid, fd)?;
    let pos = file.lseek(offset, whence)?;
    Ok(Response::Success(pos as u64))
}

pub fn getdents64(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let buf_addr = GuestAddr(notif.arg(1));
    let count = notif.arg(2) as usize;
    if is_stdio(fd) {
        return Ok(Response::Continue);
    }
    let file = get_file(sup, tid, fd)?;
    let cap = count.min(4096);
    let bytes = if file.is_passthrough() {
        // No overlay/tombstone state needed here, so the blocking kernel
        // getdents64(2) runs with the supervisor lock already released.
        file.getdents64_unlocked(cap)?
    } else {
        let state = sup.lock();
        file.getdents64(cap, &state.overlay, &state.tombstones)?
    };
    let len = bytes.len();
    if len > 0 {
        crate::memory::write_slice(&bytes, tid.0, buf_addr)?;
    }
    Ok(Response::Success(len as u64))
}
