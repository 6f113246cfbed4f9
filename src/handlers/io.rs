//! Data-path handlers: `read`/`write`/`readv`/`writev`, the socket family,
//! `socket`/`socketpair`/`pipe2`, `connect`/`shutdown`.

use super::{get_file, is_stdio, require_thread, STDERR_FD, STDOUT_FD};
use crate::backend::{BackendKind, File, OpenFlags, PassthroughFile};
use crate::error::{ErrorKind, Result};
use crate::memory::{self, GuestAddr};
use crate::namespace::AbsTid;
use crate::notify::{Notification, Response};
use crate::supervisor::Supervisor;
use std::sync::Arc;

/// Per-call transfer cap: every read/write moves at most `min(n, 4 KiB)`.
const MAX_TRANSFER: usize = 4096;
/// `readv`/`writev` bridge at most this many iovecs in one call.
const MAX_IOVECS: usize = 16;

#[repr(C)]
#[derive(Copy, Clone)]
struct RawIovec {
    base: u64,
    len: u64,
}

pub fn read(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let buf_addr = GuestAddr(notif.arg(1));
    let n = notif.arg(2) as usize;
    if fd == 0 {
        return Ok(Response::Continue);
    }
    let file = get_file(sup, tid, fd)?;
    let cap = n.min(MAX_TRANSFER);
    let mut buf = vec![0u8; cap];
    let got = file.read(&mut buf)?;
    if got > 0 {
        memory::write_slice(&buf[..got], tid.0, buf_addr)?;
    }
    Ok(Response::Success(got as u64))
}

pub fn write(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let buf_addr = GuestAddr(notif.arg(1));
    let n = notif.arg(2) as usize;

    if fd == STDOUT_FD || fd == STDERR_FD {
        let cap = n.min(MAX_TRANSFER);
        let mut buf = vec![0u8; cap];
        memory::read_slice(&mut buf, tid.0, buf_addr)?;
        let log = if fd == STDOUT_FD { &sup.stdout_log } else { &sup.stderr_log };
        log.write(&buf);
        return Ok(Response::Success(cap as u64));
    }

    let file = get_file(sup, tid, fd)?;
    if matches!(file.backend, BackendKind::Proc(_)) {
        return Err(ErrorKind::Io);
    }
    let cap = n.min(MAX_TRANSFER);
    let mut buf = vec![0u8; cap];
    memory::read_slice(&mut buf, tid.0, buf_addr)?;
    let written = write_through(sup, &file, &buf)?;
    Ok(Response::Success(written as u64))
}

/// `cow` writes may need a copy-up, which needs the supervisor's overlay;
/// every other backend's `File::write` is self-sufficient.
fn write_through(sup: &Supervisor, file: &Arc<File>, buf: &[u8]) -> Result<usize> {
    if let BackendKind::Cow(c) = &file.backend {
        let state = sup.lock();
        let n = c.write_with_overlay(buf, &state.overlay)?;
        return Ok(n);
    }
    file.write(buf)
}

fn read_iovecs(tid: AbsTid, iov_addr: GuestAddr, iovcnt: usize) -> Result<Vec<RawIovec>> {
    if iovcnt > MAX_IOVECS {
        return Err(ErrorKind::Inval);
    }
    let mut out = Vec::with_capacity(iovcnt);
    for i in 0..iovcnt {
        let addr = GuestAddr(iov_addr.0 + (i * std::mem::size_of::<RawIovec>()) as u64);
        out.push(memory::read::<RawIovec>(tid.0, addr)?);
    }
    Ok(out)
}

pub fn readv(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let iov_addr = GuestAddr(notif.arg(1));
    let iovcnt = notif.arg(2) as usize;
    if fd == 0 {
        return Ok(Response::Continue);
    }
    let iovecs = read_iovecs(tid, iov_addr, iovcnt)?;
    let file = get_file(sup, tid, fd)?;

    let mut total = 0usize;
    for iov in iovecs {
        if total >= MAX_TRANSFER {
            break;
        }
        let want = (iov.len as usize).min(MAX_TRANSFER - total);
        if want == 0 {
            continue;
        }
        let mut buf = vec![0u8; want];
        let got = file.read(&mut buf)?;
        if got > 0 {
            memory::write_slice(&buf[..got], tid.0, GuestAddr(iov.base))?;
            total += got;
        }
        if got < want {
            break;
        }
    }
    Ok(Response::Success(total as u64))
}

pub fn writev(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let iov_addr = GuestAddr(notif.arg(1));
    let iovcnt = notif.arg(2) as usize;
    let iovecs = read_iovecs(tid, iov_addr, iovcnt)?;

    let mut gathered = Vec::new();
    for iov in &iovecs {
        if gathered.len() >= MAX_TRANSFER {
            break;
        }
        let want = (iov.len as usize).min(MAX_TRANSFER - gathered.len());
        if want == 0 {
            continue;
        }
        let mut buf = vec![0u8; want];
        memory::read_slice(&mut buf, tid.0, GuestAddr(iov.base))?;
        gathered.extend_from_slice(&buf);
    }

    if fd == STDOUT_FD || fd == STDERR_FD {
        let log = if fd == STDOUT_FD { &sup.stdout_log } else { &sup.stderr_log };
        log.write(&gathered);
        return Ok(Response::Success(gathered.len() as u64));
    }

    let file = get_file(sup, tid, fd)?;
    if matches!(file.backend, BackendKind::Proc(_)) {
        return Err(ErrorKind::Io);
    }
    let written = write_through(sup, &file, &gathered)?;
    Ok(Response::Success(written as u64))
}

fn read_sockaddr(tid: AbsTid, addr: GuestAddr, len: usize) -> Result<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if !(1..=128).contains(&len) {
        return Err(ErrorKind::Inval);
    }
    let mut buf = vec![0u8; len];
    memory::read_slice(&mut buf, tid.0, addr)?;
    Ok(buf)
}

pub fn connect(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let addr = GuestAddr(notif.arg(1));
    let addrlen = notif.arg(2) as usize;
    let file = get_file(sup, tid, fd)?;
    let bytes = read_sockaddr(tid, addr, addrlen)?;
    file.connect(&bytes)?;
    Ok(Response::Success(0))
}

pub fn shutdown(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let how = notif.arg(1) as i32;
    let file = get_file(sup, tid, fd)?;
    file.shutdown(how)?;
    Ok(Response::Success(0))
}

pub fn sendto(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let buf_addr = GuestAddr(notif.arg(1));
    let n = notif.arg(2) as usize;
    let addr_ptr = notif.arg(4);
    let addrlen = notif.arg(5) as usize;

    let file = get_file(sup, tid, fd)?;
    let cap = n.min(MAX_TRANSFER);
    let mut buf = vec![0u8; cap];
    memory::read_slice(&mut buf, tid.0, buf_addr)?;
    let addr_bytes = if addr_ptr != 0 {
        Some(read_sockaddr(tid, GuestAddr(addr_ptr), addrlen)?)
    } else {
        None
    };
    let n = file.send_to(&buf, addr_bytes.as_deref())?;
    Ok(Response::Success(n as u64))
}

pub fn recvfrom(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let buf_addr = GuestAddr(notif.arg(1));
    let n = notif.arg(2) as usize;

    let file = get_file(sup, tid, fd)?;
    let cap = n.min(MAX_TRANSFER);
    let mut buf = vec![0u8; cap];
    let got = file.recv_from(&mut buf)?;
    if got > 0 {
        memory::write_slice(&buf[..got], tid.0, buf_addr)?;
    }
    Ok(Response::Success(got as u64))
}

/// `sendmsg`/`recvmsg` scatter/gather over guest `msghdr`/iovecs. Only the
/// iovec array and payload are bridged; ancillary (`msg_control`) data is
/// out of scope.
#[repr(C)]
struct RawMsghdr {
    msg_name: u64,
    msg_namelen: u32,
    _pad0: u32,
    msg_iov: u64,
    msg_iovlen: u64,
    msg_control: u64,
    msg_controllen: u64,
    _pad1: u32,
    msg_flags: i32,
}

pub fn sendmsg(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let msg_addr = GuestAddr(notif.arg(1));
    let msg: RawMsghdr = memory::read(tid.0, msg_addr)?;

    let iovecs = read_iovecs(tid, GuestAddr(msg.msg_iov), msg.msg_iovlen as usize)?;
    let mut gathered = Vec::new();
    for iov in &iovecs {
        if gathered.len() >= MAX_TRANSFER {
            break;
        }
        let want = (iov.len as usize).min(MAX_TRANSFER - gathered.len());
        if want == 0 {
            continue;
        }
        let mut buf = vec![0u8; want];
        memory::read_slice(&mut buf, tid.0, GuestAddr(iov.base))?;
        gathered.extend_from_slice(&buf);
    }
    let addr_bytes = if msg.msg_name != 0 {
        Some(read_sockaddr(tid, GuestAddr(msg.msg_name), msg.msg_namelen as usize)?)
    } else {
        None
    };
    let file = get_file(sup, tid, fd)?;
    let n = file.send_to(&gathered, addr_bytes.as_deref())?;
    Ok(Response::Success(n as u64))
}

pub fn recvmsg(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let msg_addr = GuestAddr(notif.arg(1));
    let msg: RawMsghdr = memory::read(tid.0, msg_addr)?;
    let iovecs = read_iovecs(tid, GuestAddr(msg.msg_iov), msg.msg_iovlen as usize)?;

    let file = get_file(sup, tid, fd)?;
    let total_cap: usize = iovecs.iter().map(|i| i.len as usize).sum::<usize>().min(MAX_TRANSFER);
    let mut buf = vec![0u8; total_cap];
    let got = file.recv_from(&mut buf)?;

    let mut written = 0usize;
    for iov in &iovecs {
        if written >= got {
            break;
        }
        let want = (iov.len as usize).min(got - written);
        memory::write_slice(&buf[written..written + want], tid.0, GuestAddr(iov.base))?;
        written += want;
    }
    Ok(Response::Success(written as u64))
}

pub fn socket(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let domain = notif.arg(0) as i32;
    let type_and_flags = notif.arg(1) as i32;
    let protocol = notif.arg(2) as i32;

    let sock_cloexec = type_and_flags & libc::SOCK_CLOEXEC != 0;
    let base_type = type_and_flags & !(libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK);

    let fd = unsafe { libc::socket(domain, type_and_flags, protocol) };
    if fd < 0 {
        return Err(ErrorKind::from(std::io::Error::last_os_error()));
    }
    let _ = base_type;

    let file = std::sync::Arc::new(File::new(
        BackendKind::Passthrough(PassthroughFile::new(fd)),
        OpenFlags::empty(),
        None,
    ));
    let thread_id = require_thread(sup, tid)?;
    let mut state = sup.lock();
    let thread = state.registry.thread_mut(thread_id)?;
    let vfd = thread.fds.insert(file, sock_cloexec, crate::fdtable::FIRST_AUTO_FD);
    Ok(Response::Success(vfd as u64))
}

pub fn socketpair(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let domain = notif.arg(0) as i32;
    let type_and_flags = notif.arg(1) as i32;
    let protocol = notif.arg(2) as i32;
    let fds_addr = GuestAddr(notif.arg(3));
    let sock_cloexec = type_and_flags & libc::SOCK_CLOEXEC != 0;

    let mut raw: [i32; 2] = [0; 2];
    let rc = unsafe { libc::socketpair(domain, type_and_flags, protocol, raw.as_mut_ptr()) };
    if rc < 0 {
        return Err(ErrorKind::from(std::io::Error::last_os_error()));
    }

    let thread_id = require_thread(sup, tid)?;
    let mut state = sup.lock();
    let thread = state.registry.thread_mut(thread_id)?;
    let mut vfds = [0i32; 2];
    for i in 0..2 {
        let file = std::sync::Arc::new(File::new(
            BackendKind::Passthrough(PassthroughFile::new(raw[i])),
            OpenFlags::empty(),
            None,
        ));
        vfds[i] = thread.fds.insert(file, sock_cloexec, crate::fdtable::FIRST_AUTO_FD);
    }
    drop(state);
    memory::write_slice(
        &[vfds[0].to_ne_bytes(), vfds[1].to_ne_bytes()].concat(),
        tid.0,
        fds_addr,
    )?;
    Ok(Response::Success(0))
}

pub fn pipe2(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fds_addr = GuestAddr(notif.arg(0));
    let flags = notif.arg(1) as i32;
    let cloexec = flags & libc::O_CLOEXEC != 0;

    let oflags = nix::fcntl::OFlag::from_bits_truncate(flags);
    let (r, w) = nix::unistd::pipe2(oflags).map_err(ErrorKind::from)?;

    let thread_id = require_thread(sup, tid)?;
    let mut state = sup.lock();
    let thread = state.registry.thread_mut(thread_id)?;
    let r_file = std::sync::Arc::new(File::new(BackendKind::Passthrough(PassthroughFile::new(r)), OpenFlags::empty(), None));
    let w_file = std::sync::Arc::new(File::new(BackendKind::Passthrough(PassthroughFile::new(w)), OpenFlags::empty(), None));
    let r_fd = thread.fds.insert(r_file, cloexec, crate::fdtable::FIRST_AUTO_FD);
    let w_fd = thread.fds.insert(w_file, cloexec, crate::fdtable::FIRST_AUTO_FD);
    drop(state);

    memory::write_slice(&[r_fd.to_ne_bytes(), w_fd.to_ne_bytes()].concat(), tid.0, fds_addr)?;
    Ok(Response::Success(0))
}
