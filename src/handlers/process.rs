//! Process/thread-identity handlers and the `proc` backend's content
//! synthesis: `sysinfo`/`uname`/`getppid`/`gettid`/`kill`/`tkill`/`exit`/
//! `exit_group`.

use super::require_thread;
use crate::backend::{procfs::ProcFile, BackendKind};
use crate::error::{ErrorKind, Result};
use crate::namespace::{AbsTid, NsTid};
use crate::notify::{Notification, Response};
use crate::supervisor::Supervisor;

/// Builds the in-memory content for a path under the `proc` route. Only a
/// small subset is modeled: `/proc`, `/proc/self(/status)?`,
/// `/proc/<nspid>(/status)?`.
pub fn build_proc_backend(sup: &Supervisor, tid: AbsTid, normalized: &str) -> Result<BackendKind> {
    let rest = normalized.strip_prefix("/proc").unwrap_or(normalized);
    let rest = rest.trim_start_matches('/');

    if rest.is_empty() {
        return Ok(BackendKind::Proc(build_pid_listing(sup, tid)?));
    }

    let mut segments = rest.splitn(2, '/');
    let first = segments.next().unwrap_or("");
    let remainder = segments.next().unwrap_or("");

    let target_ns_tid = resolve_proc_segment(sup, tid, first)?;

    match remainder {
        "" => Ok(BackendKind::Proc(ProcFile::new_dir(vec![("status".to_string(), crate::backend::dirstream::DT_REG)]))),
        "status" => Ok(BackendKind::Proc(build_status(sup, tid, target_ns_tid)?)),
        _ => Err(ErrorKind::NoEnt),
    }
}

fn resolve_proc_segment(sup: &Supervisor, tid: AbsTid, segment: &str) -> Result<NsTid> {
    let state = sup.lock();
    let caller = state.registry.get(tid)?;
    if segment == "self" {
        let caller_thread = state.registry.thread(caller)?;
        let ns = state.registry.namespace(caller_thread.namespace)?;
        return ns.get_ns_tid(tid).ok_or(ErrorKind::Srch);
    }
    let ns_tid = NsTid(segment.parse::<i32>().map_err(|_| ErrorKind::NoEnt)?);
    // Validate the tid actually resolves in the caller's namespace.
    let _ = state.registry.get_namespaced(caller, ns_tid)?;
    Ok(ns_tid)
}

/// `/proc` directory listing: every tid visible in the caller's own
/// namespace, frozen from a registry snapshot taken at open time (`proc`
/// files generally fix their content when opened, not on each read).
fn build_pid_listing(sup: &Supervisor, tid: AbsTid) -> Result<ProcFile> {
    let mut state = sup.lock();
    state.registry.sync_new_threads()?;
    let caller = state.registry.get(tid)?;
    let caller_thread = state.registry.thread(caller)?;
    let ns = state.registry.namespace(caller_thread.namespace)?;
    let mut entries: Vec<(String, u8)> = ns
        .member_tids()
        .filter_map(|abs| ns.get_ns_tid(abs))
        .map(|ns_tid| (ns_tid.0.to_string(), crate::backend::dirstream::DT_DIR))
        .collect();
    entries.sort();
    Ok(ProcFile::new_dir(entries))
}

fn build_status(sup: &Supervisor, caller_tid: AbsTid, target: NsTid) -> Result<ProcFile> {
    let state = sup.lock();
    let caller = state.registry.get(caller_tid)?;
    let target_thread_id = state.registry.get_namespaced(caller, target)?;
    let target_thread = state.registry.thread(target_thread_id)?;
    let target_group = state.registry.group(target_thread.group)?;
    let caller_ns = state.registry.thread(caller)?.namespace;
    let ns = state.registry.namespace(caller_ns)?;

    let tgid_ns = ns.get_ns_tid(target_group.tgid).unwrap_or(target);
    let ppid_ns = target_group
        .parent
        .and_then(|p| state.registry.group(p).ok())
        .and_then(|g| ns.get_ns_tid(g.tgid))
        .map(|t| t.0)
        .unwrap_or(0);

    let body = format!(
        "Name:\tguest\nState:\tR (running)\nTgid:\t{}\nPid:\t{}\nPPid:\t{}\n",
        tgid_ns.0, target.0, ppid_ns
    );
    Ok(ProcFile::new_file(body.into_bytes()))
}

pub fn sysinfo(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    require_thread(sup, tid)?;
    let buf_addr = crate::memory::GuestAddr(notif.arg(0));
    let nthreads = sup.lock().registry.thread_count().min(u16::MAX as usize) as u16;
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    info.uptime = sup.uptime_secs() as libc::c_long;
    info.totalram = 1024 * 1024 * 1024;
    info.freeram = 512 * 1024 * 1024;
    info.procs = nthreads;
    info.mem_unit = 1;
    crate::memory::write(tid.0, info, buf_addr)?;
    Ok(Response::Success(0))
}

pub fn uname(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    require_thread(sup, tid)?;
    let buf_addr = crate::memory::GuestAddr(notif.arg(0));
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    fill_cstr(&mut uts.sysname, b"Linux");
    fill_cstr(&mut uts.nodename, b"bvisor");
    fill_cstr(&mut uts.release, b"6.1.0");
    fill_cstr(&mut uts.version, b"#1 SMP");
    fill_cstr(&mut uts.machine, host_machine().as_bytes());
    fill_cstr(&mut uts.domainname, b"(none)");
    crate::memory::write(tid.0, uts, buf_addr)?;
    Ok(Response::Success(0))
}

#[cfg(target_arch = "x86_64")]
fn host_machine() -> &'static str {
    "x86_64"
}
#[cfg(target_arch = "aarch64")]
fn host_machine() -> &'static str {
    "aarch64"
}
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn host_machine() -> &'static str {
    "unknown"
}

fn fill_cstr(field: &mut [libc::c_char], value: &[u8]) {
    let n = value.len().min(field.len() - 1);
    for (i, &b) in value[..n].iter().enumerate() {
        field[i] = b as libc::c_char;
    }
    field[n] = 0;
}

pub fn getppid(sup: &Supervisor, tid: AbsTid, _notif: &Notification) -> Result<Response> {
    let state = sup.lock();
    let caller = state.registry.get(tid)?;
    let caller_thread = state.registry.thread(caller)?;
    let group = state.registry.group(caller_thread.group)?;
    let ns = state.registry.namespace(caller_thread.namespace)?;

    let parent_group = match group.parent {
        Some(p) => p,
        None => return Ok(Response::Success(0)),
    };
    let parent_tgid = match state.registry.group(parent_group) {
        Ok(g) => g.tgid,
        Err(_) => return Ok(Response::Success(0)),
    };
    match ns.get_ns_tid(parent_tgid) {
        Some(ns_tgid) => Ok(Response::Success(ns_tgid.0 as u64)),
        None => Ok(Response::Success(0)),
    }
}

pub fn gettid(sup: &Supervisor, tid: AbsTid, _notif: &Notification) -> Result<Response> {
    let state = sup.lock();
    let caller = state.registry.get(tid)?;
    let caller_thread = state.registry.thread(caller)?;
    let ns = state.registry.namespace(caller_thread.namespace)?;
    let ns_tid = ns.get_ns_tid(tid).ok_or(ErrorKind::Srch)?;
    Ok(Response::Success(ns_tid.0 as u64))
}

fn resolve_target_nstgid(sup: &Supervisor, caller_tid: AbsTid, target_nstgid: i32) -> Result<AbsTid> {
    if target_nstgid <= 0 {
        return Err(ErrorKind::Inval);
    }
    let state = sup.lock();
    let caller = state.registry.get(caller_tid)?;
    state
        .registry
        .get_namespaced(caller, NsTid(target_nstgid))
        .and_then(|tid_idx| Ok(state.registry.thread(tid_idx)?.tid))
}

pub fn kill(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let target = notif.arg(0) as i32;
    let sig = notif.arg(1) as i32;
    let abs_target = resolve_target_nstgid(sup, tid, target)?;
    send_signal(abs_target, sig)
}

pub fn tkill(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let target = notif.arg(0) as i32;
    let sig = notif.arg(1) as i32;
    let abs_target = resolve_target_nstgid(sup, tid, target)?;
    send_signal(abs_target, sig)
}

fn send_signal(target: AbsTid, sig: i32) -> Result<Response> {
    let signal = nix::sys::signal::Signal::try_from(sig).map_err(|_| ErrorKind::Inval)?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(target.0), signal).map_err(ErrorKind::from)?;
    Ok(Response::Success(0))
}

pub fn exit(sup: &Supervisor, tid: AbsTid, _notif: &Notification) -> Result<Response> {
    sup.lock().registry.handle_thread_exit(tid)?;
    Ok(Response::Continue)
}

pub fn exit_group(sup: &Supervisor, tid: AbsTid, _notif: &Notification) -> Result<Response> {
    sup.lock().registry.handle_thread_exit(tid)?;
    Ok(Response::Continue)
}
