//! Path-routed handlers: `openat`, `chdir`/`fchdir`, `getcwd`, the `*at`
//! directory-mutation family, and `execve`'s path rewrite trick.

use super::{read_path, require_thread, route, AT_FDCWD};
use crate::backend::{BackendKind, CowFile, File, OpenFlags, PassthroughFile, ProcFile, TmpFile};
use crate::error::{ErrorKind, Result};
use crate::memory::{self, GuestAddr};
use crate::namespace::AbsTid;
use crate::notify::{Notification, Response};
use crate::overlay::{tombstones::Tombstones, Overlay, Shadow};
use crate::router::Backend;
use crate::supervisor::{Supervisor, SupervisorState};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

/// `fcntl(F_SETFL, ...)`-mutable bits only; `openat`'s incoming flags carry
/// everything, but `OpenFlags` as stored on a `File` keeps the whole set.
fn open_flags_from_raw(raw: i32) -> OpenFlags {
    OpenFlags::from_bits_truncate(raw)
}

/// Strips `O_CREAT`/`O_EXCL` before handing flags to a real `open(2)`
/// against a path we already know exists (or just created) — the kernel
/// would otherwise reject `O_CREAT|O_EXCL` on an existing path.
fn oflag_for_existing(flags: OpenFlags) -> nix::fcntl::OFlag {
    let bits = flags.bits() & !(libc::O_CREAT | libc::O_EXCL);
    nix::fcntl::OFlag::from_bits_truncate(bits)
}

fn nix_mode(mode: u32) -> nix::sys::stat::Mode {
    nix::sys::stat::Mode::from_bits_truncate(mode as nix::libc::mode_t)
}

pub fn openat(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let dirfd = notif.arg(0) as i32;
    let path_addr = GuestAddr(notif.arg(1));
    let flags_raw = notif.arg(2) as i32;
    let mode = notif.arg(3) as u32;

    let user_path = read_path(tid, path_addr)?;
    let (backend, normalized) = route(sup, tid, dirfd, &user_path)?;
    let flags = open_flags_from_raw(flags_raw);

    let backend_kind = match backend {
        Backend::Proc => {
            sup.lock().registry.sync_new_threads()?;
            build_proc_backend(sup, tid, &normalized)?
        }
        Backend::Tmp => open_shadow(sup, Shadow::Tmp, &normalized, flags, mode)?,
        Backend::Cow => open_cow(sup, &normalized, flags, mode)?,
        Backend::Passthrough => open_passthrough(&normalized, flags, mode)?,
    };

    let file = Arc::new(File::new(backend_kind, flags, Some(normalized)));
    install_new_fd(sup, tid, file, flags)
}

fn install_new_fd(sup: &Supervisor, tid: AbsTid, file: Arc<File>, flags: OpenFlags) -> Result<Response> {
    let mut state = sup.lock();
    let thread_id = state.registry.get(tid)?;
    let thread = state.registry.thread_mut(thread_id)?;
    let fd = thread.fds.insert(file, flags.contains(OpenFlags::CLOEXEC), crate::fdtable::FIRST_AUTO_FD);
    Ok(Response::Success(fd as u64))
}

fn open_passthrough(normalized: &str, flags: OpenFlags, mode: u32) -> Result<BackendKind> {
    let oflag = nix::fcntl::OFlag::from_bits_truncate(flags.bits());
    let fd = nix::fcntl::open(normalized, oflag, nix_mode(mode)).map_err(ErrorKind::from)?;
    Ok(BackendKind::Passthrough(PassthroughFile::new(fd)))
}

/// Shared `tmp`/part-of-`cow` "open an existing or freshly created shadow
/// file" logic used directly for `tmp` and as the fallback tail of `cow`
/// once a shadow copy is known to exist.
fn open_shadow(sup: &Supervisor, shadow: Shadow, normalized: &str, flags: OpenFlags, mode: u32) -> Result<BackendKind> {
    let creat = flags.contains(OpenFlags::CREAT);
    let excl = flags.contains(OpenFlags::EXCL);
    let host_path = {
        let mut state = sup.lock();
        let SupervisorState { overlay, tombstones, .. } = &mut *state;
        let exists = overlay.path_exists(tombstones, shadow, normalized);
        if exists {
            if creat && excl {
                return Err(ErrorKind::Exist);
            }
            match shadow {
                Shadow::Tmp => overlay.resolve_tmp(normalized),
                Shadow::Cow => overlay.resolve_cow(normalized)?,
            }
        } else {
            if !creat {
                return Err(ErrorKind::NoEnt);
            }
            overlay.create_file(tombstones, shadow, normalized, mode)?
        }
    };
    let fd = nix::fcntl::open(&host_path, oflag_for_existing(flags), nix::sys::stat::Mode::empty())
        .map_err(ErrorKind::from)?;
    if flags.contains(OpenFlags::TRUNC) {
        nix::unistd::ftruncate(fd, 0).map_err(ErrorKind::from)?;
    }
    match shadow {
        Shadow::Tmp => Ok(BackendKind::Tmp(TmpFile::new(normalized.to_string(), fd))),
        Shadow::Cow => Ok(BackendKind::Cow(CowFile::new(normalized.to_string(), fd, true))),
    }
}

/// `cow` open: reads through the real host file until the first write
/// triggers copy-up. If no cow copy and no real file exist,
/// `O_CREAT` creates a fresh file directly in the cow shadow (already
/// "copied up", since there was never a real one to fall back to).
fn open_cow(sup: &Supervisor, normalized: &str, flags: OpenFlags, mode: u32) -> Result<BackendKind> {
    let creat = flags.contains(OpenFlags::CREAT);
    let excl = flags.contains(OpenFlags::EXCL);

    let already_copied_up = {
        let state = sup.lock();
        state.overlay.cow_exists(normalized)
    };
    if already_copied_up {
        return open_shadow(sup, Shadow::Cow, normalized, flags, mode);
    }

    let real_exists = {
        let state = sup.lock();
        !state.tombstones.is_tombstoned(normalized)
            && !state.tombstones.is_ancestor_tombstoned(normalized)
            && state.overlay.real_fs_exists(normalized)
    };
    if real_exists {
        if creat && excl {
            return Err(ErrorKind::Exist);
        }
        let oflag = oflag_for_existing(flags);
        let fd = nix::fcntl::open(normalized, oflag, nix::sys::stat::Mode::empty()).map_err(ErrorKind::from)?;
        if flags.contains(OpenFlags::TRUNC) {
            // Writing to a read-through fd against the real file would
            // leak outside the sandbox; force a copy-up first instead.
            drop(nix::unistd::close(fd));
            return open_shadow(sup, Shadow::Cow, normalized, flags | OpenFlags::CREAT, mode);
        }
        return Ok(BackendKind::Cow(CowFile::new(normalized.to_string(), fd, false)));
    }

    if !creat {
        return Err(ErrorKind::NoEnt);
    }
    open_shadow(sup, Shadow::Cow, normalized, flags | OpenFlags::CREAT, mode)
}

fn build_proc_backend(sup: &Supervisor, tid: AbsTid, normalized: &str) -> Result<BackendKind> {
    crate::handlers::process::build_proc_backend(sup, tid, normalized)
}

pub fn close(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    if super::is_stdio(fd) {
        return Ok(Response::Continue);
    }
    let thread_id = require_thread(sup, tid)?;
    let mut state = sup.lock();
    let thread = state.registry.thread_mut(thread_id)?;
    thread.fds.remove(fd)?;
    Ok(Response::Success(0))
}

pub fn chdir(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let path_addr = GuestAddr(notif.arg(0));
    let user_path = read_path(tid, path_addr)?;
    if user_path.is_empty() {
        return Err(ErrorKind::NoEnt);
    }
    let (backend, normalized) = route(sup, tid, AT_FDCWD, &user_path)?;
    ensure_is_dir(sup, backend, &normalized)?;
    set_cwd(sup, tid, normalized)
}

pub fn fchdir(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let fd = notif.arg(0) as i32;
    let path = {
        let thread_id = require_thread(sup, tid)?;
        let state = sup.lock();
        let thread = state.registry.thread(thread_id)?;
        let entry = thread.fds.get(fd)?;
        entry.file.opened_path.clone().ok_or(ErrorKind::NotDir)?
    };
    set_cwd(sup, tid, path)
}

fn ensure_is_dir(sup: &Supervisor, backend: Backend, normalized: &str) -> Result<()> {
    let state = sup.lock();
    let is_dir = match backend {
        Backend::Proc => true,
        Backend::Passthrough => std::fs::metadata(normalized).map(|m| m.is_dir()).unwrap_or(false),
        Backend::Cow | Backend::Tmp => {
            let shadow = if backend == Backend::Cow { Shadow::Cow } else { Shadow::Tmp };
            let _ = shadow;
            state.overlay.is_guest_dir(&state.tombstones, normalized)
        }
    };
    if is_dir {
        Ok(())
    } else {
        Err(ErrorKind::NotDir)
    }
}

fn set_cwd(sup: &Supervisor, tid: AbsTid, path: String) -> Result<Response> {
    let mut state = sup.lock();
    let thread_id = state.registry.get(tid)?;
    state.registry.thread_mut(thread_id)?.fs.cwd = path;
    Ok(Response::Success(0))
}

pub fn getcwd(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let buf_addr = GuestAddr(notif.arg(0));
    let size = notif.arg(1) as usize;
    let cwd = {
        let thread_id = require_thread(sup, tid)?;
        let state = sup.lock();
        state.registry.thread(thread_id)?.fs.cwd.clone()
    };
    let needed = cwd.len() + 1;
    if size < needed {
        return Err(ErrorKind::Range);
    }
    let mut bytes = cwd.into_bytes();
    bytes.push(0);
    memory::write_slice(&bytes, tid.0, buf_addr)?;
    Ok(Response::Success(needed as u64))
}

pub fn mkdirat(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let dirfd = notif.arg(0) as i32;
    let path_addr = GuestAddr(notif.arg(1));
    let mode = notif.arg(2) as u32;
    let user_path = read_path(tid, path_addr)?;
    let (backend, normalized) = route(sup, tid, dirfd, &user_path)?;
    let shadow = shadow_for_write(backend)?;
    let mut state = sup.lock();
    let SupervisorState { overlay, tombstones, .. } = &mut *state;
    overlay.mkdir(tombstones, shadow, &normalized, mode)?;
    Ok(Response::Success(0))
}

const AT_REMOVEDIR: i32 = libc::AT_REMOVEDIR;

pub fn unlinkat(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let dirfd = notif.arg(0) as i32;
    let path_addr = GuestAddr(notif.arg(1));
    let flags = notif.arg(2) as i32;
    let user_path = read_path(tid, path_addr)?;
    let (backend, normalized) = route(sup, tid, dirfd, &user_path)?;
    let shadow = shadow_for_write(backend)?;

    let mut state = sup.lock();
    let SupervisorState { overlay, tombstones, .. } = &mut *state;
    if flags & AT_REMOVEDIR != 0 {
        overlay.rmdir(tombstones, shadow, &normalized)?;
    } else {
        if overlay.is_guest_dir(tombstones, &normalized) {
            return Err(ErrorKind::IsDir);
        }
        if !overlay.path_exists(tombstones, shadow, &normalized) {
            return Err(ErrorKind::NoEnt);
        }
        overlay.unlink(tombstones, &normalized)?;
    }
    Ok(Response::Success(0))
}

pub fn symlinkat(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let target_addr = GuestAddr(notif.arg(0));
    let dirfd = notif.arg(1) as i32;
    let link_addr = GuestAddr(notif.arg(2));
    let target = read_path(tid, target_addr)?;
    let link_user_path = read_path(tid, link_addr)?;
    let (backend, normalized) = route(sup, tid, dirfd, &link_user_path)?;
    let shadow = shadow_for_write(backend)?;
    let mut state = sup.lock();
    let SupervisorState { overlay, tombstones, .. } = &mut *state;
    overlay.symlink(tombstones, shadow, &target, &normalized)?;
    Ok(Response::Success(0))
}

pub fn readlinkat(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let dirfd = notif.arg(0) as i32;
    let path_addr = GuestAddr(notif.arg(1));
    let buf_addr = GuestAddr(notif.arg(2));
    let bufsiz = notif.arg(3) as usize;
    let user_path = read_path(tid, path_addr)?;

    if user_path == "/proc/self/exe" || user_path.ends_with("/proc/self/exe") {
        // The exe symlink has no backing target to resolve to; reject
        // rather than synthesize a fake one.
        return Err(ErrorKind::Inval);
    }

    let (backend, normalized) = route(sup, tid, dirfd, &user_path)?;
    let shadow = shadow_for_write(backend)?;
    let target = sup.lock().overlay.readlink(shadow, &normalized)?;
    let truncated: Vec<u8> = target.into_bytes().into_iter().take(bufsiz).collect();
    let len = truncated.len();
    memory::write_slice(&truncated, tid.0, buf_addr)?;
    Ok(Response::Success(len as u64))
}

const AT_EMPTY_PATH: i32 = libc::AT_EMPTY_PATH;
const AT_SYMLINK_NOFOLLOW: i32 = libc::AT_SYMLINK_NOFOLLOW;

pub fn fchmodat(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let dirfd = notif.arg(0) as i32;
    let path_addr = GuestAddr(notif.arg(1));
    let mode = notif.arg(2) as u32;
    let flags = notif.arg(3) as i32;
    if flags & AT_SYMLINK_NOFOLLOW != 0 {
        return Err(ErrorKind::OpNotSupp);
    }
    let normalized = if flags & AT_EMPTY_PATH != 0 {
        let state = sup.lock();
        let thread_id = state.registry.get(tid)?;
        let thread = state.registry.thread(thread_id)?;
        thread.fds.get(dirfd)?.file.opened_path.clone().ok_or(ErrorKind::BadF)?
    } else {
        let user_path = read_path(tid, path_addr)?;
        let (backend, normalized) = route(sup, tid, dirfd, &user_path)?;
        shadow_for_write(backend)?;
        normalized
    };
    let (backend2, _) = route(sup, tid, AT_FDCWD, &normalized)?;
    let shadow = shadow_for_write(backend2)?;
    sup.lock().overlay.fchmodat(shadow, &normalized, mode)?;
    Ok(Response::Success(0))
}

pub fn utimensat(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let dirfd = notif.arg(0) as i32;
    let path_addr = GuestAddr(notif.arg(1));
    let flags = notif.arg(3) as i32;
    let normalized = if flags & AT_EMPTY_PATH != 0 || path_addr.0 == 0 {
        let state = sup.lock();
        let thread_id = state.registry.get(tid)?;
        let thread = state.registry.thread(thread_id)?;
        thread.fds.get(dirfd)?.file.opened_path.clone().ok_or(ErrorKind::BadF)?
    } else {
        let user_path = read_path(tid, path_addr)?;
        route(sup, tid, dirfd, &user_path)?.1
    };
    let (backend, _) = route(sup, tid, AT_FDCWD, &normalized)?;
    let shadow = shadow_for_write(backend)?;
    let now = std::time::SystemTime::now();
    sup.lock().overlay.utimensat(shadow, &normalized, now, now)?;
    Ok(Response::Success(0))
}

pub fn faccessat(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let dirfd = notif.arg(0) as i32;
    let path_addr = GuestAddr(notif.arg(1));
    let user_path = read_path(tid, path_addr)?;
    let (backend, normalized) = route(sup, tid, dirfd, &user_path)?;
    let state = sup.lock();
    let exists = match backend {
        Backend::Proc => true,
        Backend::Passthrough => std::path::Path::new(&normalized).exists(),
        Backend::Cow => state.overlay.guest_path_exists(&state.tombstones, &normalized),
        Backend::Tmp => state.overlay.path_exists(&state.tombstones, Shadow::Tmp, &normalized),
    };
    if exists {
        Ok(Response::Success(0))
    } else {
        Err(ErrorKind::NoEnt)
    }
}

/// Writes to `passthrough`/`proc` roots are always rejected with `PERM`.
fn shadow_for_write(backend: Backend) -> Result<Shadow> {
    match backend {
        Backend::Cow => Ok(Shadow::Cow),
        Backend::Tmp => Ok(Shadow::Tmp),
        Backend::Passthrough | Backend::Proc => Err(ErrorKind::Perm),
    }
}

/// `execve` path rewrite. `passthrough` execs continue unmodified; `proc`
/// and blocked paths fail; `cow` (with an existing shadow copy) and `tmp`
/// get a short-lived symlink under `Config::exec_symlink_root` whose
/// target is the shadow file, and the guest's path argument is
/// overwritten in-place with that symlink's path.
pub fn execve(sup: &Supervisor, tid: AbsTid, notif: &Notification) -> Result<Response> {
    let path_addr = GuestAddr(notif.arg(0));
    let user_path = read_path(tid, path_addr)?;
    let (backend, normalized) = route(sup, tid, AT_FDCWD, &user_path)?;

    match backend {
        Backend::Proc => Err(ErrorKind::Acces),
        Backend::Passthrough => Ok(Response::Continue),
        Backend::Cow | Backend::Tmp => {
            let shadow = if backend == Backend::Cow { Shadow::Cow } else { Shadow::Tmp };
            let state = sup.lock();
            let has_shadow = match shadow {
                Shadow::Cow => state.overlay.cow_exists(&normalized),
                Shadow::Tmp => state.overlay.tmp_exists(&normalized),
            };
            if !has_shadow {
                return if backend == Backend::Cow {
                    // No shadow copy: fall through to the real binary
                    // unmodified, same as a plain passthrough exec.
                    Ok(Response::Continue)
                } else {
                    Err(ErrorKind::NoEnt)
                };
            }
            let target = match shadow {
                Shadow::Cow => state.overlay.resolve_cow(&normalized)?,
                Shadow::Tmp => state.overlay.resolve_tmp(&normalized),
            };
            drop(state);
            rewrite_exec_path(sup, tid, path_addr, &user_path, &target)
        }
    }
}

fn rewrite_exec_path(
    sup: &Supervisor,
    tid: AbsTid,
    path_addr: GuestAddr,
    original: &str,
    target: &std::path::Path,
) -> Result<Response> {
    let root = &sup.config.exec_symlink_root;
    let budget = sup.config.exec_symlink_name_len;
    let root_str = root.to_string_lossy();
    // The generated name must leave room for `root` plus the joining
    // separator; what's written in-guest is the whole path, not just
    // the basename, so a deep root would blow the budget by itself.
    let name_len = budget.saturating_sub(root_str.len() + 1);
    if name_len == 0 {
        return Err(ErrorKind::Perm);
    }
    std::fs::create_dir_all(root).map_err(|_| ErrorKind::Io)?;
    let short_name = short_symlink_name(sup, name_len);
    let link_path = root.join(&short_name);

    let mut bytes = link_path.to_string_lossy().into_owned().into_bytes();
    if bytes.len() > budget || bytes.len() > original.len() {
        return Err(ErrorKind::Perm);
    }
    let _ = std::fs::remove_file(&link_path);
    std::os::unix::fs::symlink(target, &link_path).map_err(|_| ErrorKind::Io)?;
    bytes.push(0);
    memory::write_slice(&bytes, tid.0, path_addr)?;

    // The kernel dereferences the symlink while resuming the exec; this
    // process can unlink it immediately afterward.
    let _ = std::fs::remove_file(&link_path);
    Ok(Response::Continue)
}

fn short_symlink_name(sup: &Supervisor, len: usize) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed) ^ sup.namespace_uid;
    let alphabet = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut out = String::with_capacity(len);
    let mut v = n;
    for _ in 0..len {
        out.push(alphabet[(v % alphabet.len() as u64) as usize] as char);
        v /= alphabet.len() as u64;
    }
    out
}
