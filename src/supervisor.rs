//! The supervisor: owns the coordination mutex, the log buffers, and
//! process-wide timing state.
//!
//! A real multi-threaded process services several notifications
//! concurrently, one worker per inflight kernel slot. Every access to
//! the thread registry, any thread's fd table, any file's mutable
//! fields except refcount, tombstones, or overlay existence
//! predicates/mutators must happen inside `SupervisorState`'s mutex.
//! File reference counting and backend I/O on an already-cloned `Arc<File>`
//! are deliberately lock-free — see `backend::File`'s `Arc`-based
//! refcounting.

use crate::config::Config;
use crate::logbuf::LogBuffer;
use crate::namespace::AbsTid;
use crate::overlay::tombstones::Tombstones;
use crate::overlay::Overlay;
use crate::registry::Registry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Everything that must only ever be touched from inside the
/// supervisor's one coordination mutex.
pub struct SupervisorState {
    pub registry: Registry,
    pub tombstones: Tombstones,
    pub overlay: Overlay,
}

pub struct Supervisor {
    pub config: Config,
    state: Mutex<SupervisorState>,
    pub stdout_log: LogBuffer,
    pub stderr_log: LogBuffer,
    start: Instant,
    start_wall: SystemTime,
    /// Generated namespace uid distinguishing this sandbox run's overlay
    /// directory from any other concurrently running one.
    pub namespace_uid: u64,
}

static NEXT_NAMESPACE_UID: AtomicU64 = AtomicU64::new(1);

impl Supervisor {
    pub fn new(config: Config, root_tid: AbsTid, root_cwd: String) -> Supervisor {
        let registry = Registry::new(root_tid, root_cwd);
        let overlay = Overlay::new(config.cow_root(), config.tmp_root());
        let state = SupervisorState {
            registry,
            tombstones: Tombstones::new(),
            overlay,
        };
        Supervisor {
            config,
            state: Mutex::new(state),
            stdout_log: LogBuffer::new(),
            stderr_log: LogBuffer::new(),
            start: Instant::now(),
            start_wall: SystemTime::now(),
            namespace_uid: NEXT_NAMESPACE_UID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Acquires the single coordination mutex. Callers must keep the
    /// critical section short and
    /// must not perform blocking I/O while holding the guard — copy out
    /// what's needed (an `Arc<File>` via `get_ref`, a `cwd` string) and
    /// drop the guard before doing real work.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `uptime = now - supervisor start (seconds)`, for `sysinfo`.
    pub fn uptime_secs(&self) -> i64 {
        self.start.elapsed().as_secs() as i64
    }

    /// Wall-clock start time, in case a handler needs it for logging
    /// rather than `sysinfo`'s monotonic uptime.
    pub fn start_wall_unix(&self) -> u64 {
        self.start_wall
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_supervisor_registers_root_thread() {
        let sup = Supervisor::new(Config::default(), AbsTid(1234), "/".to_string());
        let state = sup.lock();
        assert!(state.registry.get(AbsTid(1234)).is_ok());
    }

    #[test]
    fn uptime_is_nonnegative_immediately_after_construction() {
        let sup = Supervisor::new(Config::default(), AbsTid(1), "/".to_string());
        assert!(sup.uptime_secs() >= 0);
    }
}
