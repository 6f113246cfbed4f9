//! Guest thread registry.
//!
//! Holds every guest thread the supervisor has observed, plus the arenas
//! backing `ThreadGroup` and `Namespace`. Always accessed from inside the
//! supervisor's single coordination mutex — nothing here takes its own lock.

use crate::arena::Arena;
use crate::error::{ErrorKind, Result};
use crate::namespace::{AbsTid, Namespace, NamespaceId, NsTid};
use crate::thread::{Thread, ThreadId};
use crate::thread_group::{ThreadGroup, ThreadGroupId};
use std::collections::BTreeMap;

bitflags::bitflags! {
    pub struct CloneFlags: u64 {
        const CLONE_NEWPID = 0x2000_0000;
        const CLONE_THREAD = 0x0001_0000;
    }
}

pub struct Registry {
    threads: Arena<Thread>,
    groups: Arena<ThreadGroup>,
    namespaces: Arena<Namespace>,
    by_tid: BTreeMap<AbsTid, ThreadId>,
    root_namespace: NamespaceId,
}

impl Registry {
    /// `root_tid` is the sandbox's initial guest thread; it seeds the
    /// root namespace (depth 1) and becomes NsTid 1 inside it.
    pub fn new(root_tid: AbsTid, root_cwd: String) -> Registry {
        let mut namespaces = Arena::new();
        let root_namespace = namespaces.insert(Namespace::root());
        let mut groups = Arena::new();
        let root_group = groups.insert(ThreadGroup::new(root_tid, None));
        let mut threads = Arena::new();
        let root_thread = threads.insert(Thread::new(root_tid, root_group, root_namespace, root_cwd));
        groups.get_mut(root_group).unwrap().add_member(root_thread);
        namespaces.get_mut(root_namespace).unwrap().assign(root_tid);
        let mut by_tid = BTreeMap::new();
        by_tid.insert(root_tid, root_thread);
        Registry {
            threads,
            groups,
            namespaces,
            by_tid,
            root_namespace,
        }
    }

    /// `get(abs_tid) → Thread`. If the kernel knows `abs_tid` as a live
    /// descendant but the registry doesn't yet, that's a caller bug for
    /// every handler except the ones that explicitly lazily register via
    /// `register_child`/`sync_new_threads` first — `get` itself never
    /// probes the kernel, keeping it a cheap lookup inside the CTS.
    pub fn get(&self, tid: AbsTid) -> Result<ThreadId> {
        self.by_tid.get(&tid).copied().ok_or(ErrorKind::Srch)
    }

    pub fn thread(&self, id: ThreadId) -> Result<&Thread> {
        self.threads.get(id).ok_or(ErrorKind::Srch)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Result<&mut Thread> {
        self.threads.get_mut(id).ok_or(ErrorKind::Srch)
    }

    pub fn group(&self, id: ThreadGroupId) -> Result<&ThreadGroup> {
        self.groups.get(id).ok_or(ErrorKind::Srch)
    }

    pub fn namespace(&self, id: NamespaceId) -> Result<&Namespace> {
        self.namespaces.get(id).ok_or(ErrorKind::Srch)
    }

    pub fn namespace_mut(&mut self, id: NamespaceId) -> Result<&mut Namespace> {
        self.namespaces.get_mut(id).ok_or(ErrorKind::Srch)
    }

    pub fn root_namespace(&self) -> NamespaceId {
        self.root_namespace
    }

    /// Count of live guest threads, clamped to `u16` for `sysinfo`'s
    /// `procs` field.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Resolves a tid the way `caller` would see it, walking `caller`'s
    /// own namespace mapping.
    pub fn get_namespaced(&self, caller: ThreadId, ns_tid: NsTid) -> Result<ThreadId> {
        let caller_thread = self.thread(caller)?;
        let ns = self.namespace(caller_thread.namespace)?;
        let abs = ns.get_abs_tid(ns_tid).ok_or(ErrorKind::Srch)?;
        self.get(abs)
    }

    /// Registers a thread that isn't a `clone`/`fork` child of anything
    /// already known — i.e. the sandbox's own root, or a thread
    /// discovered by `sync_new_threads` whose immediate kernel parent is
    /// itself unknown. Shares the given namespace and group.
    fn register_raw(&mut self, tid: AbsTid, group: ThreadGroupId, namespace: NamespaceId, cwd: String) -> ThreadId {
        let thread = self.threads.insert(Thread::new(tid, group, namespace, cwd));
        if let Some(g) = self.groups.get_mut(group) {
            g.add_member(thread);
        }
        if let Some(ns) = self.namespaces.get_mut(namespace) {
            ns.assign(tid);
        }
        self.by_tid.insert(tid, thread);
        thread
    }

    /// Registers a `clone`/`fork` child. `CLONE_THREAD` keeps the child in
    /// the parent's thread group; otherwise a new group is created with
    /// `child_abs_tid` as its own tgid (the tgid of a group is always the
    /// tid of its leader thread).
    pub fn register_child(&mut self, parent: ThreadId, child_abs_tid: AbsTid, clone_flags: CloneFlags) -> Result<ThreadId> {
        let parent_thread_group = self.thread(parent)?.group;
        let parent_namespace = self.thread(parent)?.namespace;
        let parent_cwd = self.thread(parent)?.fs.cwd.clone();

        let group = if clone_flags.contains(CloneFlags::CLONE_THREAD) {
            parent_thread_group
        } else {
            self.groups.insert(ThreadGroup::new(child_abs_tid, Some(parent_thread_group)))
        };

        let namespace = if clone_flags.contains(CloneFlags::CLONE_NEWPID) {
            let parent_depth = self.namespace(parent_namespace)?.depth;
            self.namespaces.insert(Namespace::child_of(parent_namespace, parent_depth))
        } else {
            parent_namespace
        };

        Ok(self.register_raw(child_abs_tid, group, namespace, parent_cwd))
    }

    /// Walks `/proc` for tids whose `Tgid`/`Ppid` chain traces back to an
    /// already-registered thread, registering any not yet known. Used
    /// before synthesizing `/proc` responses on the proc backend.
    pub fn sync_new_threads(&mut self) -> Result<()> {
        let statuses = read_all_proc_status();
        let mut pending = statuses;
        // Fixed-point: a child may be discovered before its parent in
        // directory-enumeration order.
        let mut progressed = true;
        while progressed && !pending.is_empty() {
            progressed = false;
            pending.retain(|st| {
                if self.by_tid.contains_key(&AbsTid(st.tid)) {
                    return false;
                }
                let parent = AbsTid(st.ppid);
                if let Some(&parent_thread) = self.by_tid.get(&parent) {
                    let flags = if st.tid == st.tgid {
                        CloneFlags::empty()
                    } else {
                        CloneFlags::CLONE_THREAD
                    };
                    if self.register_child(parent_thread, AbsTid(st.tid), flags).is_ok() {
                        progressed = true;
                        return false;
                    }
                }
                true
            });
        }
        Ok(())
    }

    /// Tears down a thread's registry state on exit, and if it was its
    /// namespace's init thread, the whole namespace.
    pub fn handle_thread_exit(&mut self, tid: AbsTid) -> Result<()> {
        let thread_id = self.get(tid)?;
        let (group, namespace) = {
            let t = self.thread(thread_id)?;
            (t.group, t.namespace)
        };
        let was_namespace_root = self
            .namespace(namespace)?
            .get_ns_tid(tid)
            .map(|ns_tid| ns_tid == NsTid(1))
            .unwrap_or(false);

        self.by_tid.remove(&tid);
        self.threads.remove(thread_id);
        if let Some(ns) = self.namespaces.get_mut(namespace) {
            ns.remove(tid);
        }
        if let Some(g) = self.groups.get_mut(group) {
            g.remove_member(thread_id);
            if g.is_empty() {
                self.groups.remove(group);
            }
        }

        if was_namespace_root {
            self.cleanup_namespace(namespace);
        }
        Ok(())
    }

    /// SIGKILLs every remaining thread in the namespace; the resulting
    /// `exit` notifications finish cleanup through this same function for
    /// each thread.
    fn cleanup_namespace(&mut self, namespace: NamespaceId) {
        let remaining: Vec<AbsTid> = match self.namespace(namespace) {
            Ok(ns) => ns.member_tids().collect(),
            Err(_) => return,
        };
        for tid in remaining {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(tid.0),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        if self.namespace(namespace).map(|ns| ns.is_empty()).unwrap_or(true) {
            self.namespaces.remove(namespace);
        }
    }
}

struct ProcStatus {
    tid: i32,
    tgid: i32,
    ppid: i32,
}

fn read_all_proc_status() -> Vec<ProcStatus> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir("/proc") {
        Ok(e) => e,
        Err(_) => return out,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        let tid: i32 = match name.parse() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if let Some(status) = parse_proc_status(tid) {
            out.push(status);
        }
    }
    out
}

fn parse_proc_status(tid: i32) -> Option<ProcStatus> {
    let data = std::fs::read_to_string(format!("/proc/{}/status", tid)).ok()?;
    let mut tgid = None;
    let mut ppid = None;
    for line in data.lines() {
        if let Some(rest) = line.strip_prefix("Tgid:") {
            tgid = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("PPid:") {
            ppid = rest.trim().parse().ok();
        }
    }
    Some(ProcStatus {
        tid,
        tgid: tgid?,
        ppid: ppid?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_registry_seeds_root_thread_at_ns_tid_one() {
        let registry = Registry::new(AbsTid(100), "/".to_string());
        let thread_id = registry.get(AbsTid(100)).unwrap();
        let thread = registry.thread(thread_id).unwrap();
        let ns = registry.namespace(thread.namespace).unwrap();
        assert_eq!(ns.get_ns_tid(AbsTid(100)), Some(NsTid(1)));
    }

    #[test]
    fn register_child_shares_namespace_without_newpid() {
        let mut registry = Registry::new(AbsTid(100), "/".to_string());
        let parent = registry.get(AbsTid(100)).unwrap();
        let child = registry
            .register_child(parent, AbsTid(200), CloneFlags::empty())
            .unwrap();
        let parent_ns = registry.thread(parent).unwrap().namespace;
        let child_ns = registry.thread(child).unwrap().namespace;
        assert_eq!(parent_ns, child_ns);
    }

    #[test]
    fn register_child_with_newpid_creates_child_namespace_at_ns_tid_one() {
        let mut registry = Registry::new(AbsTid(100), "/".to_string());
        let parent = registry.get(AbsTid(100)).unwrap();
        let child = registry
            .register_child(parent, AbsTid(200), CloneFlags::CLONE_NEWPID)
            .unwrap();
        let child_thread = registry.thread(child).unwrap();
        let ns = registry.namespace(child_thread.namespace).unwrap();
        assert_eq!(ns.depth, 2);
        assert_eq!(ns.get_ns_tid(AbsTid(200)), Some(NsTid(1)));
    }

    #[test]
    fn handle_thread_exit_removes_from_registry() {
        let mut registry = Registry::new(AbsTid(100), "/".to_string());
        let parent = registry.get(AbsTid(100)).unwrap();
        registry
            .register_child(parent, AbsTid(200), CloneFlags::empty())
            .unwrap();
        registry.handle_thread_exit(AbsTid(200)).unwrap();
        assert_eq!(registry.get(AbsTid(200)), Err(ErrorKind::Srch));
    }
}
