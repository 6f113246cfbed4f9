//! PID namespace.
//!
//! A namespace is its own tid numbering: threads inside it are addressed
//! by `NsTid`, distinct from the `AbsTid` the host kernel knows them by.
//! Kept as a plain struct in a `Registry`-owned `Arena` rather than an
//! `Rc`-linked tree — see `arena`'s module doc.

use crate::arena::Id;
use std::collections::BTreeMap;

/// Absolute kernel thread id — unique process-wide.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub struct AbsTid(pub i32);

/// Thread/thread-group id as seen inside one particular namespace.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub struct NsTid(pub i32);

pub type NsTgid = NsTid;

pub type NamespaceId = Id<Namespace>;

pub struct Namespace {
    pub depth: u32,
    pub parent: Option<NamespaceId>,
    forward: BTreeMap<AbsTid, NsTid>,
    inverse: BTreeMap<NsTid, AbsTid>,
    next_ns_tid: i32,
}

impl Namespace {
    /// The root namespace: depth 1, no parent.
    pub fn root() -> Namespace {
        Namespace {
            depth: 1,
            parent: None,
            forward: BTreeMap::new(),
            inverse: BTreeMap::new(),
            next_ns_tid: 1,
        }
    }

    pub fn child_of(parent: NamespaceId, parent_depth: u32) -> Namespace {
        Namespace {
            depth: parent_depth + 1,
            parent: Some(parent),
            forward: BTreeMap::new(),
            inverse: BTreeMap::new(),
            next_ns_tid: 1,
        }
    }

    /// Assigns the next sequential `NsTid` to `tid` in this namespace. A
    /// `CLONE_NEWPID` child's first registrant always lands on 1 because a
    /// fresh `Namespace` starts `next_ns_tid` at 1.
    pub fn assign(&mut self, tid: AbsTid) -> NsTid {
        let ns_tid = NsTid(self.next_ns_tid);
        self.next_ns_tid += 1;
        self.forward.insert(tid, ns_tid);
        self.inverse.insert(ns_tid, tid);
        ns_tid
    }

    pub fn get_ns_tid(&self, tid: AbsTid) -> Option<NsTid> {
        self.forward.get(&tid).copied()
    }

    pub fn get_abs_tid(&self, ns_tid: NsTid) -> Option<AbsTid> {
        self.inverse.get(&ns_tid).copied()
    }

    pub fn remove(&mut self, tid: AbsTid) {
        if let Some(ns_tid) = self.forward.remove(&tid) {
            self.inverse.remove(&ns_tid);
        }
    }

    pub fn member_tids(&self) -> impl Iterator<Item = AbsTid> + '_ {
        self.forward.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_namespace_starts_at_depth_one() {
        let ns = Namespace::root();
        assert_eq!(ns.depth, 1);
        assert!(ns.parent.is_none());
    }

    #[test]
    fn assign_gives_sequential_ns_tids_starting_at_one() {
        let mut ns = Namespace::root();
        assert_eq!(ns.assign(AbsTid(100)), NsTid(1));
        assert_eq!(ns.assign(AbsTid(200)), NsTid(2));
        assert_eq!(ns.get_ns_tid(AbsTid(100)), Some(NsTid(1)));
        assert_eq!(ns.get_abs_tid(NsTid(2)), Some(AbsTid(200)));
    }

    #[test]
    fn remove_clears_both_directions() {
        let mut ns = Namespace::root();
        ns.assign(AbsTid(100));
        ns.remove(AbsTid(100));
        assert_eq!(ns.get_ns_tid(AbsTid(100)), None);
        assert!(ns.is_empty());
    }
}
