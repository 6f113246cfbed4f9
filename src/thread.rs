//! Guest thread state: identity, fd table, and filesystem context.

use crate::arena::Id;
use crate::fdtable::FdTable;
use crate::namespace::{AbsTid, NamespaceId};
use crate::thread_group::ThreadGroupId;

pub type ThreadId = Id<Thread>;

/// {cwd as an absolute normalized path}, mutated only by `chdir`/`fchdir`.
pub struct FsInfo {
    pub cwd: String,
}

impl FsInfo {
    pub fn new(cwd: String) -> FsInfo {
        FsInfo { cwd }
    }
}

/// {absolute tid, pointer to its thread-group, pointer to its namespace,
/// fd table, fs info}. Invariant: `thread.tid == key used to look it up
/// in the registry`.
pub struct Thread {
    pub tid: AbsTid,
    pub group: ThreadGroupId,
    pub namespace: NamespaceId,
    pub fds: FdTable,
    pub fs: FsInfo,
}

impl Thread {
    pub fn new(tid: AbsTid, group: ThreadGroupId, namespace: NamespaceId, cwd: String) -> Thread {
        Thread {
            tid,
            group,
            namespace,
            fds: FdTable::new(),
            fs: FsInfo::new(cwd),
        }
    }
}
