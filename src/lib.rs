//! sandkeeper: syscall dispatch and virtualization core for a seccomp-notify
//! sandbox supervisor.
//!
//! Given a stream of kernel-mediated notifications describing syscalls a
//! guest thread is about to execute, this crate emulates, rewrites, or
//! errors each one, presenting a filesystem and process/thread namespace
//! that differs from the host's. The launcher that spawns the guest,
//! installs the seccomp filter, and reads/writes the kernel's notification
//! fd is an external collaborator — this crate's only seam to it is
//! [`notify::Notification::from_raw`] in and [`dispatch::dispatch`] out.

pub mod arena;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fdtable;
pub mod handlers;
pub mod log;
pub mod logbuf;
pub mod memory;
pub mod namespace;
pub mod notify;
pub mod overlay;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod thread;
pub mod thread_group;

pub use config::Config;
pub use dispatch::dispatch;
pub use namespace::AbsTid;
pub use notify::{build_reply, Notification, RawReply, Response};
pub use supervisor::Supervisor;
