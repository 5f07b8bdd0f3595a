//! The part of the thread system the virtual-memory core sees: user processes
//! and a way to find them by pid.

pub mod process;
pub mod process_table;

pub use process::{Pid, UserProcess};
pub use process_table::ProcessTable;

use alloc::sync::Arc;

/// Resolves a pid to its process. Frames record only the pid of their owner,
/// so eviction goes through this to reach the owner's page directory and
/// supplemental page table. A process that has exited resolves to `None`.
pub trait ProcessRegistry: Send + Sync {
    fn resolve(&self, pid: Pid) -> Option<Arc<UserProcess>>;
}
