//! Process adjustment interface (priority, affinity, working set, exit waits)

use crate::error::ProcessResult;
use crate::rule::strategy::Priority;
use async_trait::async_trait;
use std::time::Duration;

pub mod linux;

pub use linux::LinuxProcessControl;

/// Result of a bounded wait on a process handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitWait {
    Exited,
    TimedOut,
}

#[async_trait]
pub trait ProcessControl: Send + Sync {
    fn priority(&self, pid: u32) -> ProcessResult<Priority>;
    fn set_priority(&self, pid: u32, priority: Priority) -> ProcessResult<()>;

    fn affinity(&self, pid: u32) -> ProcessResult<u64>;
    fn set_affinity(&self, pid: u32, mask: u64) -> ProcessResult<()>;

    /// Ask the OS to page out the process's private memory.
    /// Returns the number of bytes advised.
    fn trim_working_set(&self, pid: u32) -> ProcessResult<u64>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Mask covering every core the host exposes.
    fn all_cores(&self) -> u64;

    /// Wait at most `timeout` for `pid` to exit.
    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> ExitWait;
}
