//! Process discovery: full enumeration (pull) and new-process events (push)

use crate::error::ProcessResult;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod linux;
pub mod netlink;

pub use linux::LinuxProcessCollector;
pub use netlink::NetlinkProcessFeed;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    /// Seconds since the Unix epoch.
    pub start_time: u64,
}

pub trait ProcessCollector: Send + Sync {
    /// Enumerate every live process.
    fn list_processes(&self) -> ProcessResult<Vec<ProcessInfo>>;
    fn get_process(&self, pid: u32) -> Option<ProcessInfo>;
    /// Full path of the executable image.
    fn resolve_path(&self, pid: u32) -> ProcessResult<PathBuf>;
}

/// A process reported by the push feed. Only the pid is guaranteed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProcessEvent {
    pub pid: u32,
    pub name: Option<String>,
    pub path: Option<PathBuf>,
    pub start_time: Option<u64>,
}

impl NewProcessEvent {
    pub fn pid_only(pid: u32) -> Self {
        Self {
            pid,
            name: None,
            path: None,
            start_time: None,
        }
    }
}

pub trait ProcessEventFeed: Send + Sync {
    /// Subscribe and start delivering events into `tx` until `cancel` fires.
    ///
    /// An error means the subscription could not be established. A feed that
    /// breaks later drops `tx`, which the receiver observes as a closed channel.
    fn start(
        &self,
        tx: mpsc::UnboundedSender<NewProcessEvent>,
        cancel: CancellationToken,
    ) -> std::io::Result<()>;
}
