use crate::record::HandlingState;
use crate::rule::ModificationInfo;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub seen: usize,
    pub triaged: usize,
    pub skipped: usize,
    pub evicted: usize,
    pub modified: usize,
    /// Bytes advised for paging out; only set by memory-freeing scans.
    pub trimmed_bytes: u64,
    pub duration_ms: u64,
}

/// Outward notifications. Listeners subscribe through the manager and detach
/// by dropping their receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ManagerEvent {
    StateChanged {
        pid: u32,
        name: String,
        state: HandlingState,
    },
    Modified {
        info: ModificationInfo,
    },
    FreeWill {
        pid: u32,
        name: String,
        rule: String,
    },
    Exited {
        pid: u32,
        name: String,
    },
    ScanCompleted {
        summary: ScanSummary,
    },
    PushFeedFailed {
        reason: String,
    },
}
