//! Per-process bookkeeping shared by discovery, triage and exit handling

use crate::collector::ProcessCollector;
use crate::rule::Rule;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlingState {
    Triage,
    Processing,
    Modified,
    Unmodified,
    /// Matched, but the rule had nothing applicable to do.
    Finished,
    Paused,
    Abandoned,
    AccessDenied,
    Invalid,
    Exited,
}

impl HandlingState {
    pub fn is_in_flight(self) -> bool {
        matches!(self, HandlingState::Triage | HandlingState::Processing)
    }

    /// Matched and handled; the process stays under management.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            HandlingState::Modified
                | HandlingState::Unmodified
                | HandlingState::Finished
                | HandlingState::Paused
        )
    }
}

impl fmt::Display for HandlingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionTier {
    #[default]
    None,
    /// Priority and affinity are never written.
    Protected,
}

pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    /// Seconds since the Unix epoch.
    pub start_time: u64,
    pub discovered: Instant,
    path: OnceLock<Option<PathBuf>>,
    state: Mutex<HandlingState>,
    rule: OnceLock<Weak<Rule>>,
    protection: Mutex<ProtectionTier>,
    restricted: AtomicBool,
    paused: AtomicBool,
    foreground_wait: AtomicBool,
    power_wait: AtomicBool,
    exit_wait: AtomicBool,
    /// Watchlist generation at the time the record was abandoned.
    abandoned_at: AtomicU64,
}

impl ProcessRecord {
    pub fn new(pid: u32, name: impl Into<String>, start_time: u64) -> Self {
        Self {
            pid,
            name: name.into(),
            start_time,
            discovered: Instant::now(),
            path: OnceLock::new(),
            state: Mutex::new(HandlingState::Triage),
            rule: OnceLock::new(),
            protection: Mutex::new(ProtectionTier::None),
            restricted: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            foreground_wait: AtomicBool::new(false),
            power_wait: AtomicBool::new(false),
            exit_wait: AtomicBool::new(false),
            abandoned_at: AtomicU64::new(u64::MAX),
        }
    }

    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        let _ = self.path.set(Some(path.into()));
        self
    }

    /// Same process as `name`? Pids are recycled, names tell them apart.
    pub fn same_identity(&self, name: &str) -> bool {
        self.name == name
    }

    /// Executable path, resolved on first use and cached.
    pub fn path(&self, collector: &dyn ProcessCollector) -> Option<&Path> {
        self.path
            .get_or_init(|| collector.resolve_path(self.pid).ok())
            .as_deref()
    }

    pub fn cached_path(&self) -> Option<&Path> {
        self.path.get().and_then(|p| p.as_deref())
    }

    pub fn state(&self) -> HandlingState {
        *self.state.lock()
    }

    /// Returns false once the record reached `Exited`; nothing leaves that state.
    pub fn set_state(&self, next: HandlingState) -> bool {
        let mut state = self.state.lock();
        if *state == HandlingState::Exited {
            return false;
        }
        *state = next;
        true
    }

    pub fn rule(&self) -> Option<Arc<Rule>> {
        self.rule.get().and_then(Weak::upgrade)
    }

    /// Bind the matched rule. Only the first call has any effect.
    pub fn bind_rule(&self, rule: &Arc<Rule>) -> bool {
        self.rule.set(Arc::downgrade(rule)).is_ok()
    }

    pub fn is_bound_to(&self, rule: &Arc<Rule>) -> bool {
        self.rule
            .get()
            .map_or(false, |weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(rule)))
    }

    pub fn has_rule_binding(&self) -> bool {
        self.rule.get().is_some()
    }

    pub fn protection(&self) -> ProtectionTier {
        *self.protection.lock()
    }

    pub fn set_protection(&self, tier: ProtectionTier) {
        *self.protection.lock() = tier;
    }

    pub fn is_protected(&self) -> bool {
        self.protection() == ProtectionTier::Protected
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted.load(Ordering::Acquire)
    }

    pub fn mark_restricted(&self) {
        self.restricted.store(true, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_paused(&self, paused: bool) -> bool {
        self.paused.swap(paused, Ordering::AcqRel)
    }

    pub fn foreground_wait(&self) -> bool {
        self.foreground_wait.load(Ordering::Acquire)
    }

    pub fn set_foreground_wait(&self, waiting: bool) {
        self.foreground_wait.store(waiting, Ordering::Release);
    }

    pub fn power_wait(&self) -> bool {
        self.power_wait.load(Ordering::Acquire)
    }

    pub fn set_power_wait(&self, waiting: bool) {
        self.power_wait.store(waiting, Ordering::Release);
    }

    pub fn exit_wait(&self) -> bool {
        self.exit_wait.load(Ordering::Acquire)
    }

    /// Claim the exit-wait registration. False if already registered.
    pub fn claim_exit_wait(&self) -> bool {
        !self.exit_wait.swap(true, Ordering::AcqRel)
    }

    pub fn clear_exit_wait(&self) {
        self.exit_wait.store(false, Ordering::Release);
    }

    pub fn mark_abandoned(&self, generation: u64) {
        self.abandoned_at.store(generation, Ordering::Release);
    }

    pub fn abandoned_generation(&self) -> Option<u64> {
        match self.abandoned_at.load(Ordering::Acquire) {
            u64::MAX => None,
            g => Some(g),
        }
    }

    pub fn age(&self) -> Duration {
        self.discovered.elapsed()
    }
}

impl fmt::Debug for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRecord")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("restricted", &self.is_restricted())
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// Serializable view of a record for IPC listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSummary {
    pub pid: u32,
    pub name: String,
    pub path: Option<PathBuf>,
    pub state: HandlingState,
    pub rule: Option<String>,
    pub restricted: bool,
    pub paused: bool,
    pub protected: bool,
}

impl From<&ProcessRecord> for RecordSummary {
    fn from(record: &ProcessRecord) -> Self {
        Self {
            pid: record.pid,
            name: record.name.clone(),
            path: record.cached_path().map(Path::to_path_buf),
            state: record.state(),
            rule: record.rule().map(|r| r.name.clone()),
            restricted: record.is_restricted(),
            paused: record.is_paused(),
            protected: record.is_protected(),
        }
    }
}
