//! Recently-modified table
//!
//! Tracks processes a rule adjusted so that a process resetting its own
//! priority or affinity is eventually left alone ("free will") instead of
//! being fought on every scan.

use super::strategy::Priority;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceSettings {
    pub ignore_window: Duration,
    /// Consecutive reversals before free will is granted.
    pub free_will_threshold: u32,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            ignore_window: Duration::from_secs(30 * 60),
            free_will_threshold: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DebounceEntry {
    pub name: String,
    /// Positive while our settings hold, negative while they are being reverted.
    pub expected_state: i32,
    pub last_modified: Instant,
    pub last_ignored: Option<Instant>,
    pub free_will: bool,
    pub priority: Option<Priority>,
    pub affinity: Option<u64>,
}

impl DebounceEntry {
    fn last_activity(&self) -> Instant {
        match self.last_ignored {
            Some(ignored) if ignored > self.last_modified => ignored,
            _ => self.last_modified,
        }
    }

    fn holds(&self, priority: Option<Priority>, affinity: Option<u64>) -> bool {
        let priority_held = match (self.priority, priority) {
            (Some(set), Some(now)) => set == now,
            _ => true,
        };
        let affinity_held = match (self.affinity, affinity) {
            (Some(set), Some(now)) => set == now,
            _ => true,
        };
        priority_held && affinity_held
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceVerdict {
    /// No live entry, adjust normally.
    Proceed,
    /// Inside the ignore window; `held` tells whether our settings survived.
    Ignore { held: bool },
    FreeWill { newly_granted: bool },
}

#[derive(Debug)]
pub struct RecentlyModified {
    settings: DebounceSettings,
    entries: DashMap<u32, DebounceEntry>,
}

impl RecentlyModified {
    pub fn new(settings: DebounceSettings) -> Self {
        Self {
            settings,
            entries: DashMap::new(),
        }
    }

    pub fn settings(&self) -> DebounceSettings {
        self.settings
    }

    /// Account for another sighting of `pid` with its current settings.
    pub fn observe(
        &self,
        pid: u32,
        name: &str,
        priority: Option<Priority>,
        affinity: Option<u64>,
        now: Instant,
    ) -> DebounceVerdict {
        let Some(mut entry) = self.entries.get_mut(&pid) else {
            return DebounceVerdict::Proceed;
        };

        if entry.name != name {
            drop(entry);
            self.entries.remove(&pid);
            return DebounceVerdict::Proceed;
        }
        if entry.free_will {
            return DebounceVerdict::FreeWill {
                newly_granted: false,
            };
        }
        if now.saturating_duration_since(entry.last_modified) > self.settings.ignore_window {
            drop(entry);
            self.entries.remove(&pid);
            return DebounceVerdict::Proceed;
        }

        let held = entry.holds(priority, affinity);
        // streaks: a held setting cancels earlier reversals and vice versa
        entry.expected_state = if held {
            entry.expected_state.max(0) + 1
        } else {
            entry.expected_state.min(0) - 1
        };

        if entry.expected_state <= -(self.settings.free_will_threshold as i32) {
            entry.free_will = true;
            return DebounceVerdict::FreeWill {
                newly_granted: true,
            };
        }

        entry.last_ignored = Some(now);
        DebounceVerdict::Ignore { held }
    }

    /// Remember what was just written to `pid`.
    pub fn record(
        &self,
        pid: u32,
        name: &str,
        priority: Option<Priority>,
        affinity: Option<u64>,
        now: Instant,
    ) {
        self.entries.insert(
            pid,
            DebounceEntry {
                name: name.to_string(),
                expected_state: 0,
                last_modified: now,
                last_ignored: None,
                free_will: false,
                priority,
                affinity,
            },
        );
    }

    pub fn forget(&self, pid: u32) -> bool {
        self.entries.remove(&pid).is_some()
    }

    pub fn get(&self, pid: u32) -> Option<DebounceEntry> {
        self.entries.get(&pid).map(|e| e.clone())
    }

    pub fn has_free_will(&self, pid: u32) -> bool {
        self.entries.get(&pid).map_or(false, |e| e.free_will)
    }

    /// Drop entries for dead processes and entries idle past the window.
    /// Free-will entries live as long as their process.
    pub fn sweep<F>(&self, now: Instant, is_alive: F) -> usize
    where
        F: Fn(u32) -> bool,
    {
        let window = self.settings.ignore_window;
        let before = self.entries.len();
        self.entries.retain(|pid, entry| {
            if !is_alive(*pid) {
                return false;
            }
            entry.free_will || now.saturating_duration_since(entry.last_activity()) <= window
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
