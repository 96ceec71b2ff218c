//! Power plan collaborator
//!
//! The manager only relies on [`PowerControl`]. [`GovernorPower`] maps plans
//! onto cpufreq scaling governors and keeps a force alive while any owner
//! still holds one.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerPlan {
    PowerSaver,
    Balanced,
    HighPerformance,
}

impl PowerPlan {
    pub fn governor(self) -> &'static str {
        match self {
            PowerPlan::PowerSaver => "powersave",
            PowerPlan::Balanced => "schedutil",
            PowerPlan::HighPerformance => "performance",
        }
    }
}

impl fmt::Display for PowerPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerPlan::PowerSaver => "power_saver",
            PowerPlan::Balanced => "balanced",
            PowerPlan::HighPerformance => "high_performance",
        };
        f.write_str(s)
    }
}

/// How the power subsystem is currently being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerBehaviour {
    #[default]
    Auto,
    RuleForced,
    /// The user took over; rules must not force plans.
    Manual,
}

pub trait PowerControl: Send + Sync {
    /// Force `plan` on behalf of `owner`. Returns false if the plan could not
    /// be enacted.
    fn force(&self, plan: PowerPlan, owner: u32) -> bool;
    /// Drop `owner`'s force. Normal operation resumes once no owner remains.
    fn release(&self, owner: u32);
    fn is_forced(&self) -> bool;
}

/// Power collaborator for hosts without power management.
pub struct NoPower;

impl PowerControl for NoPower {
    fn force(&self, _plan: PowerPlan, _owner: u32) -> bool {
        false
    }

    fn release(&self, _owner: u32) {}

    fn is_forced(&self) -> bool {
        false
    }
}

struct GovernorState {
    owners: HashMap<u32, PowerPlan>,
    /// Governor in effect before the first force.
    saved: Option<String>,
    active: Option<PowerPlan>,
}

pub struct GovernorPower {
    cpu_root: PathBuf,
    state: Mutex<GovernorState>,
}

impl GovernorPower {
    pub fn new() -> Self {
        Self::with_root("/sys/devices/system/cpu")
    }

    pub fn with_root(cpu_root: impl Into<PathBuf>) -> Self {
        Self {
            cpu_root: cpu_root.into(),
            state: Mutex::new(GovernorState {
                owners: HashMap::new(),
                saved: None,
                active: None,
            }),
        }
    }

    fn governor_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.cpu_root) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let is_cpu = name
                    .strip_prefix("cpu")
                    .map_or(false, |n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
                if !is_cpu {
                    continue;
                }
                let file = entry.path().join("cpufreq").join("scaling_governor");
                if file.exists() {
                    files.push(file);
                }
            }
        }
        files.sort();
        files
    }

    fn current_governor(&self) -> Option<String> {
        let file = self.governor_files().into_iter().next()?;
        fs::read_to_string(file).ok().map(|s| s.trim().to_string())
    }

    fn write_governor(&self, governor: &str) -> bool {
        let files = self.governor_files();
        if files.is_empty() {
            debug!("No cpufreq governors available");
            return false;
        }
        let mut ok = true;
        for file in files {
            if let Err(e) = fs::write(&file, governor) {
                warn!("Failed to set governor {} on {:?}: {}", governor, file, e);
                ok = false;
            }
        }
        ok
    }

    /// The strongest plan any owner asks for wins.
    fn effective(owners: &HashMap<u32, PowerPlan>) -> Option<PowerPlan> {
        owners.values().copied().max()
    }
}

impl Default for GovernorPower {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerControl for GovernorPower {
    fn force(&self, plan: PowerPlan, owner: u32) -> bool {
        let mut state = self.state.lock();
        if state.saved.is_none() {
            state.saved = self.current_governor();
        }
        state.owners.insert(owner, plan);
        let wanted = Self::effective(&state.owners);
        if wanted == state.active {
            return true;
        }
        let Some(wanted) = wanted else { return false };
        if self.write_governor(wanted.governor()) {
            info!("Power plan forced to {} (owner {})", wanted, owner);
            state.active = Some(wanted);
            true
        } else {
            state.owners.remove(&owner);
            false
        }
    }

    fn release(&self, owner: u32) {
        let mut state = self.state.lock();
        if state.owners.remove(&owner).is_none() {
            return;
        }
        match Self::effective(&state.owners) {
            Some(plan) if Some(plan) != state.active => {
                if self.write_governor(plan.governor()) {
                    state.active = Some(plan);
                }
            }
            Some(_) => {}
            None => {
                if let Some(saved) = state.saved.take() {
                    self.write_governor(&saved);
                    info!("Power force released, governor restored to {}", saved);
                }
                state.active = None;
            }
        }
    }

    fn is_forced(&self) -> bool {
        !self.state.lock().owners.is_empty()
    }
}
