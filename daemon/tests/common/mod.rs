//! In-memory host shared by the rule and manager tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskwarden_daemon::collector::{ProcessCollector, ProcessInfo};
use taskwarden_daemon::config::{Config, RuleConfig};
use taskwarden_daemon::control::{ExitWait, ProcessControl};
use taskwarden_daemon::error::{ProcessError, ProcessResult};
use taskwarden_daemon::manager::{Collaborators, ProcessManager};
use taskwarden_daemon::power::{PowerControl, PowerPlan};
use taskwarden_daemon::rule::strategy::Priority;
use taskwarden_daemon::watchlist::Watchlist;

pub const ALL_CORES: u64 = 0b1111_1111;
pub const TRIM_BYTES: u64 = 4096;

#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub name: String,
    pub start_time: u64,
    pub path: Option<PathBuf>,
    pub priority: Priority,
    pub affinity: u64,
    pub alive: bool,
    /// Writes are refused with EPERM.
    pub denied: bool,
}

#[derive(Default)]
pub struct FakeHost {
    processes: Mutex<HashMap<u32, FakeProcess>>,
    power_owners: Mutex<HashMap<u32, PowerPlan>>,
    pub writes: Mutex<Vec<(u32, String)>>,
    pub trims: Mutex<Vec<u32>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawn(&self, pid: u32, name: &str) {
        self.spawn_with(pid, name, None);
    }

    pub fn spawn_with(&self, pid: u32, name: &str, path: Option<&str>) {
        self.processes.lock().insert(
            pid,
            FakeProcess {
                name: name.to_string(),
                start_time: 1_700_000_000 + pid as u64,
                path: path.map(PathBuf::from),
                priority: Priority::Normal,
                affinity: ALL_CORES,
                alive: true,
                denied: false,
            },
        );
    }

    /// Replace whatever runs under `pid` with a new process.
    pub fn recycle(&self, pid: u32, name: &str) {
        self.spawn(pid, name);
        if let Some(p) = self.processes.lock().get_mut(&pid) {
            p.start_time += 1000;
        }
    }

    pub fn kill(&self, pid: u32) {
        if let Some(p) = self.processes.lock().get_mut(&pid) {
            p.alive = false;
        }
    }

    pub fn deny(&self, pid: u32) {
        if let Some(p) = self.processes.lock().get_mut(&pid) {
            p.denied = true;
        }
    }

    /// The process changes its own priority behind our back.
    pub fn revert_priority(&self, pid: u32, priority: Priority) {
        if let Some(p) = self.processes.lock().get_mut(&pid) {
            p.priority = priority;
        }
    }

    /// The process starts restricted to `mask`.
    pub fn pin(&self, pid: u32, mask: u64) {
        if let Some(p) = self.processes.lock().get_mut(&pid) {
            p.affinity = mask;
        }
    }

    pub fn priority_of(&self, pid: u32) -> Priority {
        self.processes.lock()[&pid].priority
    }

    pub fn affinity_of(&self, pid: u32) -> u64 {
        self.processes.lock()[&pid].affinity
    }

    pub fn forced_plan(&self) -> Option<PowerPlan> {
        self.power_owners.lock().values().copied().max()
    }

    pub fn power_owner_count(&self) -> usize {
        self.power_owners.lock().len()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    fn with_live<T>(&self, pid: u32, f: impl FnOnce(&mut FakeProcess) -> ProcessResult<T>) -> ProcessResult<T> {
        let mut processes = self.processes.lock();
        match processes.get_mut(&pid) {
            Some(p) if p.alive => f(p),
            _ => Err(ProcessError::Exited(pid)),
        }
    }
}

impl ProcessCollector for FakeHost {
    fn list_processes(&self) -> ProcessResult<Vec<ProcessInfo>> {
        let mut list: Vec<ProcessInfo> = self
            .processes
            .lock()
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(pid, p)| ProcessInfo {
                pid: *pid,
                name: p.name.clone(),
                start_time: p.start_time,
            })
            .collect();
        list.sort_by_key(|p| p.pid);
        Ok(list)
    }

    fn get_process(&self, pid: u32) -> Option<ProcessInfo> {
        let processes = self.processes.lock();
        let p = processes.get(&pid).filter(|p| p.alive)?;
        Some(ProcessInfo {
            pid,
            name: p.name.clone(),
            start_time: p.start_time,
        })
    }

    fn resolve_path(&self, pid: u32) -> ProcessResult<PathBuf> {
        self.with_live(pid, |p| p.path.clone().ok_or(ProcessError::AccessDenied(pid)))
    }
}

#[async_trait]
impl ProcessControl for FakeHost {
    fn priority(&self, pid: u32) -> ProcessResult<Priority> {
        self.with_live(pid, |p| Ok(p.priority))
    }

    fn set_priority(&self, pid: u32, priority: Priority) -> ProcessResult<()> {
        self.with_live(pid, |p| {
            if p.denied {
                return Err(ProcessError::AccessDenied(pid));
            }
            p.priority = priority;
            Ok(())
        })?;
        self.writes.lock().push((pid, format!("priority={}", priority)));
        Ok(())
    }

    fn affinity(&self, pid: u32) -> ProcessResult<u64> {
        self.with_live(pid, |p| Ok(p.affinity))
    }

    fn set_affinity(&self, pid: u32, mask: u64) -> ProcessResult<()> {
        self.with_live(pid, |p| {
            if p.denied {
                return Err(ProcessError::AccessDenied(pid));
            }
            p.affinity = mask;
            Ok(())
        })?;
        self.writes.lock().push((pid, format!("affinity={:#b}", mask)));
        Ok(())
    }

    fn trim_working_set(&self, pid: u32) -> ProcessResult<u64> {
        self.with_live(pid, |_| Ok(TRIM_BYTES))?;
        self.trims.lock().push(pid);
        Ok(TRIM_BYTES)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.processes.lock().get(&pid).map_or(false, |p| p.alive)
    }

    fn all_cores(&self) -> u64 {
        ALL_CORES
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> ExitWait {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive(pid) {
                return ExitWait::Exited;
            }
            if Instant::now() >= deadline {
                return ExitWait::TimedOut;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl PowerControl for FakeHost {
    fn force(&self, plan: PowerPlan, owner: u32) -> bool {
        self.power_owners.lock().insert(owner, plan);
        true
    }

    fn release(&self, owner: u32) {
        self.power_owners.lock().remove(&owner);
    }

    fn is_forced(&self) -> bool {
        !self.power_owners.lock().is_empty()
    }
}

/// Config for driving the manager by hand: no timers, no push feed, no
/// minimum age.
pub fn test_config(rules: Vec<RuleConfig>) -> Config {
    let mut config = Config::default();
    config.general.scan_interval_secs = 0;
    config.general.hasten_delay_secs = 0;
    config.general.min_running_age_secs = 0;
    config.general.push_feed = false;
    config.rules = rules;
    config
}

pub fn manager_for(host: &Arc<FakeHost>, config: Config) -> Arc<ProcessManager> {
    let (watchlist, _) = Watchlist::from_configs(&config.rules, config.debounce.settings());
    let collaborators = Collaborators {
        collector: host.clone(),
        control: host.clone(),
        power: host.clone(),
        feed: None,
        analyzer: None,
    };
    ProcessManager::new(Arc::new(config), collaborators, Arc::new(watchlist))
}

pub fn game_rule() -> RuleConfig {
    use taskwarden_daemon::rule::strategy::{AffinityStrategy, PriorityStrategy};
    let mut rule = RuleConfig::named("games");
    rule.executables = vec!["game.exe".to_string()];
    rule.priority = Some(Priority::High);
    rule.priority_strategy = PriorityStrategy::Force;
    rule.affinity = Some(0b0011);
    rule.affinity_strategy = AffinityStrategy::Force;
    rule.power_plan = Some(PowerPlan::HighPerformance);
    rule
}

/// Poll `condition` for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
