//! Process manager
//!
//! Owns both discovery sources, the process tables and the watchlist, and
//! drives every discovered process through triage. Work arrives from several
//! independent tasks (push feed, scan timer, maintenance timer, per-process
//! exit waits), so all shared state lives in per-pid concurrent maps rather
//! than behind one lock.

mod discovery;
mod events;
mod exit;
mod maintenance;
mod scan;
mod triage;

pub use events::{ManagerEvent, ScanSummary};
pub use maintenance::MaintenanceReport;

use crate::analyzer::Analyzer;
use crate::collector::{ProcessCollector, ProcessEventFeed};
use crate::config::Config;
use crate::control::ProcessControl;
use crate::error::ProcessError;
use crate::foreground::ForegroundEvent;
use crate::power::{PowerBehaviour, PowerControl};
use crate::record::{HandlingState, ProcessRecord, RecordSummary};
use crate::rule::{ApplyOutcome, RuleContext};
use crate::watchlist::Watchlist;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Host interfaces the manager drives.
pub struct Collaborators {
    pub collector: Arc<dyn ProcessCollector>,
    pub control: Arc<dyn ProcessControl>,
    pub power: Arc<dyn PowerControl>,
    pub feed: Option<Arc<dyn ProcessEventFeed>>,
    pub analyzer: Option<Arc<dyn Analyzer>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub tracked: usize,
    pub running: usize,
    pub rules: usize,
    pub push_feed: bool,
    pub foreground_pid: Option<u32>,
    pub power_forced: bool,
    pub ignored_pids: Vec<u32>,
}

pub struct ProcessManager {
    config: Arc<Config>,
    collector: Arc<dyn ProcessCollector>,
    control: Arc<dyn ProcessControl>,
    power: Arc<dyn PowerControl>,
    feed: Option<Arc<dyn ProcessEventFeed>>,
    analyzer: Option<Arc<dyn Analyzer>>,
    watchlist: Arc<Watchlist>,
    /// Every observed process, keyed by pid.
    processes: DashMap<u32, Arc<ProcessRecord>>,
    /// Matched processes that lived past the minimum age.
    running: DashMap<u32, Arc<ProcessRecord>>,
    in_flight: DashSet<u32>,
    /// Pids recently delivered by the push feed.
    push_seen: DashMap<u32, Instant>,
    ignored_pids: DashSet<u32>,
    power_owners: DashSet<u32>,
    scan_gate: tokio::sync::Mutex<()>,
    hasten_pending: AtomicBool,
    scan_timer_paused: AtomicBool,
    /// 0 until the foreground collaborator reports.
    foreground_pid: AtomicU32,
    power_behaviour: Mutex<PowerBehaviour>,
    push_feed_active: AtomicBool,
    events: broadcast::Sender<ManagerEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    self_pid: u32,
}

impl ProcessManager {
    pub fn new(config: Arc<Config>, collaborators: Collaborators, watchlist: Arc<Watchlist>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            collector: collaborators.collector,
            control: collaborators.control,
            power: collaborators.power,
            feed: collaborators.feed,
            analyzer: collaborators.analyzer,
            watchlist,
            processes: DashMap::new(),
            running: DashMap::new(),
            in_flight: DashSet::new(),
            push_seen: DashMap::new(),
            ignored_pids: DashSet::new(),
            power_owners: DashSet::new(),
            scan_gate: tokio::sync::Mutex::new(()),
            hasten_pending: AtomicBool::new(false),
            scan_timer_paused: AtomicBool::new(false),
            foreground_pid: AtomicU32::new(0),
            power_behaviour: Mutex::new(PowerBehaviour::Auto),
            push_feed_active: AtomicBool::new(false),
            events,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            self_pid: std::process::id(),
        })
    }

    /// Start discovery and the periodic tasks.
    ///
    /// Fails only if processes cannot be enumerated at all.
    pub fn start(self: &Arc<Self>) -> Result<(), ProcessError> {
        self.collector.list_processes()?;

        if self.config.general.push_feed {
            self.start_push_feed();
        }
        self.spawn_scan_timer();
        self.spawn_maintenance_timer();

        let manager = Arc::clone(self);
        self.track_task(tokio::spawn(async move {
            manager.full_scan().await;
        }));
        info!(
            rules = self.watchlist.len(),
            "Process manager started (push feed: {})",
            self.push_feed_active.load(Ordering::Acquire)
        );
        Ok(())
    }

    /// Stop all activity, release held power forces and clear every table.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }
        // an in-flight scan observes cancellation and returns early
        let _gate = self.scan_gate.lock().await;

        for pid in self.power_owners.iter().map(|p| *p).collect::<Vec<_>>() {
            self.power.release(pid);
        }
        self.power_owners.clear();
        for rule in self.watchlist.rules() {
            rule.clear_runtime();
        }
        self.processes.clear();
        self.running.clear();
        self.push_seen.clear();
        self.ignored_pids.clear();
        info!("Process manager stopped");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ManagerEvent) {
        // no listeners is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, record: &ProcessRecord, state: HandlingState) {
        let previous = record.state();
        if !record.set_state(state) || previous == state || state.is_in_flight() {
            return;
        }
        self.emit(ManagerEvent::StateChanged {
            pid: record.pid,
            name: record.name.clone(),
            state,
        });
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn watchlist(&self) -> &Arc<Watchlist> {
        &self.watchlist
    }

    pub fn get(&self, pid: u32) -> Option<Arc<ProcessRecord>> {
        self.processes.get(&pid).map(|r| Arc::clone(r.value()))
    }

    pub fn records(&self) -> Vec<Arc<ProcessRecord>> {
        self.processes.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn summaries(&self) -> Vec<RecordSummary> {
        let mut list: Vec<RecordSummary> =
            self.processes.iter().map(|r| RecordSummary::from(r.value().as_ref())).collect();
        list.sort_by_key(|s| s.pid);
        list
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.running.contains_key(&pid)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn is_power_owner(&self, pid: u32) -> bool {
        self.power_owners.contains(&pid)
    }

    pub fn status(&self) -> ManagerStatus {
        let mut ignored_pids: Vec<u32> = self.ignored_pids.iter().map(|p| *p).collect();
        ignored_pids.sort_unstable();
        let foreground = self.foreground_pid.load(Ordering::Acquire);
        ManagerStatus {
            tracked: self.processes.len(),
            running: self.running.len(),
            rules: self.watchlist.len(),
            push_feed: self.push_feed_active.load(Ordering::Acquire),
            foreground_pid: (foreground != 0).then_some(foreground),
            power_forced: !self.power_owners.is_empty(),
            ignored_pids,
        }
    }

    /// Shield `pid` from triage, e.g. while something else is handling it.
    pub fn ignore_pid(&self, pid: u32) -> bool {
        self.ignored_pids.insert(pid)
    }

    /// Lift the shield; the next scan treats the process as new.
    pub fn unignore_pid(&self, pid: u32) -> bool {
        if self.ignored_pids.remove(&pid).is_none() {
            return false;
        }
        self.processes
            .remove_if(&pid, |_, r| r.state() == HandlingState::Abandoned);
        true
    }

    /// Without a foreground report every process counts as foreground.
    fn is_foreground(&self, pid: u32) -> bool {
        let current = self.foreground_pid.load(Ordering::Acquire);
        current == 0 || current == pid
    }

    fn rule_context(&self, foreground: bool) -> RuleContext<'_> {
        RuleContext {
            control: self.control.as_ref(),
            power: self.power.as_ref(),
            power_owners: &self.power_owners,
            power_enabled: *self.power_behaviour.lock() != PowerBehaviour::Manual,
            foreground,
            cancel: &self.cancel,
        }
    }

    /// The active process changed: pause the previous one, resume the new one.
    pub fn on_foreground_changed(self: &Arc<Self>, event: ForegroundEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        let previous = self.foreground_pid.swap(event.pid, Ordering::AcqRel);
        if previous == event.pid {
            return;
        }
        debug!(pid = event.pid, fullscreen = event.fullscreen, "foreground changed");

        if previous != 0 {
            if let Some(record) = self.get(previous) {
                if let Some(rule) = record.rule().filter(|_| record.foreground_wait()) {
                    let outcome = rule.pause(&record, &self.rule_context(false));
                    self.settle_foreground(&record, outcome);
                }
            }
        } else {
            // everything was treated as foreground until now
            for record in self.records() {
                if record.pid == event.pid || !record.foreground_wait() {
                    continue;
                }
                if let Some(rule) = record.rule() {
                    let outcome = rule.pause(&record, &self.rule_context(false));
                    self.settle_foreground(&record, outcome);
                }
            }
        }

        if let Some(record) = self.get(event.pid) {
            if let Some(rule) = record.rule().filter(|_| record.foreground_wait()) {
                let outcome = rule.resume(&record, &self.rule_context(true));
                self.settle_foreground(&record, outcome);
            }
        }
    }

    fn settle_foreground(self: &Arc<Self>, record: &Arc<ProcessRecord>, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Exited => self.retire(record),
            ApplyOutcome::AccessDenied => self.set_state(record, HandlingState::AccessDenied),
            ApplyOutcome::Modified(info) => {
                self.emit(ManagerEvent::Modified { info });
                if record.power_wait() {
                    self.watch_exit(record);
                }
                self.settle_pause_state(record, HandlingState::Modified);
            }
            _ => self.settle_pause_state(record, HandlingState::Unmodified),
        }
    }

    fn settle_pause_state(&self, record: &ProcessRecord, resumed: HandlingState) {
        if record.is_paused() {
            self.set_state(record, HandlingState::Paused);
        } else {
            self.set_state(record, resumed);
        }
    }

    /// Feed foreground changes from any source until it closes.
    pub fn attach_foreground(self: &Arc<Self>, mut rx: mpsc::Receiver<ForegroundEvent>) {
        let manager = Arc::clone(self);
        self.track_task(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => manager.on_foreground_changed(event),
                        None => break,
                    },
                }
            }
            debug!("foreground listener detached");
        }));
    }

    /// The power subsystem changed hands. In manual mode rules stop forcing.
    pub fn on_power_behaviour_changed(&self, behaviour: PowerBehaviour) {
        let previous = std::mem::replace(&mut *self.power_behaviour.lock(), behaviour);
        if previous == behaviour {
            return;
        }
        info!("Power behaviour changed: {:?} -> {:?}", previous, behaviour);
        if behaviour == PowerBehaviour::Manual {
            let owners: Vec<u32> = self.power_owners.iter().map(|p| *p).collect();
            for pid in owners {
                self.power_owners.remove(&pid);
                self.power.release(pid);
                if let Some(record) = self.get(pid) {
                    record.set_power_wait(false);
                }
            }
        }
    }

    pub fn power_behaviour(&self) -> PowerBehaviour {
        *self.power_behaviour.lock()
    }
}
