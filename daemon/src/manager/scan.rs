//! Full enumeration: reconciliation scans, hastened scans, memory trimming

use super::{ManagerEvent, ProcessManager, ScanSummary};
use crate::collector::ProcessInfo;
use crate::record::{HandlingState, ProcessRecord};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

impl ProcessManager {
    /// Enumerate everything and triage what is new or stale.
    ///
    /// Returns `None` without doing anything if another scan (or a
    /// memory-freeing pass) holds the gate; that run covers this request.
    pub async fn full_scan(self: &Arc<Self>) -> Option<ScanSummary> {
        let Ok(_gate) = self.scan_gate.try_lock() else {
            debug!("scan already in progress");
            return None;
        };
        Some(self.scan(None).await)
    }

    /// Scan with the timer paused, asking the OS to page out the memory of
    /// every matched process except `ignore_pid`.
    pub async fn free_memory(self: &Arc<Self>, ignore_pid: Option<u32>) -> ScanSummary {
        self.scan_timer_paused.store(true, Ordering::Release);
        let summary = {
            let _gate = self.scan_gate.lock().await;
            self.scan(Some(ignore_pid)).await
        };
        self.scan_timer_paused.store(false, Ordering::Release);
        info!(
            "Freed memory: {} MiB advised for paging out",
            summary.trimmed_bytes / (1024 * 1024)
        );
        summary
    }

    /// Run a scan soon. Requests made while one is pending collapse into it.
    pub fn hasten_scan(self: &Arc<Self>) -> bool {
        if self.cancel.is_cancelled() || self.hasten_pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        let manager = Arc::clone(self);
        let delay = self.config.general.hasten_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = manager.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    manager.full_scan().await;
                }
            }
            manager.hasten_pending.store(false, Ordering::Release);
        });
        true
    }

    pub(super) fn spawn_scan_timer(self: &Arc<Self>) {
        let Some(period) = self.config.general.scan_interval() else {
            info!("Periodic scanning disabled");
            return;
        };
        let manager = Arc::clone(self);
        self.track_task(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if manager.scan_timer_paused.load(Ordering::Acquire) {
                            trace!("scan timer paused");
                            continue;
                        }
                        manager.full_scan().await;
                    }
                }
            }
        }));
    }

    /// Known record for the same process, if any.
    fn known(&self, info: &ProcessInfo) -> Option<Arc<ProcessRecord>> {
        self.get(info.pid)
            .filter(|r| r.same_identity(&info.name) && r.start_time == info.start_time)
    }

    /// Does a known record warrant another triage pass?
    fn is_stale(&self, record: &ProcessRecord) -> bool {
        let state = record.state();
        if state.is_in_flight() || record.is_restricted() || record.is_paused() {
            return false;
        }
        match state {
            HandlingState::Exited | HandlingState::Invalid => true,
            HandlingState::AccessDenied => false,
            HandlingState::Abandoned => {
                record.abandoned_generation() != Some(self.watchlist.generation())
            }
            _ => record.has_rule_binding(),
        }
    }

    async fn scan(self: &Arc<Self>, trim: Option<Option<u32>>) -> ScanSummary {
        let started = Instant::now();
        let mut summary = ScanSummary::default();

        let processes = match self.collector.list_processes() {
            Ok(processes) => processes,
            Err(e) => {
                error!("Process enumeration failed: {}", e);
                return summary;
            }
        };
        summary.seen = processes.len();

        let live: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
        let dead: Vec<Arc<ProcessRecord>> = self
            .processes
            .iter()
            .filter(|r| !live.contains(r.key()))
            .map(|r| Arc::clone(r.value()))
            .collect();
        for record in dead {
            self.retire(&record);
            summary.evicted += 1;
        }

        let now = Instant::now();
        let mut triage = JoinSet::new();
        for info in processes {
            if self.cancel.is_cancelled() {
                break;
            }
            let pid = info.pid;
            if pid == self.self_pid
                || self.is_push_blocked(pid, now)
                || self.in_flight.contains(&pid)
            {
                summary.skipped += 1;
                continue;
            }
            if let Some(record) = self.known(&info) {
                if !self.is_stale(&record) {
                    self.cache_process(&record);
                    if record.power_wait() {
                        self.watch_exit(&record);
                    }
                    summary.skipped += 1;
                    continue;
                }
            }
            summary.triaged += 1;
            let manager = Arc::clone(self);
            triage.spawn(async move { manager.triage(info, None).await });
        }

        while let Some(result) = triage.join_next().await {
            if let Ok(HandlingState::Modified) = result {
                summary.modified += 1;
            }
        }

        if let Some(ignore_pid) = trim {
            if !self.cancel.is_cancelled() {
                summary.trimmed_bytes = self.trim_matched(ignore_pid);
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            seen = summary.seen,
            triaged = summary.triaged,
            modified = summary.modified,
            evicted = summary.evicted,
            "scan complete in {} ms",
            summary.duration_ms
        );
        self.emit(ManagerEvent::ScanCompleted {
            summary: summary.clone(),
        });
        summary
    }

    fn trim_matched(&self, ignore_pid: Option<u32>) -> u64 {
        let mut trimmed = 0u64;
        for record in self.records() {
            if Some(record.pid) == ignore_pid
                || !record.has_rule_binding()
                || record.is_restricted()
                || record.state() == HandlingState::Exited
            {
                continue;
            }
            if self.cancel.is_cancelled() {
                break;
            }
            match self.control.trim_working_set(record.pid) {
                Ok(bytes) => trimmed += bytes,
                Err(e) if e.is_exited() => trace!(pid = record.pid, "exited before trim"),
                Err(e) => {
                    if e.is_access_denied() {
                        record.mark_restricted();
                    }
                    debug!(pid = record.pid, error = %e, "working set trim failed");
                }
            }
        }
        trimmed
    }
}
