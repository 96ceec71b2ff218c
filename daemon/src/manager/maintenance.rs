//! Periodic cleanup of tables that only grow between exits

use super::ProcessManager;
use crate::record::ProcessRecord;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted: usize,
    pub debounce_removed: usize,
    pub unblocked: usize,
}

impl ProcessManager {
    pub(super) fn spawn_maintenance_timer(self: &Arc<Self>) {
        let period = self.config.general.maintenance_interval();
        let manager = Arc::clone(self);
        self.track_task(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        manager.maintenance();
                    }
                }
            }
        }));
    }

    /// One cleanup sweep.
    pub fn maintenance(&self) -> MaintenanceReport {
        let now = Instant::now();
        let mut report = MaintenanceReport::default();

        let block = self.config.general.push_block();
        let before = self.push_seen.len();
        self.push_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) < block);
        report.unblocked = before - self.push_seen.len();

        let dead: Vec<Arc<ProcessRecord>> = self
            .processes
            .iter()
            .filter(|r| !r.state().is_in_flight() && !self.control.is_alive(*r.key()))
            .map(|r| Arc::clone(r.value()))
            .collect();
        for record in dead {
            self.retire(&record);
            report.evicted += 1;
        }

        for rule in self.watchlist.rules() {
            report.debounce_removed += rule
                .recently_modified()
                .sweep(now, |pid| self.control.is_alive(pid));
        }

        // adjust counts moved since the last sort
        self.watchlist.mark_dirty();

        debug!(
            evicted = report.evicted,
            debounce_removed = report.debounce_removed,
            unblocked = report.unblocked,
            "maintenance sweep"
        );
        report
    }
}
