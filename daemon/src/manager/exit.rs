//! Exit notification and teardown

use super::{ManagerEvent, ProcessManager};
use crate::control::ExitWait;
use crate::record::{HandlingState, ProcessRecord};
use std::sync::Arc;
use tracing::{debug, trace};

impl ProcessManager {
    /// Wait for `record` to exit, at most once per record. Each wait is
    /// bounded; a timed-out wait is picked up again by the next scan.
    pub(super) fn watch_exit(self: &Arc<Self>, record: &Arc<ProcessRecord>) {
        if !record.claim_exit_wait() {
            return;
        }
        if let Some(rule) = record.rule() {
            rule.track(record.pid);
        }
        let manager = Arc::clone(self);
        let record = Arc::clone(record);
        let timeout = self.config.general.exit_wait_timeout();
        tokio::spawn(async move {
            let wait = tokio::select! {
                _ = manager.cancel.cancelled() => return,
                wait = manager.control.wait_for_exit(record.pid, timeout) => wait,
            };
            if manager.cancel.is_cancelled() {
                return;
            }
            match wait {
                ExitWait::Exited => {
                    trace!(pid = record.pid, "exit notification");
                    manager.retire(&record);
                }
                ExitWait::TimedOut => {
                    trace!(pid = record.pid, "exit wait timed out");
                    record.clear_exit_wait();
                }
            }
        });
    }

    /// Exit notification for `pid`: tear down everything held for it.
    pub fn remove_running(&self, pid: u32) -> bool {
        let record = self
            .running
            .get(&pid)
            .map(|r| Arc::clone(r.value()))
            .or_else(|| self.get(pid));
        match record {
            Some(record) => {
                self.retire(&record);
                true
            }
            None => false,
        }
    }

    /// Forget a process that exited (or whose pid was recycled).
    pub(super) fn retire(&self, record: &Arc<ProcessRecord>) {
        let pid = record.pid;
        let first = record.set_state(HandlingState::Exited);

        if self
            .running
            .remove_if(&pid, |_, r| Arc::ptr_eq(r, record))
            .is_some()
        {
            debug!(pid, name = %record.name, "removed from running table");
        }
        record.clear_exit_wait();
        self.processes.remove_if(&pid, |_, r| Arc::ptr_eq(r, record));

        if let Some(rule) = record.rule() {
            rule.forget(pid);
        }
        if self.power_owners.remove(&pid).is_some() {
            self.power.release(pid);
        }
        record.set_power_wait(false);
        record.set_foreground_wait(false);

        if first {
            self.emit(ManagerEvent::Exited {
                pid,
                name: record.name.clone(),
            });
        }
    }
}
