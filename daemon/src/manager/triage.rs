//! Per-process pipeline: identify, match, apply, register waits

use super::{ManagerEvent, ProcessManager};
use crate::collector::ProcessInfo;
use crate::record::{HandlingState, ProcessRecord, ProtectionTier};
use crate::rule::{ApplyOutcome, Rule};
use dashmap::DashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace};

/// Marks a pid as being triaged for as long as it lives.
struct InFlight<'a> {
    set: &'a DashSet<u32>,
    pid: u32,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a DashSet<u32>, pid: u32) -> Option<Self> {
        set.insert(pid).then_some(Self { set, pid })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.pid);
    }
}

impl ProcessManager {
    /// Run one process through triage and return where it ended up.
    pub async fn triage(self: &Arc<Self>, info: ProcessInfo, path: Option<PathBuf>) -> HandlingState {
        if self.cancel.is_cancelled() {
            return HandlingState::Abandoned;
        }
        let Some(_guard) = InFlight::claim(&self.in_flight, info.pid) else {
            trace!(pid = info.pid, "already in triage");
            return HandlingState::Processing;
        };
        let (record, fresh) = self.admit_record(&info, path);
        self.triage_record(record, fresh).await
    }

    /// The record for `info`, replacing one left behind by a recycled pid.
    fn admit_record(&self, info: &ProcessInfo, path: Option<PathBuf>) -> (Arc<ProcessRecord>, bool) {
        if let Some(existing) = self.get(info.pid) {
            if existing.same_identity(&info.name)
                && existing.start_time == info.start_time
                && existing.state() != HandlingState::Exited
            {
                return (existing, false);
            }
            debug!(
                pid = info.pid,
                old = %existing.name,
                new = %info.name,
                "pid reused, discarding stale record"
            );
            self.retire(&existing);
        }
        let mut record = ProcessRecord::new(info.pid, info.name.clone(), info.start_time);
        if let Some(path) = path {
            record = record.with_path(path);
        }
        let record = Arc::new(record);
        self.processes.insert(info.pid, Arc::clone(&record));
        (record, true)
    }

    /// Same process, but it has to be matched against a different rule.
    fn rebind_record(&self, old: &Arc<ProcessRecord>) -> Arc<ProcessRecord> {
        if let Some(rule) = old.rule() {
            rule.forget(old.pid);
        }
        if self.power_owners.remove(&old.pid).is_some() {
            self.power.release(old.pid);
        }
        self.running.remove_if(&old.pid, |_, r| Arc::ptr_eq(r, old));
        let mut record = ProcessRecord::new(old.pid, old.name.clone(), old.start_time);
        if let Some(path) = old.cached_path() {
            record = record.with_path(path);
        }
        let record = Arc::new(record);
        self.processes.insert(old.pid, Arc::clone(&record));
        record
    }

    fn abandon(&self, record: &ProcessRecord) -> HandlingState {
        record.mark_abandoned(self.watchlist.generation());
        self.set_state(record, HandlingState::Abandoned);
        HandlingState::Abandoned
    }

    async fn triage_record(self: &Arc<Self>, mut record: Arc<ProcessRecord>, fresh: bool) -> HandlingState {
        let pid = record.pid;
        self.set_state(&record, HandlingState::Triage);

        if record.name.is_empty() {
            record.mark_restricted();
            self.set_state(&record, HandlingState::AccessDenied);
            return HandlingState::AccessDenied;
        }

        let protection = &self.config.protection;
        if self.ignored_pids.contains(&pid) || protection.is_ignored(&record.name) {
            trace!(pid, name = %record.name, "ignored");
            return self.abandon(&record);
        }
        if protection.is_protected(&record.name) {
            record.set_protection(ProtectionTier::Protected);
        }

        let matched = {
            let collector = self.collector.as_ref();
            let target = &record;
            self.watchlist
                .find_match(&record.name, || target.path(collector))
        };
        let Some(rule) = matched else {
            return self.abandon(&record);
        };
        if !rule.is_enabled() {
            trace!(pid, rule = %rule.name, "matched disabled rule");
            return self.abandon(&record);
        }

        if record.has_rule_binding() && !record.is_bound_to(&rule) {
            debug!(pid, rule = %rule.name, "rule changed, rebinding");
            record = self.rebind_record(&record);
        }
        let first_match = record.bind_rule(&rule);

        if first_match && fresh && !rule.delay.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => return HandlingState::Abandoned,
                _ = tokio::time::sleep(rule.delay) => {}
            }
            if !self.control.is_alive(pid) {
                self.retire(&record);
                return HandlingState::Exited;
            }
        }

        self.set_state(&record, HandlingState::Processing);
        let state = self.enforce(&record, &rule);

        if rule.foreground_mode.is_foreground_only() && state != HandlingState::Exited {
            record.set_foreground_wait(true);
        }

        if state.is_settled() {
            if record.power_wait() {
                self.watch_exit(&record);
            }
            self.cache_process(&record);
            if first_match && rule.analyze {
                if let Some(analyzer) = self.analyzer.clone() {
                    let target = Arc::clone(&record);
                    tokio::spawn(async move { analyzer.analyze(target).await });
                }
            }
        }
        state
    }

    /// Apply, pause or resume depending on foreground state, then settle the
    /// record's handling state.
    fn enforce(self: &Arc<Self>, record: &Arc<ProcessRecord>, rule: &Arc<Rule>) -> HandlingState {
        let foreground = self.is_foreground(record.pid);
        let ctx = self.rule_context(foreground);

        let (outcome, via_pause) = if rule.foreground_mode.is_foreground_only() && !foreground {
            (rule.pause(record, &ctx), true)
        } else if record.is_paused() {
            (rule.resume(record, &ctx), false)
        } else {
            (rule.apply(record, &ctx), false)
        };

        let state = match outcome {
            ApplyOutcome::Modified(info) => {
                self.emit(ManagerEvent::Modified { info });
                HandlingState::Modified
            }
            ApplyOutcome::Unmodified => HandlingState::Unmodified,
            ApplyOutcome::Finished => HandlingState::Finished,
            ApplyOutcome::FreeWill => {
                self.emit(ManagerEvent::FreeWill {
                    pid: record.pid,
                    name: record.name.clone(),
                    rule: rule.name.clone(),
                });
                HandlingState::Unmodified
            }
            ApplyOutcome::Exited => {
                self.retire(record);
                return HandlingState::Exited;
            }
            ApplyOutcome::AccessDenied => HandlingState::AccessDenied,
            ApplyOutcome::Cancelled => return HandlingState::Abandoned,
        };

        let state = if via_pause && record.is_paused() {
            HandlingState::Paused
        } else {
            state
        };
        self.set_state(record, state);
        state
    }

    /// Admit a record to the running table once it outlived the minimum age.
    pub fn cache_process(self: &Arc<Self>, record: &Arc<ProcessRecord>) -> bool {
        if self.running.contains_key(&record.pid) {
            return true;
        }
        if record.age() < self.config.general.min_running_age() || !record.has_rule_binding() {
            return false;
        }
        if !record.state().is_settled() {
            return false;
        }
        self.running.insert(record.pid, Arc::clone(record));
        self.watch_exit(record);
        true
    }
}
