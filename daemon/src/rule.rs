//! Rules: match criteria, targets and the per-rule adjustment engine

pub mod debounce;
pub mod strategy;

use crate::config::RuleConfig;
use crate::control::ProcessControl;
use crate::error::ProcessError;
use crate::power::{PowerControl, PowerPlan};
use crate::record::ProcessRecord;
use dashmap::DashSet;
use debounce::{DebounceSettings, DebounceVerdict, RecentlyModified};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use strategy::{
    bit_count, resolve_affinity, resolve_priority, AffinityStrategy, Priority, PriorityStrategy,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How much of a rule only applies while its process is in the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForegroundMode {
    /// Always active.
    #[default]
    Ignore,
    /// Priority and affinity.
    Standard,
    /// Priority, affinity and power plan.
    Full,
    PowerOnly,
}

impl ForegroundMode {
    pub fn is_foreground_only(self) -> bool {
        self != ForegroundMode::Ignore
    }

    pub fn covers_adjustments(self) -> bool {
        matches!(self, ForegroundMode::Standard | ForegroundMode::Full)
    }

    pub fn covers_power(self) -> bool {
        matches!(self, ForegroundMode::Full | ForegroundMode::PowerOnly)
    }
}

/// Problems found (and corrected) while building a rule from its description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleWarning {
    NoMatchCriteria,
    AffinityStrategyWithoutMask,
    MaskWithoutStrategy,
    PriorityWithoutStrategy,
    BackgroundPriorityNotLower,
    BackgroundWithoutForegroundMode,
    Inert,
}

impl std::fmt::Display for RuleWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            RuleWarning::NoMatchCriteria => "no executables or path; rule disabled",
            RuleWarning::AffinityStrategyWithoutMask => "affinity strategy without mask; strategy cleared",
            RuleWarning::MaskWithoutStrategy => "affinity mask without strategy; using limit",
            RuleWarning::PriorityWithoutStrategy => "priority without strategy; priority is not applied",
            RuleWarning::BackgroundPriorityNotLower => {
                "background priority is not below the foreground priority; cleared"
            }
            RuleWarning::BackgroundWithoutForegroundMode => {
                "background settings require a priority/affinity foreground mode; cleared"
            }
            RuleWarning::Inert => "no priority, affinity or power target; rule does nothing",
        };
        f.write_str(msg)
    }
}

/// Before/after values of one adjustment, for outward notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationInfo {
    pub pid: u32,
    pub name: String,
    pub rule: String,
    pub old_priority: Option<Priority>,
    pub new_priority: Option<Priority>,
    pub priority_failed: bool,
    pub old_affinity: Option<u64>,
    pub new_affinity: Option<u64>,
    pub affinity_failed: bool,
    pub power_plan: Option<PowerPlan>,
}

impl ModificationInfo {
    fn new(record: &ProcessRecord, rule: &str) -> Self {
        Self {
            pid: record.pid,
            name: record.name.clone(),
            rule: rule.to_string(),
            old_priority: None,
            new_priority: None,
            priority_failed: false,
            old_affinity: None,
            new_affinity: None,
            affinity_failed: false,
            power_plan: None,
        }
    }

    pub fn changed(&self) -> bool {
        (self.new_priority.is_some() && !self.priority_failed)
            || (self.new_affinity.is_some() && !self.affinity_failed)
            || self.power_plan.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Modified(ModificationInfo),
    Unmodified,
    /// Nothing in the rule applies to this process.
    Finished,
    /// The process keeps reverting our settings; it is left alone from now on.
    FreeWill,
    Exited,
    AccessDenied,
    Cancelled,
}

/// Collaborators a rule needs while adjusting one process.
pub struct RuleContext<'a> {
    pub control: &'a dyn ProcessControl,
    pub power: &'a dyn PowerControl,
    /// Owners currently holding a power force.
    pub power_owners: &'a DashSet<u32>,
    /// False while the user drives power plans manually.
    pub power_enabled: bool,
    pub foreground: bool,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug)]
pub struct Rule {
    pub name: String,
    executables: Vec<String>,
    path: Option<PathBuf>,
    ignore: Vec<String>,
    pub priority: Option<Priority>,
    pub priority_strategy: PriorityStrategy,
    pub affinity: Option<u64>,
    pub affinity_strategy: AffinityStrategy,
    pub power_plan: Option<PowerPlan>,
    pub foreground_mode: ForegroundMode,
    pub background_priority: Option<Priority>,
    pub background_affinity: Option<u64>,
    pub order_preference: u32,
    pub analyze: bool,
    pub delay: Duration,
    enabled: AtomicBool,
    adjust_count: AtomicU64,
    scatter_cursor: AtomicU32,
    /// Processes with a pending exit notification.
    active: DashSet<u32>,
    /// Processes currently held at background settings.
    paused: DashSet<u32>,
    recently_modified: RecentlyModified,
}

impl Rule {
    /// Build a rule, correcting misconfiguration. Warnings are also logged.
    pub fn from_config(config: &RuleConfig, debounce: DebounceSettings) -> (Self, Vec<RuleWarning>) {
        let mut warnings = Vec::new();
        let mut enabled = config.enabled;

        let executables: Vec<String> = config
            .executables
            .iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        let path = config.path.clone().filter(|p| !p.as_os_str().is_empty());
        if executables.is_empty() && path.is_none() {
            warnings.push(RuleWarning::NoMatchCriteria);
            enabled = false;
        }

        let mut affinity_strategy = config.affinity_strategy;
        let affinity = config.affinity;
        match (affinity, affinity_strategy) {
            (None, s) if s != AffinityStrategy::None => {
                warnings.push(RuleWarning::AffinityStrategyWithoutMask);
                affinity_strategy = AffinityStrategy::None;
            }
            (Some(_), AffinityStrategy::None) => {
                warnings.push(RuleWarning::MaskWithoutStrategy);
                affinity_strategy = AffinityStrategy::Limit;
            }
            _ => {}
        }

        let priority_strategy = config.priority_strategy;
        let priority = config.priority;
        if priority.is_some() && priority_strategy == PriorityStrategy::None {
            warnings.push(RuleWarning::PriorityWithoutStrategy);
        }

        let mut background_priority = config.background_priority;
        let mut background_affinity = config.background_affinity;
        if (background_priority.is_some() || background_affinity.is_some())
            && !config.foreground_mode.covers_adjustments()
        {
            warnings.push(RuleWarning::BackgroundWithoutForegroundMode);
            background_priority = None;
            background_affinity = None;
        }
        if let (Some(bg), Some(fg)) = (background_priority, priority) {
            if bg.rank() >= fg.rank() {
                warnings.push(RuleWarning::BackgroundPriorityNotLower);
                background_priority = None;
            }
        }

        let applies_priority = priority.is_some() && priority_strategy != PriorityStrategy::None;
        let applies_affinity = affinity.is_some() && affinity_strategy != AffinityStrategy::None;
        if !applies_priority && !applies_affinity && config.power_plan.is_none() {
            warnings.push(RuleWarning::Inert);
        }

        for warning in &warnings {
            warn!(rule = %config.name, "{}", warning);
        }

        let rule = Rule {
            name: config.name.clone(),
            executables,
            path,
            ignore: config.ignore.clone(),
            priority,
            priority_strategy,
            affinity,
            affinity_strategy,
            power_plan: config.power_plan,
            foreground_mode: config.foreground_mode,
            background_priority,
            background_affinity,
            order_preference: config.order_preference,
            analyze: config.analyze,
            delay: Duration::from_millis(config.delay_ms),
            enabled: AtomicBool::new(enabled),
            adjust_count: AtomicU64::new(config.adjust_count),
            scatter_cursor: AtomicU32::new(0),
            active: DashSet::new(),
            paused: DashSet::new(),
            recently_modified: RecentlyModified::new(debounce),
        };
        (rule, warnings)
    }

    pub fn to_config(&self) -> RuleConfig {
        RuleConfig {
            name: self.name.clone(),
            executables: self.executables.clone(),
            path: self.path.clone(),
            priority: self.priority,
            priority_strategy: self.priority_strategy,
            affinity: self.affinity,
            affinity_strategy: self.affinity_strategy,
            power_plan: self.power_plan,
            foreground_mode: self.foreground_mode,
            background_priority: self.background_priority,
            background_affinity: self.background_affinity,
            order_preference: self.order_preference,
            ignore: self.ignore.clone(),
            enabled: self.is_enabled(),
            analyze: self.analyze,
            delay_ms: self.delay.as_millis() as u64,
            adjust_count: self.adjust_count(),
        }
    }

    pub fn executables(&self) -> &[String] {
        &self.executables
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_path_based(&self) -> bool {
        self.path.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn adjust_count(&self) -> u64 {
        self.adjust_count.load(Ordering::Relaxed)
    }

    pub fn is_inert(&self) -> bool {
        !self.applies_priority() && !self.applies_affinity() && self.power_plan.is_none()
    }

    fn applies_priority(&self) -> bool {
        self.priority.is_some() && self.priority_strategy != PriorityStrategy::None
    }

    fn applies_affinity(&self) -> bool {
        self.affinity.is_some() && self.affinity_strategy != AffinityStrategy::None
    }

    pub fn recently_modified(&self) -> &RecentlyModified {
        &self.recently_modified
    }

    fn name_listed(list: &[String], name: &str) -> bool {
        list.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn matches_name(&self, name: &str) -> bool {
        Self::name_listed(&self.executables, name)
    }

    /// Full match check. `path` is only consulted for path-based rules, and is
    /// resolved lazily through the closure.
    pub fn matches<'p, F>(&self, name: &str, path: F) -> bool
    where
        F: FnOnce() -> Option<&'p Path>,
    {
        let Some(prefix) = self.path.as_deref() else {
            return self.matches_name(name);
        };
        if !self.executables.is_empty() && !self.matches_name(name) {
            return false;
        }
        if Self::name_listed(&self.ignore, name) {
            return false;
        }
        path().map_or(false, |p| p.starts_with(prefix))
    }

    /// Register `pid` as pending exit notification.
    pub fn track(&self, pid: u32) -> bool {
        self.active.insert(pid)
    }

    pub fn is_tracking(&self, pid: u32) -> bool {
        self.active.contains(&pid)
    }

    pub fn tracked_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_paused(&self, pid: u32) -> bool {
        self.paused.contains(&pid)
    }

    /// Drop all per-process state held for `pid`.
    pub fn forget(&self, pid: u32) {
        self.active.remove(&pid);
        self.paused.remove(&pid);
        self.recently_modified.forget(pid);
    }

    pub fn clear_runtime(&self) {
        self.active.clear();
        self.paused.clear();
        self.recently_modified.clear();
    }

    /// Enforce this rule on `record`.
    pub fn apply(&self, record: &ProcessRecord, ctx: &RuleContext<'_>) -> ApplyOutcome {
        let pid = record.pid;
        if ctx.cancel.is_cancelled() {
            return ApplyOutcome::Cancelled;
        }
        if !ctx.control.is_alive(pid) {
            return ApplyOutcome::Exited;
        }
        if record.is_restricted() {
            return ApplyOutcome::AccessDenied;
        }

        let adjusts = !record.is_protected()
            && (self.applies_priority() || self.applies_affinity());
        let wants_power =
            self.power_plan.is_some() && (ctx.foreground || !self.foreground_mode.covers_power());
        if !adjusts && !wants_power {
            return ApplyOutcome::Finished;
        }

        let mut info = ModificationInfo::new(record, &self.name);

        if adjusts {
            let current_priority = match self.read_priority(record, ctx) {
                Ok(p) => p,
                Err(outcome) => return outcome,
            };
            let current_affinity = match self.read_affinity(record, ctx) {
                Ok(a) => a,
                Err(outcome) => return outcome,
            };
            info.old_priority = current_priority;
            info.old_affinity = current_affinity;

            let verdict = self.recently_modified.observe(
                pid,
                &record.name,
                current_priority,
                current_affinity,
                Instant::now(),
            );
            match verdict {
                DebounceVerdict::Proceed => {}
                DebounceVerdict::Ignore { held } => {
                    trace!(pid, rule = %self.name, held, "recently modified, ignoring");
                    return ApplyOutcome::Unmodified;
                }
                DebounceVerdict::FreeWill { newly_granted } => {
                    if newly_granted {
                        warn!(
                            pid,
                            name = %record.name,
                            rule = %self.name,
                            "process keeps reverting its settings; granting free will"
                        );
                        return ApplyOutcome::FreeWill;
                    }
                    return ApplyOutcome::Unmodified;
                }
            }

            if let Some(outcome) = self.write_targets(
                record,
                ctx,
                self.priority.filter(|_| self.applies_priority()),
                self.priority_strategy,
                self.affinity.filter(|_| self.applies_affinity()),
                self.affinity_strategy,
                &mut info,
            ) {
                return outcome;
            }
        }

        if wants_power && ctx.power_enabled {
            if ctx.cancel.is_cancelled() {
                return ApplyOutcome::Cancelled;
            }
            self.force_power(record, ctx, &mut info);
        }

        let wrote_priority = info.new_priority.filter(|_| !info.priority_failed);
        let wrote_affinity = info.new_affinity.filter(|_| !info.affinity_failed);
        if wrote_priority.is_some() || wrote_affinity.is_some() {
            self.recently_modified.record(
                pid,
                &record.name,
                wrote_priority,
                wrote_affinity,
                Instant::now(),
            );
        }

        if info.changed() {
            self.adjust_count.fetch_add(1, Ordering::Relaxed);
            info!(
                pid,
                name = %record.name,
                rule = %self.name,
                "adjusted: priority {:?} -> {:?}, affinity {:?} -> {:?}",
                info.old_priority,
                wrote_priority,
                info.old_affinity,
                wrote_affinity
            );
            ApplyOutcome::Modified(info)
        } else if record.is_restricted() {
            ApplyOutcome::AccessDenied
        } else {
            ApplyOutcome::Unmodified
        }
    }

    /// Process left the foreground: switch to background settings.
    pub fn pause(&self, record: &ProcessRecord, ctx: &RuleContext<'_>) -> ApplyOutcome {
        if !self.foreground_mode.is_foreground_only() {
            return ApplyOutcome::Unmodified;
        }
        if record.set_paused(true) {
            return ApplyOutcome::Unmodified;
        }
        self.paused.insert(record.pid);

        let mut info = ModificationInfo::new(record, &self.name);
        let adjusts = self.foreground_mode.covers_adjustments()
            && !record.is_protected()
            && (self.background_priority.is_some() || self.background_affinity.is_some());

        if adjusts {
            if let Some(outcome) = self.write_targets(
                record,
                ctx,
                self.background_priority,
                PriorityStrategy::Force,
                self.background_affinity,
                AffinityStrategy::Force,
                &mut info,
            ) {
                self.abandon_pause(record);
                return outcome;
            }
        }

        if self.foreground_mode.covers_power() && ctx.power_owners.remove(&record.pid).is_some() {
            ctx.power.release(record.pid);
            record.set_power_wait(false);
        }

        debug!(pid = record.pid, rule = %self.name, "paused");
        if info.changed() {
            ApplyOutcome::Modified(info)
        } else {
            ApplyOutcome::Unmodified
        }
    }

    /// Process came back to the foreground: restore the primary targets.
    pub fn resume(&self, record: &ProcessRecord, ctx: &RuleContext<'_>) -> ApplyOutcome {
        if !self.foreground_mode.is_foreground_only() {
            return ApplyOutcome::Unmodified;
        }
        if !record.set_paused(false) {
            return ApplyOutcome::Unmodified;
        }
        self.paused.remove(&record.pid);

        let mut info = ModificationInfo::new(record, &self.name);
        if self.foreground_mode.covers_adjustments() && !record.is_protected() {
            if let Some(outcome) = self.write_targets(
                record,
                ctx,
                self.priority.filter(|_| self.applies_priority()),
                self.priority_strategy,
                self.affinity.filter(|_| self.applies_affinity()),
                self.affinity_strategy,
                &mut info,
            ) {
                return outcome;
            }
        }

        if self.foreground_mode.covers_power() && ctx.power_enabled {
            self.force_power(record, ctx, &mut info);
        }

        debug!(pid = record.pid, rule = %self.name, "resumed");
        if info.changed() {
            ApplyOutcome::Modified(info)
        } else {
            ApplyOutcome::Unmodified
        }
    }

    /// Force the rule's power plan unless this pid already holds one.
    fn force_power(&self, record: &ProcessRecord, ctx: &RuleContext<'_>, info: &mut ModificationInfo) {
        let Some(plan) = self.power_plan else {
            return;
        };
        let pid = record.pid;
        if ctx.power_owners.contains(&pid) {
            trace!(pid, plan = %plan, "power plan already held");
            return;
        }
        if ctx.power.force(plan, pid) {
            ctx.power_owners.insert(pid);
            record.set_power_wait(true);
            info.power_plan = Some(plan);
        } else {
            debug!(pid, plan = %plan, "power plan force refused");
        }
    }

    fn abandon_pause(&self, record: &ProcessRecord) {
        record.set_paused(false);
        self.paused.remove(&record.pid);
    }

    fn read_priority(
        &self,
        record: &ProcessRecord,
        ctx: &RuleContext<'_>,
    ) -> Result<Option<Priority>, ApplyOutcome> {
        if !self.applies_priority() {
            return Ok(None);
        }
        ctx.control
            .priority(record.pid)
            .map(Some)
            .map_err(|e| Self::failure(record, e))
    }

    fn read_affinity(
        &self,
        record: &ProcessRecord,
        ctx: &RuleContext<'_>,
    ) -> Result<Option<u64>, ApplyOutcome> {
        if !self.applies_affinity() {
            return Ok(None);
        }
        ctx.control
            .affinity(record.pid)
            .map(Some)
            .map_err(|e| Self::failure(record, e))
    }

    fn failure(record: &ProcessRecord, error: ProcessError) -> ApplyOutcome {
        if error.is_exited() {
            trace!(pid = record.pid, "exited during adjustment");
            ApplyOutcome::Exited
        } else {
            if error.is_access_denied() {
                record.mark_restricted();
            }
            debug!(pid = record.pid, error = %error, "adjustment abandoned");
            ApplyOutcome::AccessDenied
        }
    }

    /// Write priority/affinity targets, filling `info`. Returns an outcome
    /// only when the pass has to stop (exit, denial with nothing changed,
    /// cancellation).
    #[allow(clippy::too_many_arguments)]
    fn write_targets(
        &self,
        record: &ProcessRecord,
        ctx: &RuleContext<'_>,
        priority: Option<Priority>,
        priority_strategy: PriorityStrategy,
        affinity: Option<u64>,
        affinity_strategy: AffinityStrategy,
        info: &mut ModificationInfo,
    ) -> Option<ApplyOutcome> {
        let pid = record.pid;

        if let Some(target) = priority {
            let current = match info.old_priority {
                Some(p) => p,
                None => match ctx.control.priority(pid) {
                    Ok(p) => {
                        info.old_priority = Some(p);
                        p
                    }
                    Err(e) => return Some(Self::failure(record, e)),
                },
            };
            if let Some(next) = resolve_priority(current, target, priority_strategy) {
                if ctx.cancel.is_cancelled() {
                    return Some(ApplyOutcome::Cancelled);
                }
                info.new_priority = Some(next);
                if let Err(e) = ctx.control.set_priority(pid, next) {
                    if e.is_exited() {
                        return Some(ApplyOutcome::Exited);
                    }
                    info.priority_failed = true;
                    if e.is_access_denied() {
                        record.mark_restricted();
                        debug!(pid, "priority write denied");
                        // abandon the rest of this pass
                        return (!info.changed()).then_some(ApplyOutcome::AccessDenied);
                    }
                    debug!(pid, error = %e, "priority write failed");
                }
            }
        }

        if let Some(target) = affinity {
            let current = match info.old_affinity {
                Some(a) => a,
                None => match ctx.control.affinity(pid) {
                    Ok(a) => {
                        info.old_affinity = Some(a);
                        a
                    }
                    Err(e) => return Some(Self::failure(record, e)),
                },
            };
            let cursor = if affinity_strategy == AffinityStrategy::Scatter {
                self.scatter_cursor.fetch_add(1, Ordering::Relaxed)
            } else {
                0
            };
            let all = ctx.control.all_cores();
            if let Some(mask) = resolve_affinity(current, target, affinity_strategy, all, cursor) {
                if ctx.cancel.is_cancelled() {
                    return Some(ApplyOutcome::Cancelled);
                }
                debug_assert!(
                    affinity_strategy != AffinityStrategy::Limit
                        || bit_count(mask) <= bit_count(current).max(1)
                );
                info.new_affinity = Some(mask);
                if let Err(e) = ctx.control.set_affinity(pid, mask) {
                    if e.is_exited() {
                        return Some(ApplyOutcome::Exited);
                    }
                    info.affinity_failed = true;
                    if e.is_access_denied() {
                        record.mark_restricted();
                        debug!(pid, "affinity write denied");
                        return (!info.changed()).then_some(ApplyOutcome::AccessDenied);
                    }
                    debug!(pid, error = %e, "affinity write failed");
                }
            }
        }
        None
    }
}
