//! Ordered rule set
//!
//! Mutations mark the cached order dirty; the next lookup re-sorts. A sort
//! that races with a mutation is thrown away and redone.

use crate::config::RuleConfig;
use crate::rule::debounce::DebounceSettings;
use crate::rule::{Rule, RuleWarning};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::cmp::Reverse;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchlistError {
    #[error("a rule named {0:?} already exists")]
    Duplicate(String),
    #[error("no rule named {0:?}")]
    Missing(String),
}

/// Sort key: enabled first, lower preference first, busier rules first,
/// name-only rules before path rules, then by name.
type SortKey = (bool, u32, Reverse<u64>, bool, String);

fn sort_key(rule: &Arc<Rule>) -> SortKey {
    (
        !rule.is_enabled(),
        rule.order_preference,
        Reverse(rule.adjust_count()),
        rule.is_path_based(),
        rule.name.clone(),
    )
}

pub struct Watchlist {
    rules: RwLock<Vec<Arc<Rule>>>,
    sorted: ArcSwap<Vec<Arc<Rule>>>,
    dirty: AtomicBool,
    generation: AtomicU64,
    sort_token: Mutex<CancellationToken>,
    debounce: DebounceSettings,
}

impl Watchlist {
    pub fn new(debounce: DebounceSettings) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            sorted: ArcSwap::from_pointee(Vec::new()),
            dirty: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            sort_token: Mutex::new(CancellationToken::new()),
            debounce,
        }
    }

    /// Build from configuration; invalid rules are corrected, duplicates skipped.
    pub fn from_configs(
        configs: &[RuleConfig],
        debounce: DebounceSettings,
    ) -> (Self, Vec<(String, RuleWarning)>) {
        let watchlist = Self::new(debounce);
        let mut warnings = Vec::new();
        for config in configs {
            match watchlist.add_config(config) {
                Ok(rule_warnings) => {
                    warnings.extend(rule_warnings.into_iter().map(|w| (config.name.clone(), w)));
                }
                Err(e) => tracing::warn!("Skipping rule: {}", e),
            }
        }
        info!("Loaded {} rules", watchlist.len());
        (watchlist, warnings)
    }

    pub fn debounce_settings(&self) -> DebounceSettings {
        self.debounce
    }

    pub fn add_config(&self, config: &RuleConfig) -> Result<Vec<RuleWarning>, WatchlistError> {
        let (rule, warnings) = Rule::from_config(config, self.debounce);
        self.add(Arc::new(rule))?;
        Ok(warnings)
    }

    pub fn add(&self, rule: Arc<Rule>) -> Result<(), WatchlistError> {
        {
            let mut rules = self.rules.write();
            if rules.iter().any(|r| r.name == rule.name) {
                return Err(WatchlistError::Duplicate(rule.name.clone()));
            }
            rules.push(rule);
        }
        self.invalidate();
        Ok(())
    }

    /// Remove a rule; its runtime state goes with it.
    pub fn remove(&self, name: &str) -> Result<Arc<Rule>, WatchlistError> {
        let removed = {
            let mut rules = self.rules.write();
            let index = rules
                .iter()
                .position(|r| r.name == name)
                .ok_or_else(|| WatchlistError::Missing(name.to_string()))?;
            rules.remove(index)
        };
        removed.clear_runtime();
        self.invalidate();
        Ok(removed)
    }

    /// Swap in a modified rule under the same name.
    pub fn replace(&self, rule: Arc<Rule>) -> Result<Arc<Rule>, WatchlistError> {
        let old = {
            let mut rules = self.rules.write();
            let slot = rules
                .iter_mut()
                .find(|r| r.name == rule.name)
                .ok_or_else(|| WatchlistError::Missing(rule.name.clone()))?;
            std::mem::replace(slot, rule)
        };
        old.clear_runtime();
        self.invalidate();
        Ok(old)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), WatchlistError> {
        let rule = self
            .get(name)
            .ok_or_else(|| WatchlistError::Missing(name.to_string()))?;
        rule.set_enabled(enabled);
        self.invalidate();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.read().iter().find(|r| r.name == name).cloned()
    }

    /// Rules in insertion order.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.rules.read().clone()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Bumped on every membership or configuration change.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.mark_dirty();
    }

    /// Request a re-sort without counting as a configuration change, e.g.
    /// after adjust counts moved.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        let mut token = self.sort_token.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Rules in match order.
    pub fn sorted(&self) -> Arc<Vec<Arc<Rule>>> {
        loop {
            if !self.dirty.swap(false, Ordering::AcqRel) {
                return self.sorted.load_full();
            }
            let token = self.sort_token.lock().clone();
            let mut rules = self.rules.read().clone();
            rules.sort_by_cached_key(sort_key);
            if token.is_cancelled() {
                debug!("watchlist changed during sort, restarting");
                continue;
            }
            self.sorted.store(Arc::new(rules));
        }
    }

    /// First rule, in match order, that claims the process.
    pub fn find_match<'p, F>(&self, name: &str, mut path: F) -> Option<Arc<Rule>>
    where
        F: FnMut() -> Option<&'p Path>,
    {
        let sorted = self.sorted();
        sorted.iter().find(|rule| rule.matches(name, &mut path)).cloned()
    }

    pub fn configs(&self) -> Vec<RuleConfig> {
        self.rules.read().iter().map(|r| r.to_config()).collect()
    }
}
