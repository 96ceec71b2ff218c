//! Configuration management (TOML)

use crate::power::PowerPlan;
use crate::rule::strategy::{AffinityStrategy, Priority, PriorityStrategy};
use crate::rule::ForegroundMode;
use crate::rule::debounce::DebounceSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 0 disables the periodic scan.
    pub scan_interval_secs: u64,
    pub hasten_delay_secs: u64,
    pub maintenance_interval_secs: u64,
    pub min_running_age_secs: u64,
    pub push_feed: bool,
    pub push_block_secs: u64,
    pub exit_wait_timeout_secs: u64,
    pub notifications: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub ignore_window_secs: u64,
    pub free_will_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Never triaged at all.
    pub ignored_names: Vec<String>,
    /// Matched normally, but priority and affinity are left alone.
    pub protected_names: Vec<String>,
}

/// Flat description of one rule as stored in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub priority_strategy: PriorityStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<u64>,
    #[serde(default)]
    pub affinity_strategy: AffinityStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_plan: Option<PowerPlan>,
    #[serde(default)]
    pub foreground_mode: ForegroundMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_affinity: Option<u64>,
    #[serde(default = "default_order_preference")]
    pub order_preference: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub analyze: bool,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub adjust_count: u64,
}

fn default_order_preference() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl RuleConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executables: Vec::new(),
            path: None,
            priority: None,
            priority_strategy: PriorityStrategy::None,
            affinity: None,
            affinity_strategy: AffinityStrategy::None,
            power_plan: None,
            foreground_mode: ForegroundMode::Ignore,
            background_priority: None,
            background_affinity: None,
            order_preference: default_order_preference(),
            ignore: Vec::new(),
            enabled: true,
            analyze: false,
            delay_ms: 0,
            adjust_count: 0,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            scan_interval_secs: 15,
            hasten_delay_secs: 5,
            maintenance_interval_secs: 180,
            min_running_age_secs: 5,
            push_feed: true,
            push_block_secs: 5,
            exit_wait_timeout_secs: 300,
            notifications: false,
        }
    }
}

impl GeneralConfig {
    pub fn scan_interval(&self) -> Option<Duration> {
        (self.scan_interval_secs > 0).then(|| Duration::from_secs(self.scan_interval_secs))
    }

    pub fn hasten_delay(&self) -> Duration {
        Duration::from_secs(self.hasten_delay_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    pub fn min_running_age(&self) -> Duration {
        Duration::from_secs(self.min_running_age_secs)
    }

    pub fn push_block(&self) -> Duration {
        Duration::from_secs(self.push_block_secs)
    }

    pub fn exit_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_wait_timeout_secs.max(1))
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        DebounceConfig {
            ignore_window_secs: 30 * 60,
            free_will_threshold: 2,
        }
    }
}

impl DebounceConfig {
    pub fn settings(&self) -> DebounceSettings {
        DebounceSettings {
            ignore_window: Duration::from_secs(self.ignore_window_secs),
            free_will_threshold: self.free_will_threshold.max(1),
        }
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        ProtectionConfig {
            ignored_names: ["init", "systemd", "kthreadd", "taskwarden"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            protected_names: ["Xorg", "Xwayland", "gnome-shell", "kwin_wayland", "pipewire"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ProtectionConfig {
    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignored_names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn is_protected(&self, name: &str) -> bool {
        self.protected_names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: GeneralConfig::default(),
            debounce: DebounceConfig::default(),
            protection: ProtectionConfig::default(),
            rules: vec![],
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "taskwarden")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }
}
