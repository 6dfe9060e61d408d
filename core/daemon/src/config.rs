//! Runtime configuration for the daemon.
//!
//! Values come from `~/.agent-monitor/daemon.toml` (every key optional),
//! then from `AGENT_MONITOR_*` environment overrides.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::DaemonError;
use crate::reducer::{PermissionClassifier, DEFAULT_PERMISSION_KEYWORDS};
use crate::sweeper::StaleThresholds;

pub const MONITOR_DIR: &str = ".agent-monitor";
const CONFIG_FILE: &str = "daemon.toml";
const CONFIG_ENV: &str = "AGENT_MONITOR_CONFIG";
const SESSION_STALE_ENV: &str = "AGENT_MONITOR_SESSION_STALE_SECS";
const AGENT_STALE_ENV: &str = "AGENT_MONITOR_AGENT_STALE_SECS";
const AGENT_REMOVE_ENV: &str = "AGENT_MONITOR_AGENT_REMOVE_SECS";
const SWEEP_INTERVAL_ENV: &str = "AGENT_MONITOR_SWEEP_INTERVAL_SECS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub session_stale_secs: u64,
    pub agent_stale_secs: u64,
    pub agent_remove_secs: u64,
    pub sweep_interval_secs: u64,
    pub event_log_retention_hours: u64,
    pub permission_keywords: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            session_stale_secs: 30,
            agent_stale_secs: 120,
            agent_remove_secs: 15,
            sweep_interval_secs: 5,
            event_log_retention_hours: 24,
            permission_keywords: DEFAULT_PERMISSION_KEYWORDS
                .iter()
                .map(|keyword| keyword.to_string())
                .collect(),
        }
    }
}

impl MonitorConfig {
    pub fn thresholds(&self) -> StaleThresholds {
        StaleThresholds {
            session_stale: chrono::Duration::seconds(clamp_secs(self.session_stale_secs)),
            agent_stale: chrono::Duration::seconds(clamp_secs(self.agent_stale_secs)),
            agent_remove: chrono::Duration::seconds(clamp_secs(self.agent_remove_secs)),
            tombstone_ttl: chrono::Duration::hours(self.retention_hours()),
        }
    }

    pub fn retention_hours(&self) -> i64 {
        clamp_secs(self.event_log_retention_hours)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn classifier(&self) -> PermissionClassifier {
        PermissionClassifier::new(&self.permission_keywords)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let overrides: [(&str, &mut u64); 4] = [
            (SESSION_STALE_ENV, &mut self.session_stale_secs),
            (AGENT_STALE_ENV, &mut self.agent_stale_secs),
            (AGENT_REMOVE_ENV, &mut self.agent_remove_secs),
            (SWEEP_INTERVAL_ENV, &mut self.sweep_interval_secs),
        ];
        for (key, slot) in overrides {
            let Some(raw) = lookup(key) else { continue };
            match raw.trim().parse::<u64>() {
                Ok(value) => *slot = value,
                Err(err) => {
                    tracing::warn!(key, value = %raw, error = %err, "Ignoring invalid override");
                }
            }
        }
    }
}

// Keeps chrono durations far away from their overflow panics.
const MAX_THRESHOLD: u64 = 10 * 365 * 24 * 60 * 60;

fn clamp_secs(value: u64) -> i64 {
    value.min(MAX_THRESHOLD) as i64
}

pub fn monitor_home() -> Result<PathBuf, DaemonError> {
    let home = dirs::home_dir().ok_or(DaemonError::HomeNotFound)?;
    Ok(home.join(MONITOR_DIR))
}

pub fn default_config_path() -> Result<PathBuf, DaemonError> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(monitor_home()?.join(CONFIG_FILE))
}

/// Loads the config file (defaults when absent) and applies env overrides.
pub fn load_config(path: Option<PathBuf>) -> Result<MonitorConfig, DaemonError> {
    let mut config = load_config_file(path)?;
    config.apply_overrides(|key| env::var(key).ok());
    Ok(config)
}

fn load_config_file(path: Option<PathBuf>) -> Result<MonitorConfig, DaemonError> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(MonitorConfig::default());
    }

    let content =
        fs_err::read_to_string(&config_path).map_err(|source| DaemonError::ConfigRead {
            path: config_path.clone(),
            source,
        })?;
    toml::from_str::<MonitorConfig>(&content).map_err(|err| DaemonError::ConfigMalformed {
        path: config_path,
        details: err.to_string(),
    })
}
