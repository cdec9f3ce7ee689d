//! cirrus.toml configuration parser.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{MachineType, MachineTypeConfig, RequestOrder};

const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10 * 60 * 1000;
const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 5 * 1000;
const DEFAULT_MAX_LAUNCH_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_TERMINATION_ATTEMPTS: u32 = 3;

/// Errors raised while loading or validating a config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration: {0:?}")]
    Duration(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    /// Cluster-wide worker limit across all machine types.
    pub max_worker_nodes: Option<u32>,
    /// e.g. "60s", "5m".
    pub idle_timeout: Option<String>,
    pub max_concurrent_launches: Option<u32>,
    pub max_launch_attempts: Option<u32>,
    pub max_termination_attempts: Option<u32>,
    /// How long a launch may stay REQUESTED before it is failed.
    pub request_timeout: Option<String>,
    pub reconcile_interval: Option<String>,
    pub request_order: Option<RequestOrder>,
    #[serde(default)]
    pub machine_types: BTreeMap<MachineType, MachineTypeConfig>,
}

impl AutoscalerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate; machine-type names are taken from table keys.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: AutoscalerConfig = toml::from_str(content)?;
        for (name, machine) in config.machine_types.iter_mut() {
            machine.name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, machine) in &self.machine_types {
            if machine.min_worker_nodes > machine.max_worker_nodes {
                return Err(ConfigError::Invalid(format!(
                    "machine type {name}: min_worker_nodes {} exceeds max_worker_nodes {}",
                    machine.min_worker_nodes, machine.max_worker_nodes
                )));
            }
            if !machine.resources.values().any(|q| *q > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "machine type {name}: resources must not be empty"
                )));
            }
            if machine.resources.values().any(|q| *q < 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "machine type {name}: negative resource quantity"
                )));
            }
        }
        if let Some(max) = self.max_worker_nodes {
            let mins: u32 = self.machine_types.values().map(|m| m.min_worker_nodes).sum();
            if mins > max {
                return Err(ConfigError::Invalid(format!(
                    "sum of min_worker_nodes ({mins}) exceeds max_worker_nodes ({max})"
                )));
            }
        }
        // Fail early on malformed durations.
        self.idle_timeout_ms()?;
        self.request_timeout_ms()?;
        self.reconcile_interval_ms()?;
        Ok(())
    }

    pub fn idle_timeout_ms(&self) -> Result<u64, ConfigError> {
        optional_duration(&self.idle_timeout, DEFAULT_IDLE_TIMEOUT_MS)
    }

    pub fn request_timeout_ms(&self) -> Result<u64, ConfigError> {
        optional_duration(&self.request_timeout, DEFAULT_REQUEST_TIMEOUT_MS)
    }

    pub fn reconcile_interval_ms(&self) -> Result<u64, ConfigError> {
        optional_duration(&self.reconcile_interval, DEFAULT_RECONCILE_INTERVAL_MS)
    }

    pub fn max_launch_attempts(&self) -> u32 {
        self.max_launch_attempts.unwrap_or(DEFAULT_MAX_LAUNCH_ATTEMPTS)
    }

    pub fn max_termination_attempts(&self) -> u32 {
        self.max_termination_attempts
            .unwrap_or(DEFAULT_MAX_TERMINATION_ATTEMPTS)
    }

    /// Effective cluster-wide worker limit.
    pub fn max_worker_nodes(&self) -> u32 {
        cluster_max_worker_nodes(self.max_worker_nodes, self.machine_types.values())
    }
}

/// The explicit cluster limit, or the sum of per-type maximums without one.
pub fn cluster_max_worker_nodes<'a>(
    explicit: Option<u32>,
    machine_types: impl IntoIterator<Item = &'a MachineTypeConfig>,
) -> u32 {
    explicit.unwrap_or_else(|| {
        machine_types
            .into_iter()
            .map(|m| m.max_worker_nodes)
            .fold(0u32, u32::saturating_add)
    })
}

fn optional_duration(value: &Option<String>, default_ms: u64) -> Result<u64, ConfigError> {
    match value {
        Some(s) => parse_duration_ms(s),
        None => Ok(default_ms),
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "1h" into milliseconds.
///
/// A bare number is taken as seconds.
pub fn parse_duration_ms(s: &str) -> Result<u64, ConfigError> {
    let s = s.trim();
    let bad = || ConfigError::Duration(s.to_string());
    let (digits, factor) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60 * 1000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 60 * 60 * 1000)
    } else {
        (s, 1000)
    };
    digits
        .trim()
        .parse::<u64>()
        .map_err(|_| bad())?
        .checked_mul(factor)
        .ok_or_else(bad)
}
