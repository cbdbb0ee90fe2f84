//! Runtime configuration.
//!
//! Every section has a `Default`, so a config file only needs the keys it
//! wants to change.

use crate::policy::ExecutionMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Values that parse but make no sense
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrcaConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Persistence backend
    pub storage: StorageConfig,
    /// Lease settings
    pub lock: LockConfig,
    /// Recovery sweep settings
    pub recovery: RecoveryConfig,
    /// Router settings
    pub routing: RoutingConfig,
}

impl Default for OrcaConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            storage: StorageConfig::default(),
            lock: LockConfig::default(),
            recovery: RecoveryConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl OrcaConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break lease or scoring invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock.default_ttl_secs == 0 {
            return Err(ConfigError::Invalid("lock.default_ttl_secs must be positive".into()));
        }
        if self.lock.default_ttl_secs > self.lock.max_ttl_secs {
            return Err(ConfigError::Invalid(
                "lock.default_ttl_secs must not exceed lock.max_ttl_secs".into(),
            ));
        }
        if self.recovery.interval_secs == 0 {
            return Err(ConfigError::Invalid("recovery.interval_secs must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.recovery.alert_error_rate) {
            return Err(ConfigError::Invalid("recovery.alert_error_rate must be in [0, 1]".into()));
        }
        if self.routing.lease_ttl_secs == 0 || self.routing.lease_ttl_secs > self.lock.max_ttl_secs {
            return Err(ConfigError::Invalid(
                "routing.lease_ttl_secs must be positive and within lock.max_ttl_secs".into(),
            ));
        }
        let w = &self.routing.weights;
        if [w.required, w.preferred, w.cost, w.latency, w.load].iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ConfigError::Invalid("routing weights must be finite and non-negative".into()));
        }
        Ok(())
    }
}

/// Which storage backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local, lost on exit
    Memory,
    /// JSON files under `path`
    #[default]
    Json,
    /// SQLite database at `path` (requires the `sqlite` feature)
    Sqlite,
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind
    pub backend: StorageBackend,
    /// Directory (json) or database file (sqlite)
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Json,
            path: PathBuf::from(".orca"),
        }
    }
}

/// Lease settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL used when callers do not pass one
    pub default_ttl_secs: u64,
    /// Longest lease that may be granted
    pub max_ttl_secs: u64,
    /// A conflicting lease expiring within this horizon is worth waiting for
    pub wait_horizon_secs: u64,
    /// How many times a lost compare-and-set is re-decided
    pub cas_retries: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 60,
            max_ttl_secs: 3600,
            wait_horizon_secs: 300,
            cas_retries: 8,
        }
    }
}

impl LockConfig {
    /// `default_ttl_secs` as a duration.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// `max_ttl_secs` as a duration.
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    /// `wait_horizon_secs` as a duration.
    pub fn wait_horizon(&self) -> Duration {
        Duration::from_secs(self.wait_horizon_secs)
    }
}

/// Recovery sweep settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Seconds between sweep cycles
    pub interval_secs: u64,
    /// Execution attempts before work is escalated instead of requeued
    pub max_attempts: u32,
    /// Which risk levels may be requeued automatically
    pub execution_mode: ExecutionMode,
    /// Per-cycle error rate above which an alert is raised
    pub alert_error_rate: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_attempts: 3,
            execution_mode: ExecutionMode::FullAuto,
            alert_error_rate: 0.5,
        }
    }
}

impl RecoveryConfig {
    /// `interval_secs` as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Weights of the route scorer's dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Per satisfied mandatory capability
    pub required: f64,
    /// Per satisfied preferred capability
    pub preferred: f64,
    /// Cheaper is better
    pub cost: f64,
    /// Faster is better
    pub latency: f64,
    /// Emptier is better
    pub load: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            required: 10.0,
            preferred: 3.0,
            cost: 2.0,
            latency: 1.0,
            load: 2.0,
        }
    }
}

/// Router settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Scoring weights
    pub weights: ScoringWeights,
    /// TTL of the execution lease taken at dispatch
    pub lease_ttl_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            lease_ttl_secs: 300,
        }
    }
}

impl RoutingConfig {
    /// `lease_ttl_secs` as a duration.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}
