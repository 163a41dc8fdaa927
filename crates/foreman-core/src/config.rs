use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::Strategy;

/// Top-level configuration loaded from `~/.foreman/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForemanConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl ForemanConfig {
    /// Load config from `~/.foreman/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            debug!(path = %path.display(), "no config file; using defaults");
            let cfg = ForemanConfig::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: ForemanConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        info!(path = %path.display(), "configuration loaded");
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via
    /// type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        self.pipeline.validate()?;
        self.governor.validate()?;
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Orchestrator section
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently running subtasks. `None` uses the
    /// worker registry's slot count.
    #[serde(default)]
    pub max_parallelism: Option<usize>,
    #[serde(default = "default_subtask_timeout_secs")]
    pub subtask_timeout_secs: u64,
    #[serde(default = "default_park_backoff_base_ms")]
    pub park_backoff_base_ms: u64,
    #[serde(default = "default_park_backoff_cap_ms")]
    pub park_backoff_cap_ms: u64,
    /// When set, any terminally failed subtask escalates the task, even
    /// one nothing depends on.
    #[serde(default)]
    pub strict_completion: bool,
    #[serde(default = "default_max_description_bytes")]
    pub max_description_bytes: usize,
    #[serde(default = "default_max_fanout")]
    pub max_fanout: usize,
}

impl OrchestratorConfig {
    pub fn subtask_timeout(&self) -> Duration {
        Duration::from_secs(self.subtask_timeout_secs)
    }

    pub fn park_backoff_base(&self) -> Duration {
        Duration::from_millis(self.park_backoff_base_ms)
    }

    pub fn park_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.park_backoff_cap_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallelism == Some(0) {
            return Err(ConfigError::Validation(
                "orchestrator.max_parallelism must be at least 1".into(),
            ));
        }
        if self.subtask_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.subtask_timeout_secs must be at least 1".into(),
            ));
        }
        if self.park_backoff_base_ms == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.park_backoff_base_ms must be at least 1".into(),
            ));
        }
        if self.park_backoff_cap_ms < self.park_backoff_base_ms {
            return Err(ConfigError::Validation(
                "orchestrator.park_backoff_cap_ms must be >= park_backoff_base_ms".into(),
            ));
        }
        if self.max_description_bytes == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.max_description_bytes must be at least 1".into(),
            ));
        }
        if self.max_fanout < 2 {
            return Err(ConfigError::Validation(
                "orchestrator.max_fanout must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: None,
            subtask_timeout_secs: default_subtask_timeout_secs(),
            park_backoff_base_ms: default_park_backoff_base_ms(),
            park_backoff_cap_ms: default_park_backoff_cap_ms(),
            strict_completion: false,
            max_description_bytes: default_max_description_bytes(),
            max_fanout: default_max_fanout(),
        }
    }
}

fn default_subtask_timeout_secs() -> u64 {
    120
}
fn default_park_backoff_base_ms() -> u64 {
    1_000
}
fn default_park_backoff_cap_ms() -> u64 {
    30_000
}
fn default_max_description_bytes() -> usize {
    64 * 1024
}
fn default_max_fanout() -> usize {
    8
}

// ---------------------------------------------------------------------------
// Pipeline section
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Strategy escalation order. Must be non-empty with no duplicates.
    #[serde(default = "default_strategy_order")]
    pub strategy_order: Vec<Strategy>,
    /// Snapshot directory. `None` keeps pipeline state in memory only.
    #[serde(default)]
    pub state_dir: Option<String>,
}

impl PipelineConfig {
    /// Resolve the configured snapshot directory, if persistence is on.
    pub fn resolved_state_dir(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(PathBuf::from)
    }

    /// The conventional snapshot directory for hosts that want
    /// persistence without configuring a path.
    pub fn default_state_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
            .join("pipelines")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Validation(
                "pipeline.max_retries must be at least 1".into(),
            ));
        }
        if self.strategy_order.is_empty() {
            return Err(ConfigError::Validation(
                "pipeline.strategy_order must not be empty".into(),
            ));
        }
        for (i, strategy) in self.strategy_order.iter().enumerate() {
            if self.strategy_order[..i].contains(strategy) {
                return Err(ConfigError::Validation(format!(
                    "pipeline.strategy_order lists {strategy} more than once"
                )));
            }
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            strategy_order: default_strategy_order(),
            state_dir: None,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_strategy_order() -> Vec<Strategy> {
    Strategy::default_order().to_vec()
}

// ---------------------------------------------------------------------------
// Governor section
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Failures within the window that open a circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    /// How long an open circuit waits before admitting a probe.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_bucket_capacity")]
    pub bucket_capacity: f64,
    #[serde(default = "default_refill_per_minute")]
    pub refill_per_minute: f64,
}

impl GovernorConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "governor.failure_threshold must be at least 1".into(),
            ));
        }
        if self.failure_window_secs == 0 {
            return Err(ConfigError::Validation(
                "governor.failure_window_secs must be at least 1".into(),
            ));
        }
        if self.recovery_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "governor.recovery_timeout_secs must be at least 1".into(),
            ));
        }
        if !(self.bucket_capacity.is_finite() && self.bucket_capacity > 0.0) {
            return Err(ConfigError::Validation(
                "governor.bucket_capacity must be a positive number".into(),
            ));
        }
        if !(self.refill_per_minute.is_finite() && self.refill_per_minute > 0.0) {
            return Err(ConfigError::Validation(
                "governor.refill_per_minute must be a positive number".into(),
            ));
        }
        Ok(())
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            bucket_capacity: default_bucket_capacity(),
            refill_per_minute: default_refill_per_minute(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_window_secs() -> u64 {
    60
}
fn default_recovery_timeout_secs() -> u64 {
    30
}
fn default_bucket_capacity() -> f64 {
    10.0
}
fn default_refill_per_minute() -> f64 {
    10.0
}

// ---------------------------------------------------------------------------
// Telemetry section
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
