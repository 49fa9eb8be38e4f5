/*!
 * Configuration types for Tessera
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tessera_core_fleet::HealthConfig;
use tessera_core_ledger::{ChainHasher, JsonlLedger, LedgerAdapter, MemoryLedger};

use crate::error::{Result, TesseraError};

/// Top-level configuration, loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TesseraConfig {
    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub planning: PlanningConfig,

    #[serde(default)]
    pub distribution: DistributionConfig,

    /// Heartbeat expiry and health thresholds for the node registry
    #[serde(default)]
    pub fleet: HealthConfig,

    #[serde(default)]
    pub anomaly: AnomalyConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Integrity validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Re-validations allowed after a failure before quarantine
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Verify the authentication tag through the crypto service when one is attached
    #[serde(default = "default_true")]
    pub verify_auth_tag: bool,

    /// Run hardware attestation when a verifier is attached
    #[serde(default = "default_true")]
    pub verify_attestation: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            verify_auth_tag: true,
            verify_attestation: true,
        }
    }
}

/// Composite node score weights (lower score wins)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningConfig {
    #[serde(default = "default_weight")]
    pub latency_weight: f64,

    #[serde(default = "default_weight")]
    pub load_weight: f64,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            latency_weight: default_weight(),
            load_weight: default_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    /// Consecutive failed placements before a planned shard is quarantined
    #[serde(default = "default_max_placement_attempts")]
    pub max_placement_attempts: u32,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            max_placement_attempts: default_max_placement_attempts(),
        }
    }
}

/// Anomaly thresholds and archive sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Tamper severity at or above which a shard is isolated
    #[serde(default = "default_isolation_threshold")]
    pub isolation_threshold: f64,

    /// Severity at or above which a rolling rebalance is attempted
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: f64,

    /// Processed events kept for audit (oldest dropped first)
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            isolation_threshold: default_isolation_threshold(),
            rebalance_threshold: default_rebalance_threshold(),
            archive_capacity: default_archive_capacity(),
        }
    }
}

/// Ledger backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON Lines file; None keeps the ledger in memory
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Chain entries with HMAC-SHA256 keyed by `TESSERA_LEDGER_SECRET`
    #[serde(default)]
    pub keyed: bool,
}

impl LedgerConfig {
    /// Open the configured ledger backend
    pub fn open(&self) -> Result<Arc<dyn LedgerAdapter>> {
        let hasher = if self.keyed {
            ChainHasher::hmac_from_env()?
        } else {
            ChainHasher::sha256()
        };

        Ok(match &self.path {
            Some(path) => Arc::new(JsonlLedger::open(path, hasher)?),
            None => Arc::new(MemoryLedger::with_hasher(hasher)),
        })
    }
}

/// Log output settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    1
}

fn default_weight() -> f64 {
    0.5
}

fn default_max_placement_attempts() -> u32 {
    5
}

fn default_isolation_threshold() -> f64 {
    0.8
}

fn default_rebalance_threshold() -> f64 {
    0.5
}

fn default_archive_capacity() -> usize {
    1024
}

impl TesseraConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TesseraConfig = toml::from_str(&contents)
            .map_err(|e| TesseraError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| TesseraError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;

        if self.planning.latency_weight < 0.0 || self.planning.load_weight < 0.0 {
            return Err(TesseraError::Config(
                "planning weights must not be negative".to_string(),
            ));
        }
        if self.distribution.max_placement_attempts == 0 {
            return Err(TesseraError::Config(
                "max_placement_attempts must be at least 1".to_string(),
            ));
        }
        if !unit.contains(&self.anomaly.isolation_threshold)
            || !unit.contains(&self.anomaly.rebalance_threshold)
        {
            return Err(TesseraError::Config(
                "anomaly thresholds must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.anomaly.archive_capacity == 0 {
            return Err(TesseraError::Config(
                "archive_capacity must be at least 1".to_string(),
            ));
        }
        self.fleet.validate().map_err(TesseraError::Config)?;
        Ok(())
    }
}
