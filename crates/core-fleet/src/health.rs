//! Node health classification and report sources
//!
//! Health classification is pure logic: the registry feeds it samples and
//! it decides the effective status. A node reporting itself healthy can
//! still be downgraded when its load or latency crosses the configured
//! ceilings, and a node whose last heartbeat is older than the timeout is
//! treated as unreachable.
//!
//! # Example
//!
//! ```
//! use tessera_core_fleet::health::HealthConfig;
//! use tessera_core_fleet::{HealthReport, HealthStatus};
//!
//! let config = HealthConfig::default();
//! let busy = HealthReport::healthy("node-1", 10, 5).with_load(0.99);
//! assert_eq!(config.classify(&busy), HealthStatus::Degraded);
//! ```

use crate::error::{FleetError, Result};
use crate::node::{HealthReport, HealthStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

/// Thresholds for effective node health
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds without a heartbeat before a node is considered unreachable
    pub heartbeat_timeout_secs: u64,

    /// Load ratio at or above which a self-reported healthy node is degraded
    pub degraded_load_ratio: f64,

    /// Latency ceiling; slower nodes are degraded (None = no ceiling)
    pub max_latency_ms: Option<u32>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 30,
            degraded_load_ratio: 0.95,
            max_latency_ms: None,
        }
    }
}

impl HealthConfig {
    /// Effective status for a freshly received report
    pub fn classify(&self, report: &HealthReport) -> HealthStatus {
        if report.health != HealthStatus::Healthy {
            return report.health;
        }

        // An unreadable load is treated as saturated
        if report.current_load.is_nan() || report.current_load >= self.degraded_load_ratio {
            return HealthStatus::Degraded;
        }

        match self.max_latency_ms {
            Some(ceiling) if report.latency_ms > ceiling => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }

    /// Whether a heartbeat taken at `last` has expired at `now`
    pub fn is_expired(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let timeout = Duration::seconds(self.heartbeat_timeout_secs as i64);
        now - last > timeout
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.heartbeat_timeout_secs == 0 {
            return Err("heartbeat_timeout_secs must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.degraded_load_ratio) {
            return Err("degraded_load_ratio must be within 0.0..=1.0".to_string());
        }
        Ok(())
    }
}

/// Producer of node health reports (heartbeats, metrics pulls)
#[async_trait]
pub trait NodeHealthSource: Send + Sync {
    /// Reports gathered since the previous poll
    async fn poll(&self) -> Result<Vec<HealthReport>>;
}

/// Push-mode source: nodes (or their agents) send reports into a channel
/// and the registry drains it on each refresh.
pub struct ChannelHealthSource {
    rx: Mutex<mpsc::UnboundedReceiver<HealthReport>>,
}

impl ChannelHealthSource {
    /// Create the source and the sender handed to reporters
    pub fn new() -> (mpsc::UnboundedSender<HealthReport>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl NodeHealthSource for ChannelHealthSource {
    async fn poll(&self) -> Result<Vec<HealthReport>> {
        let mut rx = self.rx.lock().await;
        let mut reports = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(report) => reports.push(report),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if reports.is_empty() {
                        return Err(FleetError::Source(
                            "all health reporters disconnected".to_string(),
                        ));
                    }
                    break;
                }
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_healthy_report_stays_healthy() {
        let config = HealthConfig::default();
        let report = HealthReport::healthy("node-1", 10, 5).with_load(0.4);
        assert_eq!(config.classify(&report), HealthStatus::Healthy);
    }

    #[test]
    fn test_reported_unreachable_wins() {
        let config = HealthConfig::default();
        let report =
            HealthReport::healthy("node-1", 10, 5).with_health(HealthStatus::Unreachable);
        assert_eq!(config.classify(&report), HealthStatus::Unreachable);
    }

    #[test]
    fn test_nan_load_is_degraded() {
        let config = HealthConfig::default();
        let report = HealthReport::healthy("node-1", 10, 5).with_load(f64::NAN);
        assert_eq!(config.classify(&report), HealthStatus::Degraded);
    }

    #[test]
    fn test_latency_ceiling() {
        let config = HealthConfig {
            max_latency_ms: Some(100),
            ..Default::default()
        };
        let slow = HealthReport::healthy("node-1", 10, 250);
        assert_eq!(config.classify(&slow), HealthStatus::Degraded);
    }

    #[test]
    fn test_heartbeat_expiry() {
        let config = HealthConfig {
            heartbeat_timeout_secs: 10,
            ..Default::default()
        };
        let now = Utc::now();
        assert!(!config.is_expired(now - Duration::seconds(5), now));
        assert!(config.is_expired(now - Duration::seconds(11), now));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = HealthConfig::default();
        assert!(config.validate().is_ok());

        config.heartbeat_timeout_secs = 0;
        assert!(config.validate().is_err());
        config.heartbeat_timeout_secs = 30;

        config.degraded_load_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_channel_source_drains() {
        let (tx, source) = ChannelHealthSource::new();
        tx.send(HealthReport::healthy("a", 1, 1)).unwrap();
        tx.send(HealthReport::healthy("b", 1, 1)).unwrap();

        let reports = source.poll().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(source.poll().await.unwrap().is_empty());

        drop(tx);
        assert!(source.poll().await.is_err());
    }
}
