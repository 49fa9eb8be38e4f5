//! Sentinel Policy
//!
//! Scheduling rules for the background sweep.

use serde::{Deserialize, Serialize};

/// Sentinel operational policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelPolicy {
    /// Seconds between sweeps
    ///
    /// **Default:** 30
    pub scan_interval_s: u64,

    /// Maximum number of shards advanced concurrently during a sweep
    ///
    /// **Default:** 10
    pub max_parallel_ops: usize,

    /// Re-plan isolated shards automatically
    ///
    /// When false, isolated shards wait for an explicit `plan` call.
    ///
    /// **Default:** true
    pub auto_replan_isolated: bool,

    /// Buffered anomaly events before senders wait
    ///
    /// **Default:** 1024
    pub anomaly_queue_capacity: usize,
}

impl Default for SentinelPolicy {
    fn default() -> Self {
        Self {
            scan_interval_s: 30,
            max_parallel_ops: 10,
            auto_replan_isolated: true,
            anomaly_queue_capacity: 1024,
        }
    }
}

impl SentinelPolicy {
    /// Policy with a custom sweep interval; other fields default
    pub fn with_interval(scan_interval_s: u64) -> Self {
        Self {
            scan_interval_s,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.scan_interval_s == 0 {
            return Err("scan_interval_s must be greater than 0".to_string());
        }

        if self.max_parallel_ops == 0 {
            return Err("max_parallel_ops must be at least 1".to_string());
        }

        if self.anomaly_queue_capacity == 0 {
            return Err("anomaly_queue_capacity must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = SentinelPolicy::default();

        assert_eq!(policy.scan_interval_s, 30);
        assert_eq!(policy.max_parallel_ops, 10);
        assert!(policy.auto_replan_isolated);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_with_interval() {
        let policy = SentinelPolicy::with_interval(5);

        assert_eq!(policy.scan_interval_s, 5);
        assert_eq!(policy.max_parallel_ops, 10);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let mut policy = SentinelPolicy::default();

        policy.scan_interval_s = 0;
        assert!(policy.validate().is_err());
        policy.scan_interval_s = 30;

        policy.max_parallel_ops = 0;
        assert!(policy.validate().is_err());
        policy.max_parallel_ops = 10;

        policy.anomaly_queue_capacity = 0;
        assert!(policy.validate().is_err());
    }
}
