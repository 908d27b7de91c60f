//! Configuration for monitoring and protection.

use bulwark_quorum::QuorumPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for partition monitoring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How often known nodes are probed (in milliseconds).
    pub probe_interval_ms: u64,
    /// How long a suspected partition must persist before it is confirmed
    /// (in milliseconds).
    pub partition_timeout_ms: u64,
    /// Timeout for a single probe (in milliseconds).
    pub probe_timeout_ms: u64,
    /// Reachable fraction below which a partition is suspected.
    pub minority_threshold: f64,
    /// Capacity of the partition event channel.
    pub event_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            partition_timeout_ms: 300_000,
            probe_timeout_ms: 5_000,
            minority_threshold: 0.5,
            event_capacity: 64,
        }
    }
}

impl MonitorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn partition_timeout(&self) -> Duration {
        Duration::from_millis(self.partition_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Builder for monitor configuration.
pub struct MonitorConfigBuilder {
    config: MonitorConfig,
}

impl MonitorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MonitorConfig::default(),
        }
    }

    pub fn probe_interval(mut self, ms: u64) -> Self {
        self.config.probe_interval_ms = ms;
        self
    }

    pub fn partition_timeout(mut self, ms: u64) -> Self {
        self.config.partition_timeout_ms = ms;
        self
    }

    pub fn probe_timeout(mut self, ms: u64) -> Self {
        self.config.probe_timeout_ms = ms;
        self
    }

    pub fn minority_threshold(mut self, fraction: f64) -> Self {
        self.config.minority_threshold = fraction;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> MonitorConfig {
        self.config
    }
}

impl Default for MonitorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the protection facade.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtectionConfig {
    pub monitor: MonitorConfig,
    pub quorum: QuorumPolicy,
    /// Reachable membership fraction below which a collective goes dormant.
    pub dormancy_threshold: f64,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            quorum: QuorumPolicy::default(),
            dormancy_threshold: 0.5,
        }
    }
}

/// Builder for protection configuration.
pub struct ProtectionConfigBuilder {
    config: ProtectionConfig,
}

impl ProtectionConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ProtectionConfig::default(),
        }
    }

    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.config.monitor = monitor;
        self
    }

    pub fn quorum(mut self, quorum: QuorumPolicy) -> Self {
        self.config.quorum = quorum;
        self
    }

    pub fn dormancy_threshold(mut self, fraction: f64) -> Self {
        self.config.dormancy_threshold = fraction;
        self
    }

    pub fn build(self) -> ProtectionConfig {
        self.config
    }
}

impl Default for ProtectionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_merkle::{ChangeType, EntityKind};

    #[test]
    fn test_monitor_defaults() {
        let config = MonitorConfig::default();

        assert_eq!(config.probe_interval(), Duration::from_secs(30));
        assert_eq!(config.partition_timeout(), Duration::from_secs(300));
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.minority_threshold, 0.5);
    }

    #[test]
    fn test_monitor_config_builder() {
        let config = MonitorConfigBuilder::new()
            .probe_interval(1000)
            .partition_timeout(10_000)
            .probe_timeout(200)
            .minority_threshold(0.34)
            .event_capacity(0)
            .build();

        assert_eq!(config.probe_interval_ms, 1000);
        assert_eq!(config.partition_timeout_ms, 10_000);
        assert_eq!(config.probe_timeout_ms, 200);
        assert_eq!(config.minority_threshold, 0.34);
        assert_eq!(config.event_capacity, 1);
    }

    #[test]
    fn test_protection_config_builder() {
        let config = ProtectionConfigBuilder::new()
            .monitor(MonitorConfigBuilder::new().probe_interval(500).build())
            .quorum(QuorumPolicy::new().with_requirement(ChangeType::StateEvolution, 0.75))
            .dormancy_threshold(0.6)
            .build();

        assert_eq!(config.monitor.probe_interval_ms, 500);
        assert_eq!(
            config
                .quorum
                .required_fraction(&ChangeType::StateEvolution, EntityKind::Individual),
            0.75
        );
        assert_eq!(config.dormancy_threshold, 0.6);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "monitor": {
                "probe_interval_ms": 1000,
                "partition_timeout_ms": 5000,
                "probe_timeout_ms": 100,
                "minority_threshold": 0.5,
                "event_capacity": 8
            },
            "quorum": {
                "requirements": {"termination": 1.0},
                "default_fraction": 0.6,
                "collective_multiplier": 1.0
            },
            "dormancy_threshold": 0.5
        }"#;
        let config: ProtectionConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.monitor.partition_timeout(), Duration::from_secs(5));
        assert_eq!(
            config
                .quorum
                .required_fraction(&ChangeType::StateEvolution, EntityKind::Collective),
            0.6
        );
    }
}
