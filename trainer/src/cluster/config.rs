use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::checkpoint::CheckpointConfig;
use crate::collective::TcpRingConfig;
use crate::errors::{Result, TrainerError};

/// What a failed gradient or parameter reduction does to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionFailurePolicy {
    /// Log, count the degraded step and carry on with the local values
    #[default]
    ContinueLocal,
    /// Return the collective error
    Abort,
}

/// Cluster coordination settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Upper bound on any single collective
    pub collective_timeout_secs: u64,

    pub reduction_failure_policy: ReductionFailurePolicy,

    /// Rank `r` of a TCP ring listens on `base_port + r`
    pub base_port: u16,

    pub connect_timeout_secs: u64,

    pub checkpoint: CheckpointConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let tcp = TcpRingConfig::default();
        Self {
            collective_timeout_secs: 30,
            reduction_failure_policy: ReductionFailurePolicy::default(),
            base_port: tcp.base_port,
            connect_timeout_secs: tcp.connect_timeout.as_secs(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn collective_timeout(&self) -> Duration {
        Duration::from_secs(self.collective_timeout_secs)
    }

    pub fn tcp_ring(&self) -> TcpRingConfig {
        TcpRingConfig {
            base_port: self.base_port,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.collective_timeout_secs == 0 {
            return Err(TrainerError::Config(
                "cluster.collective_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(TrainerError::Config(
                "cluster.connect_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.base_port == 0 {
            return Err(TrainerError::Config(
                "cluster.base_port must be a fixed port".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.collective_timeout(), Duration::from_secs(30));
        assert_eq!(config.reduction_failure_policy, ReductionFailurePolicy::ContinueLocal);
        assert_eq!(config.tcp_ring().base_port, 47100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_policy_names() {
        let config: ClusterConfig =
            toml::from_str("reduction_failure_policy = \"abort\"").unwrap();
        assert_eq!(config.reduction_failure_policy, ReductionFailurePolicy::Abort);
        assert!(toml::from_str::<ClusterConfig>("reduction_failure_policy = \"retry\"").is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ClusterConfig {
            collective_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
