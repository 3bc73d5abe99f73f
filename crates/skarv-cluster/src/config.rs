//! Broker and replication configuration

use crate::broker::BrokerId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Replication tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Maximum time a follower may go without progress before it is dropped
    /// from the ISR. Also the period of the ISR evaluation task.
    pub replica_lag_max_time: Duration,

    /// Maximum number of messages a follower may trail the leader by before
    /// it is dropped from the ISR
    pub replica_lag_max_messages: u64,

    /// Interval between follower fetch requests
    pub fetch_interval: Duration,

    /// Maximum bytes per fetch request
    pub fetch_max_bytes: u32,

    /// Interval between high watermark checkpoints
    pub hw_checkpoint_interval: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_lag_max_time: Duration::from_secs(30),
            replica_lag_max_messages: 4000,
            fetch_interval: Duration::from_millis(100),
            fetch_max_bytes: 10 * 1024 * 1024, // 10 MB
            hw_checkpoint_interval: Duration::from_secs(5),
        }
    }
}

/// Per-broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// This broker's identifier (unique across the cluster)
    pub broker_id: BrokerId,

    /// Data directory for partition logs and the watermark checkpoint
    pub data_dir: PathBuf,

    /// Maximum log segment size in bytes
    pub max_segment_size: u64,

    /// Replication configuration
    pub replication: ReplicationConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_id: 0,
            data_dir: PathBuf::from("./data"),
            max_segment_size: 1024 * 1024 * 1024, // 1 GB
            replication: ReplicationConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn new(broker_id: BrokerId) -> Self {
        Self {
            broker_id,
            ..Default::default()
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = BrokerConfig::new(3)
            .with_data_dir("/var/lib/skarv")
            .with_max_segment_size(64 * 1024);

        assert_eq!(config.broker_id, 3);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/skarv"));
        assert_eq!(config.max_segment_size, 64 * 1024);
        assert_eq!(
            config.replication.replica_lag_max_time,
            Duration::from_secs(30)
        );
    }
}
