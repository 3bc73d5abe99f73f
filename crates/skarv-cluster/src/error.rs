//! Replication error types

use crate::broker::BrokerId;
use crate::partition::TopicPartition;
use crate::protocol::ErrorCode;
use thiserror::Error;

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Replication errors
#[derive(Debug, Error)]
pub enum ReplicaError {
    // ==================== Controller Errors ====================
    #[error("stale controller epoch: received {received}, current {current}")]
    StaleControllerEpoch { received: u64, current: u64 },

    #[error("stale leader epoch for {partition}: received {received}, current {current}")]
    StaleLeaderEpoch {
        partition: TopicPartition,
        received: u64,
        current: u64,
    },

    // ==================== Partition Errors ====================
    #[error("unknown topic or partition: {0}")]
    UnknownTopicOrPartition(TopicPartition),

    #[error("not leader for partition {0}")]
    NotLeaderForPartition(TopicPartition),

    #[error("broker {broker} is not an assigned replica of {partition}")]
    NotAssignedReplica {
        partition: TopicPartition,
        broker: BrokerId,
    },

    #[error("local replica of {0} not available")]
    ReplicaNotAvailable(TopicPartition),

    #[error("designated leader {leader} for {partition} not among the live brokers")]
    LeaderNotAvailable {
        partition: TopicPartition,
        leader: BrokerId,
    },

    // ==================== Metadata Store Errors ====================
    #[error("metadata version conflict at {path}: expected {expected}")]
    VersionConflict { path: String, expected: u64 },

    #[error("metadata path already exists: {0}")]
    PathExists(String),

    #[error("metadata path not found: {0}")]
    PathNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // ==================== Storage Errors ====================
    #[error("storage error: {0}")]
    Storage(#[from] skarv_core::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint file {path}: {reason}")]
    CorruptCheckpoint { path: String, reason: String },

    // ==================== Lifecycle Errors ====================
    #[error("shutdown in progress")]
    ShuttingDown,

    #[error("channel closed")]
    ChannelClosed,
}

impl ReplicaError {
    /// Check if a later attempt may succeed without intervention
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ReplicaError::VersionConflict { .. }
                | ReplicaError::ReplicaNotAvailable(_)
                | ReplicaError::LeaderNotAvailable { .. }
                | ReplicaError::ChannelClosed
        )
    }

    /// Check if this error must halt the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplicaError::Io(_) | ReplicaError::CorruptCheckpoint { .. }
        )
    }

    /// The short code reported for this error in a per-partition response
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ReplicaError::StaleControllerEpoch { .. } => ErrorCode::StaleControllerEpoch,
            ReplicaError::StaleLeaderEpoch { .. } => ErrorCode::StaleLeaderEpoch,
            ReplicaError::UnknownTopicOrPartition(_) => ErrorCode::UnknownTopicOrPartition,
            ReplicaError::NotLeaderForPartition(_) => ErrorCode::NotLeaderForPartition,
            ReplicaError::NotAssignedReplica { .. } => ErrorCode::NotAssignedReplica,
            _ => ErrorCode::ReplicaNotAvailable,
        }
    }
}

impl From<serde_json::Error> for ReplicaError {
    fn from(e: serde_json::Error) -> Self {
        ReplicaError::Serialization(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ReplicaError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ReplicaError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        assert!(ReplicaError::VersionConflict {
            path: "/p".into(),
            expected: 3
        }
        .is_retriable());
        assert!(!ReplicaError::NotLeaderForPartition(TopicPartition::new("t", 0)).is_retriable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ReplicaError::CorruptCheckpoint {
            path: "/x".into(),
            reason: "bad count".into()
        }
        .is_fatal());
        assert!(!ReplicaError::ChannelClosed.is_fatal());
    }

    #[test]
    fn test_error_codes() {
        let tp = TopicPartition::new("t", 0);
        assert_eq!(
            ReplicaError::NotLeaderForPartition(tp.clone()).error_code(),
            ErrorCode::NotLeaderForPartition
        );
        assert_eq!(
            ReplicaError::NotAssignedReplica {
                partition: tp,
                broker: 7
            }
            .error_code(),
            ErrorCode::NotAssignedReplica
        );
        assert_eq!(
            ReplicaError::ChannelClosed.error_code(),
            ErrorCode::ReplicaNotAvailable
        );
    }
}
