//! Controller wire protocol.
//!
//! The controller is the cluster-wide leadership authority; brokers receive
//! two request kinds from it. A LeaderAndIsr request carries, per partition,
//! the full assignment decision (leader, epoch, ISR, metadata version). A
//! StopReplica request retires replicas, optionally deleting them. Both are
//! answered with per-partition short error codes plus a request-level code.

use crate::broker::{BrokerId, BrokerInfo};
use crate::partition::TopicPartition;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Short error codes carried in per-partition response entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum ErrorCode {
    NoError = 0,
    NotLeaderForPartition = 1,
    UnknownTopicOrPartition = 2,
    ReplicaNotAvailable = 3,
    StaleControllerEpoch = 4,
    StaleLeaderEpoch = 5,
    NotAssignedReplica = 6,
}

impl ErrorCode {
    /// Numeric wire value
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(ErrorCode::NoError),
            1 => Some(ErrorCode::NotLeaderForPartition),
            2 => Some(ErrorCode::UnknownTopicOrPartition),
            3 => Some(ErrorCode::ReplicaNotAvailable),
            4 => Some(ErrorCode::StaleControllerEpoch),
            5 => Some(ErrorCode::StaleLeaderEpoch),
            6 => Some(ErrorCode::NotAssignedReplica),
            _ => None,
        }
    }

    pub fn is_error(self) -> bool {
        self != ErrorCode::NoError
    }
}

/// Leadership decision for a single partition as persisted by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAndIsr {
    /// Broker designated leader
    pub leader: BrokerId,

    /// Epoch of this leadership decision
    pub leader_epoch: u64,

    /// In-sync replica set
    pub isr: Vec<BrokerId>,

    /// Metadata-store version of the persisted record, required for
    /// conditional updates
    pub zk_version: u64,
}

/// Per-partition payload of a LeaderAndIsr request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStateInfo {
    /// The leadership decision
    pub leader_and_isr: LeaderAndIsr,

    /// Epoch of the controller that made the decision
    pub controller_epoch: u64,

    /// Assigned replicas
    pub replicas: Vec<BrokerId>,
}

impl PartitionStateInfo {
    pub fn replication_factor(&self) -> usize {
        self.replicas.len()
    }
}

/// Controller request installing leaders and followers on a broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderAndIsrRequest {
    pub controller_id: BrokerId,
    pub controller_epoch: u64,
    pub correlation_id: u64,

    /// Assignment per partition
    pub partition_states: HashMap<TopicPartition, PartitionStateInfo>,

    /// Descriptors for every broker referenced as a leader, so new followers
    /// know where to fetch from
    pub leaders: Vec<BrokerInfo>,
}

/// Response to a LeaderAndIsr request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderAndIsrResponse {
    pub correlation_id: u64,

    /// Request-level code; per-partition entries are meaningless unless this
    /// is `NoError`
    pub error: ErrorCode,

    pub partitions: HashMap<TopicPartition, ErrorCode>,
}

/// Controller request retiring replicas from a broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopReplicaRequest {
    pub controller_id: BrokerId,
    pub controller_epoch: u64,
    pub correlation_id: u64,

    /// Also delete the partitions' local state
    pub delete_partitions: bool,

    pub partitions: HashSet<TopicPartition>,
}

/// Response to a StopReplica request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopReplicaResponse {
    pub correlation_id: u64,
    pub error: ErrorCode,
    pub partitions: HashMap<TopicPartition, ErrorCode>,
}
