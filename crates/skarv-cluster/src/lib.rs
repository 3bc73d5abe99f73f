//! # Skarv Cluster
//!
//! Per-broker replication coordination for a partitioned, leader-based
//! replicated log:
//!
//! - **Leader/follower lifecycle**: partitions transition on controller
//!   decisions, fenced by controller epoch
//! - **ISR maintenance**: followers join the in-sync set as they catch up
//!   and leave it when stuck or slow, persisted through versioned
//!   compare-and-swap against the metadata store
//! - **High watermark**: the visibility boundary advances to the minimum
//!   log end offset across the ISR and is checkpointed durably per log
//!   directory
//!
//! ## Architecture
//!
//! ```text
//! controller ──► ReplicaCoordinator ──► Partition ──► Log / MetadataStore
//!                      │                    ▲
//!                      ▼                    │ position reports
//!               FetcherControl ──► fetch tasks (one per followed partition)
//! ```
//!
//! The controller, the metadata store, and the wire transport are external
//! collaborators reached only through the contracts in [`metadata`] and
//! [`fetcher`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use skarv_cluster::{BrokerConfig, InMemoryMetadataStore, ReplicaCoordinator};
//! use std::sync::Arc;
//!
//! let config = BrokerConfig::new(0).with_data_dir("/var/lib/skarv");
//! let metadata = Arc::new(InMemoryMetadataStore::new());
//! let coordinator = Arc::new(ReplicaCoordinator::new(config, metadata)?);
//! coordinator.startup();
//!
//! let response = coordinator.become_leader_or_follower(request).await;
//! ```

pub mod broker;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod metadata;
pub mod observability;
pub mod partition;
pub mod protocol;
pub mod replica;

// Re-export main types
pub use broker::{BrokerId, BrokerInfo};
pub use checkpoint::{HighWatermarkCheckpoint, CHECKPOINT_FILE_NAME};
pub use config::{BrokerConfig, ReplicationConfig};
pub use coordinator::ReplicaCoordinator;
pub use error::{ReplicaError, Result};
pub use fetcher::{
    FetchSource, FetchTarget, FetchedBatch, FetcherControl, ReplicaFetcherManager,
};
pub use metadata::{leader_isr_path, InMemoryMetadataStore, LeaderIsrRecord, MetadataStore};
pub use observability::{init_metrics, ReplicationMetrics};
pub use partition::{Partition, PartitionTable, TopicPartition};
pub use protocol::{
    ErrorCode, LeaderAndIsr, LeaderAndIsrRequest, LeaderAndIsrResponse, PartitionStateInfo,
    StopReplicaRequest, StopReplicaResponse,
};
pub use replica::Replica;

/// Re-export common types
pub mod prelude {
    pub use crate::broker::*;
    pub use crate::config::*;
    pub use crate::coordinator::*;
    pub use crate::error::*;
    pub use crate::partition::*;
    pub use crate::protocol::*;
}
