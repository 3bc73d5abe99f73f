//! Metadata store contract.
//!
//! The cluster keeps its authoritative leader/ISR records in a strongly
//! consistent, versioned key-value tree maintained by the controller. The
//! coordinator only needs three operations from it, all keyed by path and
//! fenced by version numbers for optimistic concurrency.

use crate::broker::BrokerId;
use crate::error::{ReplicaError, Result};
use crate::partition::TopicPartition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

/// Versioned compare-and-swap contract over the cluster metadata tree
#[async_trait]
pub trait MetadataStore: Send + Sync + fmt::Debug {
    /// Replace the payload at `path` iff its current version equals
    /// `expected_version`. Returns the new version on success and
    /// [`ReplicaError::VersionConflict`] when the precondition fails.
    async fn conditional_update(
        &self,
        path: &str,
        payload: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64>;

    /// Create `path` with `payload`. Fails with [`ReplicaError::PathExists`]
    /// if it already exists. Returns the initial version.
    async fn create(&self, path: &str, payload: Vec<u8>) -> Result<u64>;

    /// Read the payload and version at `path`.
    async fn read(&self, path: &str) -> Result<(Vec<u8>, u64)>;
}

/// The leader/ISR document persisted at a partition's state path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderIsrRecord {
    /// Leader broker id
    pub leader: BrokerId,

    /// Epoch of the leadership decision
    pub leader_epoch: u64,

    /// In-sync replica broker ids, ordered
    pub isr: Vec<BrokerId>,

    /// Epoch of the controller that authored the record
    pub controller_epoch: u64,
}

impl LeaderIsrRecord {
    /// Serialize as a JSON document (the record is meant to be
    /// operator-inspectable).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Path of a partition's leader/ISR record
pub fn leader_isr_path(tp: &TopicPartition) -> String {
    format!(
        "/brokers/topics/{}/partitions/{}/state",
        tp.topic, tp.partition
    )
}

/// In-memory metadata store for standalone and test use.
///
/// Versions start at 0 on create and increment by one per successful
/// conditional update.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    entries: RwLock<HashMap<String, (Vec<u8>, u64)>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version at `path`, if present
    pub async fn version_of(&self, path: &str) -> Option<u64> {
        self.entries.read().await.get(path).map(|(_, v)| *v)
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn conditional_update(
        &self,
        path: &str,
        payload: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(path) {
            Some((stored, version)) => {
                if *version != expected_version {
                    return Err(ReplicaError::VersionConflict {
                        path: path.to_string(),
                        expected: expected_version,
                    });
                }
                *stored = payload;
                *version += 1;
                Ok(*version)
            }
            None => Err(ReplicaError::PathNotFound(path.to_string())),
        }
    }

    async fn create(&self, path: &str, payload: Vec<u8>) -> Result<u64> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(path) {
            return Err(ReplicaError::PathExists(path.to_string()));
        }
        entries.insert(path.to_string(), (payload, 0));
        Ok(0)
    }

    async fn read(&self, path: &str) -> Result<(Vec<u8>, u64)> {
        self.entries
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| ReplicaError::PathNotFound(path.to_string()))
    }
}
