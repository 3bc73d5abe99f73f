//! Per-partition replication state machine.
//!
//! A [`Partition`] is this broker's view of one hosted topic-partition: its
//! assigned replicas, the in-sync subset, the current leadership decision,
//! and, when this broker leads, the high watermark. All mutation happens
//! under one per-partition lock. The lock spans the metadata-store
//! compare-and-swap in `update_isr`: interleaved ISR shrinks and expansions
//! must not observe each other's half-applied state.
//!
//! Leadership transitions are driven exclusively by the coordinator after it
//! has applied the controller-epoch fence; nothing here calls back up into
//! the coordinator.

use crate::broker::BrokerId;
use crate::checkpoint::HighWatermarkCheckpoint;
use crate::error::{ReplicaError, Result};
use crate::metadata::{leader_isr_path, LeaderIsrRecord, MetadataStore};
use crate::observability::ReplicationMetrics;
use crate::protocol::{ErrorCode, PartitionStateInfo};
use crate::replica::Replica;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use skarv_core::{Log, LogAppendInfo, LogManager, Message};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Unique partition identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// The coordinator's global partition index
pub type PartitionTable = DashMap<TopicPartition, Arc<Partition>>;

#[derive(Debug, Default)]
struct PartitionInner {
    controller_epoch: u64,
    /// `None` until the first accepted leadership decision
    leader_epoch: Option<u64>,
    zk_version: u64,
    leader_replica_id: Option<BrokerId>,
    assigned: HashMap<BrokerId, Replica>,
    isr: HashSet<BrokerId>,
}

/// This broker's state for one hosted topic-partition
#[derive(Debug)]
pub struct Partition {
    topic_partition: TopicPartition,
    local_broker_id: BrokerId,
    log_manager: Arc<LogManager>,
    metadata: Arc<dyn MetadataStore>,
    checkpoint: Arc<HighWatermarkCheckpoint>,
    inner: Mutex<PartitionInner>,
}

impl Partition {
    pub fn new(
        topic_partition: TopicPartition,
        local_broker_id: BrokerId,
        log_manager: Arc<LogManager>,
        metadata: Arc<dyn MetadataStore>,
        checkpoint: Arc<HighWatermarkCheckpoint>,
    ) -> Self {
        Self {
            topic_partition,
            local_broker_id,
            log_manager,
            metadata,
            checkpoint,
            inner: Mutex::new(PartitionInner::default()),
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// Transition this partition to leader.
    pub async fn make_leader(
        &self,
        controller_id: BrokerId,
        state: &PartitionStateInfo,
        correlation_id: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.controller_epoch = state.controller_epoch;

        self.reconcile_assigned_replicas(&mut inner, &state.replicas)?;

        // Remote offsets reported under the previous epoch are no longer
        // authoritative.
        for replica in inner.assigned.values_mut() {
            if !replica.is_local() {
                replica.reset_log_end_offset();
            }
        }

        inner.isr = state.leader_and_isr.isr.iter().copied().collect();
        inner.leader_epoch = Some(state.leader_and_isr.leader_epoch);
        inner.zk_version = state.leader_and_isr.zk_version;
        inner.leader_replica_id = Some(self.local_broker_id);

        info!(
            partition = %self.topic_partition,
            controller = controller_id,
            correlation_id,
            epoch = state.leader_and_isr.leader_epoch,
            isr = ?state.leader_and_isr.isr,
            "became partition leader"
        );

        // The ISR may now be just this broker, in which case the watermark
        // advances straight to the local log end offset.
        self.maybe_increment_leader_hw(&mut inner);
        Ok(())
    }

    /// Transition this partition to follower. Does not touch the log:
    /// truncation is the coordinator's job and must happen only once the
    /// fetchers are stopped.
    pub async fn make_follower(
        &self,
        controller_id: BrokerId,
        state: &PartitionStateInfo,
        leaders: &[crate::broker::BrokerInfo],
        correlation_id: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.controller_epoch = state.controller_epoch;

        let new_leader = state.leader_and_isr.leader;
        if !leaders.iter().any(|b| b.id == new_leader) {
            error!(
                partition = %self.topic_partition,
                controller = controller_id,
                correlation_id,
                leader = new_leader,
                "state change failed: designated leader missing from the live broker set"
            );
            return Err(ReplicaError::LeaderNotAvailable {
                partition: self.topic_partition.clone(),
                leader: new_leader,
            });
        }

        self.reconcile_assigned_replicas(&mut inner, &state.replicas)?;

        // Only the leader maintains ISR membership.
        inner.isr.clear();
        inner.leader_epoch = Some(state.leader_and_isr.leader_epoch);
        inner.zk_version = state.leader_and_isr.zk_version;
        inner.leader_replica_id = Some(new_leader);

        info!(
            partition = %self.topic_partition,
            controller = controller_id,
            correlation_id,
            epoch = state.leader_and_isr.leader_epoch,
            leader = new_leader,
            "became partition follower"
        );
        Ok(())
    }

    /// Record a follower's log end offset, expanding the ISR if the follower
    /// has caught up to the watermark. Leader-only.
    pub async fn record_follower_position(&self, broker_id: BrokerId, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if !inner.assigned.contains_key(&broker_id) {
            return Err(ReplicaError::NotAssignedReplica {
                partition: self.topic_partition.clone(),
                broker: broker_id,
            });
        }
        if inner.leader_replica_id != Some(self.local_broker_id) {
            return Err(ReplicaError::NotLeaderForPartition(
                self.topic_partition.clone(),
            ));
        }

        // Reports may arrive reordered; the follower's offset is monotonic,
        // so applying each unconditionally is safe. A stale one merely
        // fails to move the watermark.
        let replica = inner.assigned.get_mut(&broker_id).expect("checked above");
        replica.update_log_end_offset(offset);
        debug!(
            partition = %self.topic_partition,
            follower = broker_id,
            offset,
            "recorded follower position"
        );

        if !inner.isr.contains(&broker_id) {
            let leader_hw = self.local_high_watermark(&inner);
            if offset >= leader_hw {
                let mut new_isr = inner.isr.clone();
                new_isr.insert(broker_id);
                info!(
                    partition = %self.topic_partition,
                    follower = broker_id,
                    isr = ?new_isr,
                    "follower caught up, expanding ISR"
                );
                if self.update_isr(&mut inner, new_isr).await? {
                    ReplicationMetrics::increment_isr_expands();
                }
            }
        }

        self.maybe_increment_leader_hw(&mut inner);
        Ok(())
    }

    /// Drop followers that are stuck or slow from the ISR. Called
    /// periodically by the coordinator on partitions this broker leads.
    pub async fn maybe_shrink_isr(
        &self,
        max_lag_time: Duration,
        max_lag_messages: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.leader_replica_id != Some(self.local_broker_id) {
            return Ok(());
        }

        let leader_leo = self.local_log_end_offset_locked(&inner);
        let now = Instant::now();

        let out_of_sync: HashSet<BrokerId> = inner
            .isr
            .iter()
            .copied()
            .filter(|id| *id != self.local_broker_id)
            .filter(|id| {
                let Some(replica) = inner.assigned.get(id) else {
                    return false;
                };
                let leo = replica.log_end_offset();

                // Stuck: behind the leader and silent past the lag window.
                let stuck = leo.map_or(true, |leo| leo < leader_leo)
                    && replica
                        .log_end_offset_updated_at()
                        .map_or(false, |at| now.duration_since(at) > max_lag_time);

                // Slow: reporting, but trailing by too many messages.
                let slow = leo
                    .is_some_and(|leo| leader_leo.saturating_sub(leo) > max_lag_messages);

                stuck || slow
            })
            .collect();

        if out_of_sync.is_empty() {
            return Ok(());
        }

        let new_isr: HashSet<BrokerId> = inner.isr.difference(&out_of_sync).copied().collect();
        assert!(
            !new_isr.is_empty(),
            "ISR shrink would empty the ISR of {}",
            self.topic_partition
        );

        warn!(
            partition = %self.topic_partition,
            out_of_sync = ?out_of_sync,
            isr = ?new_isr,
            "shrinking ISR"
        );
        if self.update_isr(&mut inner, new_isr).await? {
            ReplicationMetrics::increment_isr_shrinks();
            // A smaller ISR may unblock the watermark immediately.
            self.maybe_increment_leader_hw(&mut inner);
        }
        Ok(())
    }

    /// Decide whether a produce request with the given ack requirement is
    /// satisfied at `required_offset`.
    pub async fn check_enough_replicas_reach_offset(
        &self,
        required_offset: u64,
        required_acks: i16,
    ) -> (bool, ErrorCode) {
        let inner = self.inner.lock().await;
        if inner.leader_replica_id != Some(self.local_broker_id) {
            return (false, ErrorCode::NotLeaderForPartition);
        }

        let num_acks = inner
            .isr
            .iter()
            .filter(|id| {
                **id == self.local_broker_id
                    || inner
                        .assigned
                        .get(*id)
                        .and_then(|r| r.log_end_offset())
                        .is_some_and(|leo| leo >= required_offset)
            })
            .count();

        let satisfied = if required_acks < 0 {
            num_acks >= inner.isr.len()
        } else if required_acks > 0 {
            num_acks >= required_acks as usize
        } else {
            true
        };
        (satisfied, ErrorCode::NoError)
    }

    /// Append a producer batch to the local log. Leader-only.
    pub async fn append_to_leader(&self, messages: Vec<Message>) -> Result<LogAppendInfo> {
        let mut inner = self.inner.lock().await;
        if inner.leader_replica_id != Some(self.local_broker_id) {
            return Err(ReplicaError::NotLeaderForPartition(
                self.topic_partition.clone(),
            ));
        }

        let log = self
            .local_replica(&inner)
            .and_then(|r| r.log())
            .cloned()
            .ok_or_else(|| ReplicaError::ReplicaNotAvailable(self.topic_partition.clone()))?;

        let info = log.append(messages)?;
        self.maybe_increment_leader_hw(&mut inner);

        debug!(
            partition = %self.topic_partition,
            first = info.first_offset,
            last = info.last_offset,
            "appended to leader log"
        );
        Ok(info)
    }

    /// Learn the leader's high watermark from a fetch response. Follower
    /// side: the local watermark is the leader's, clamped to what this
    /// replica has actually written.
    pub async fn record_leader_high_watermark(&self, leader_hw: u64) {
        let mut inner = self.inner.lock().await;
        if inner.leader_replica_id == Some(self.local_broker_id) {
            return;
        }
        let Some(replica) = inner.assigned.get_mut(&self.local_broker_id) else {
            return;
        };
        let leo = replica.log_end_offset().unwrap_or(0);
        let new_hw = leader_hw.min(leo);
        if replica.high_watermark().is_some_and(|current| new_hw > current) {
            replica.set_high_watermark(new_hw);
        }
    }

    /// Discard the local log's suffix past the high watermark and return the
    /// new log end offset. Creates the local replica (opening the log) if it
    /// does not exist yet. Callers must have stopped the partition's fetcher
    /// first.
    pub async fn truncate_to_high_watermark(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        self.get_or_create_replica(&mut inner, self.local_broker_id)?;

        let replica = self
            .local_replica(&inner)
            .ok_or_else(|| ReplicaError::ReplicaNotAvailable(self.topic_partition.clone()))?;
        let hw = replica.high_watermark().unwrap_or(0);
        let log = replica
            .log()
            .cloned()
            .ok_or_else(|| ReplicaError::ReplicaNotAvailable(self.topic_partition.clone()))?;

        let leo = log.log_end_offset();
        if leo > hw {
            warn!(
                partition = %self.topic_partition,
                log_end_offset = leo,
                high_watermark = hw,
                "discarding uncommitted log suffix; the new leader's log may diverge from it"
            );
        }
        log.truncate_to(hw)?;
        Ok(hw)
    }

    // ==================== Accessors ====================

    pub async fn is_leader(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.leader_replica_id == Some(self.local_broker_id)
    }

    pub async fn leader_epoch(&self) -> Option<u64> {
        self.inner.lock().await.leader_epoch
    }

    pub async fn in_sync_replicas(&self) -> HashSet<BrokerId> {
        self.inner.lock().await.isr.clone()
    }

    pub async fn assigned_broker_ids(&self) -> HashSet<BrokerId> {
        self.inner.lock().await.assigned.keys().copied().collect()
    }

    /// The local replica's high watermark, if this broker hosts one with an
    /// open log.
    pub async fn high_watermark(&self) -> Option<u64> {
        let inner = self.inner.lock().await;
        self.local_replica(&inner).and_then(|r| r.high_watermark())
    }

    /// The local replica's log end offset, if its log is open.
    pub async fn local_log_end_offset(&self) -> Option<u64> {
        let inner = self.inner.lock().await;
        self.local_replica(&inner).and_then(|r| r.log_end_offset())
    }

    // ==================== Internal ====================

    /// Create missing replicas for `replicas` and drop ones no longer
    /// assigned.
    fn reconcile_assigned_replicas(
        &self,
        inner: &mut PartitionInner,
        replicas: &[BrokerId],
    ) -> Result<()> {
        for &broker_id in replicas {
            self.get_or_create_replica(inner, broker_id)?;
        }
        let assigned: HashSet<BrokerId> = replicas.iter().copied().collect();
        inner.assigned.retain(|id, _| assigned.contains(id));
        Ok(())
    }

    /// If absent, construct the replica. For the local broker this opens the
    /// log (creating it if needed) and recovers the high watermark from the
    /// checkpoint, clamped to the log end offset: a checkpoint may outlive
    /// log tail lost in a crash, and the watermark must never point past
    /// what the log actually holds.
    fn get_or_create_replica(&self, inner: &mut PartitionInner, broker_id: BrokerId) -> Result<()> {
        if inner.assigned.contains_key(&broker_id) {
            return Ok(());
        }

        let replica = if broker_id == self.local_broker_id {
            let log = self
                .log_manager
                .get_or_create(&self.topic_partition.topic, self.topic_partition.partition)?;
            let checkpointed = self
                .checkpoint
                .read()?
                .get(&self.topic_partition)
                .copied()
                .unwrap_or(0);
            let hw = checkpointed.min(log.log_end_offset());
            debug!(
                partition = %self.topic_partition,
                checkpointed,
                high_watermark = hw,
                "opened local replica"
            );
            Replica::local(broker_id, log, hw)
        } else {
            Replica::remote(broker_id)
        };
        inner.assigned.insert(broker_id, replica);
        Ok(())
    }

    fn local_replica<'a>(&self, inner: &'a PartitionInner) -> Option<&'a Replica> {
        inner.assigned.get(&self.local_broker_id)
    }

    fn local_high_watermark(&self, inner: &PartitionInner) -> u64 {
        self.local_replica(inner)
            .and_then(|r| r.high_watermark())
            .unwrap_or(0)
    }

    fn local_log_end_offset_locked(&self, inner: &PartitionInner) -> u64 {
        self.local_replica(inner)
            .and_then(|r| r.log_end_offset())
            .unwrap_or(0)
    }

    /// Advance the leader's high watermark to the minimum log end offset
    /// across the ISR. Never decreases. A member whose offset is unknown
    /// (freshly reset after a leadership change) pins the watermark until it
    /// reports.
    fn maybe_increment_leader_hw(&self, inner: &mut PartitionInner) {
        let mut candidate: Option<u64> = None;
        for id in &inner.isr {
            let leo = match inner.assigned.get(id).and_then(|r| r.log_end_offset()) {
                Some(leo) => leo,
                None => return,
            };
            candidate = Some(candidate.map_or(leo, |c| c.min(leo)));
        }
        let Some(candidate) = candidate else { return };

        let current = self.local_high_watermark(inner);
        if candidate > current {
            if let Some(replica) = inner.assigned.get_mut(&self.local_broker_id) {
                replica.set_high_watermark(candidate);
                debug!(
                    partition = %self.topic_partition,
                    from = current,
                    to = candidate,
                    "advanced high watermark"
                );
            }
        }
    }

    /// Persist `new_isr` through a conditional update keyed on the cached
    /// metadata version. On success the local ISR and version follow; on a
    /// version conflict nothing changes locally and no retry happens here.
    /// The next shrink tick or position report re-evaluates against
    /// whatever the controller wrote.
    async fn update_isr(
        &self,
        inner: &mut PartitionInner,
        new_isr: HashSet<BrokerId>,
    ) -> Result<bool> {
        let path = leader_isr_path(&self.topic_partition);
        let mut isr: Vec<BrokerId> = new_isr.iter().copied().collect();
        isr.sort_unstable();

        let record = LeaderIsrRecord {
            leader: self.local_broker_id,
            leader_epoch: inner.leader_epoch.unwrap_or(0),
            isr,
            controller_epoch: inner.controller_epoch,
        };

        match self
            .metadata
            .conditional_update(&path, record.to_bytes()?, inner.zk_version)
            .await
        {
            Ok(new_version) => {
                inner.zk_version = new_version;
                inner.isr = new_isr;
                Ok(true)
            }
            Err(ReplicaError::VersionConflict { .. }) => {
                warn!(
                    partition = %self.topic_partition,
                    cached_version = inner.zk_version,
                    "cached metadata version is stale, leaving ISR for the controller to reconcile"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
