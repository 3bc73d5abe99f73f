//! Per-broker replication coordinator.
//!
//! One instance per broker. It owns the partition table, accepts leadership
//! assignments from the controller (fenced by controller epoch), drives each
//! hosted partition through its leader/follower lifecycle, choreographs the
//! fetch subsystem around those transitions, and periodically evaluates ISR
//! membership and checkpoints high watermarks.
//!
//! Locking: `state_change_lock` is held for the whole of one controller
//! request and orders them; per-partition locks are taken underneath it.
//! The leader-partition set has its own short lock and is never held while
//! any other lock is taken.

use crate::broker::BrokerId;
use crate::checkpoint::HighWatermarkCheckpoint;
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::fetcher::{FetchTarget, FetcherControl};
use crate::metadata::MetadataStore;
use crate::observability::ReplicationMetrics;
use crate::partition::{Partition, PartitionTable, TopicPartition};
use crate::protocol::{
    ErrorCode, LeaderAndIsrRequest, LeaderAndIsrResponse, PartitionStateInfo, StopReplicaRequest,
    StopReplicaResponse,
};
use skarv_core::LogManager;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-broker replication coordinator
pub struct ReplicaCoordinator {
    config: BrokerConfig,
    log_manager: Arc<LogManager>,
    metadata: Arc<dyn MetadataStore>,
    checkpoint: Arc<HighWatermarkCheckpoint>,

    /// Every partition this broker has been told about
    partitions: Arc<PartitionTable>,

    /// Partitions this broker currently leads
    leader_partitions: Arc<parking_lot::Mutex<HashSet<TopicPartition>>>,

    /// Fetch subsystem, wired in after construction. Absent in
    /// standalone/test setups, where fetcher choreography is skipped.
    fetchers: parking_lot::RwLock<Option<Arc<dyn FetcherControl>>>,

    /// Serializes controller requests end-to-end
    state_change_lock: Mutex<()>,

    /// Highest controller epoch observed; reads and writes happen under
    /// `state_change_lock`
    controller_epoch: AtomicU64,

    hw_checkpoint_started: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicaCoordinator {
    /// Create a coordinator over the broker's data directory.
    pub fn new(config: BrokerConfig, metadata: Arc<dyn MetadataStore>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let log_manager = Arc::new(LogManager::new(&config.data_dir, config.max_segment_size));
        let checkpoint = Arc::new(HighWatermarkCheckpoint::new(&config.data_dir));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            log_manager,
            metadata,
            checkpoint,
            partitions: Arc::new(PartitionTable::new()),
            leader_partitions: Arc::new(parking_lot::Mutex::new(HashSet::new())),
            fetchers: parking_lot::RwLock::new(None),
            state_change_lock: Mutex::new(()),
            controller_epoch: AtomicU64::new(0),
            hw_checkpoint_started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn broker_id(&self) -> BrokerId {
        self.config.broker_id
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log_manager
    }

    /// The global partition index, shared with the fetch subsystem.
    pub fn partitions(&self) -> Arc<PartitionTable> {
        self.partitions.clone()
    }

    pub fn partition(&self, tp: &TopicPartition) -> Option<Arc<Partition>> {
        self.partitions.get(tp).map(|entry| entry.value().clone())
    }

    /// Highest controller epoch accepted so far
    pub fn controller_epoch(&self) -> u64 {
        self.controller_epoch.load(Ordering::SeqCst)
    }

    pub fn leader_partition_count(&self) -> usize {
        self.leader_partitions.lock().len()
    }

    /// Wire the fetch subsystem in. Called once during broker startup,
    /// after both the coordinator and the fetcher manager exist.
    pub fn set_fetcher(&self, fetchers: Arc<dyn FetcherControl>) {
        *self.fetchers.write() = Some(fetchers);
    }

    fn fetchers(&self) -> Option<Arc<dyn FetcherControl>> {
        self.fetchers.read().clone()
    }

    /// Start background work: the periodic ISR evaluation task. The high
    /// watermark checkpoint task starts with the first accepted controller
    /// request instead, once there is something to checkpoint.
    pub fn startup(&self) {
        let partitions = self.partitions.clone();
        let leader_partitions = self.leader_partitions.clone();
        let lag_time = self.config.replication.replica_lag_max_time;
        let lag_messages = self.config.replication.replica_lag_max_messages;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(lag_time);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        evaluate_isr(&partitions, &leader_partitions, lag_time, lag_messages)
                            .await;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);

        info!(
            broker = self.config.broker_id,
            data_dir = %self.config.data_dir.display(),
            "replica coordinator started"
        );
    }

    /// Apply a LeaderAndIsr request from the controller.
    ///
    /// Every partition named in the request gets a response slot: failures
    /// are recorded per partition and the batch continues, so the controller
    /// can resend selectively.
    pub async fn become_leader_or_follower(&self, req: LeaderAndIsrRequest) -> LeaderAndIsrResponse {
        let _guard = self.state_change_lock.lock().await;
        let started = Instant::now();

        info!(
            broker = self.config.broker_id,
            controller = req.controller_id,
            controller_epoch = req.controller_epoch,
            correlation_id = req.correlation_id,
            partitions = req.partition_states.len(),
            "handling leader and ISR request"
        );

        if let Err(code) = self.fence_controller_epoch(req.controller_epoch) {
            return LeaderAndIsrResponse {
                correlation_id: req.correlation_id,
                error: code,
                partitions: HashMap::new(),
            };
        }

        let mut codes: HashMap<TopicPartition, ErrorCode> = HashMap::new();
        let mut to_leader: Vec<(TopicPartition, PartitionStateInfo)> = Vec::new();
        let mut to_follower: Vec<(TopicPartition, PartitionStateInfo)> = Vec::new();

        for (tp, state) in &req.partition_states {
            let partition = self.get_or_create_partition(tp);
            let current_epoch = partition.leader_epoch().await;
            if current_epoch.is_some_and(|epoch| epoch >= state.leader_and_isr.leader_epoch) {
                warn!(
                    partition = %tp,
                    current_epoch = current_epoch.unwrap_or(0),
                    received_epoch = state.leader_and_isr.leader_epoch,
                    "ignoring leadership decision with stale leader epoch"
                );
                codes.insert(tp.clone(), ErrorCode::StaleLeaderEpoch);
                continue;
            }

            if state.leader_and_isr.leader == self.config.broker_id {
                to_leader.push((tp.clone(), state.clone()));
            } else {
                to_follower.push((tp.clone(), state.clone()));
            }
        }

        self.make_leaders(&req, &to_leader, &mut codes).await;
        self.make_followers(&req, &to_follower, &mut codes).await;

        if !self.hw_checkpoint_started.swap(true, Ordering::SeqCst) {
            self.start_hw_checkpoint_task();
        }
        if let Some(fetchers) = self.fetchers() {
            fetchers.shutdown_idle_fetchers().await;
        }

        ReplicationMetrics::record_state_change_duration(started.elapsed());
        LeaderAndIsrResponse {
            correlation_id: req.correlation_id,
            error: ErrorCode::NoError,
            partitions: codes,
        }
    }

    /// Apply a StopReplica request from the controller.
    pub async fn stop_replicas(&self, req: StopReplicaRequest) -> StopReplicaResponse {
        let _guard = self.state_change_lock.lock().await;

        info!(
            broker = self.config.broker_id,
            controller = req.controller_id,
            controller_epoch = req.controller_epoch,
            correlation_id = req.correlation_id,
            partitions = req.partitions.len(),
            delete = req.delete_partitions,
            "handling stop replica request"
        );

        if let Err(code) = self.fence_controller_epoch(req.controller_epoch) {
            return StopReplicaResponse {
                correlation_id: req.correlation_id,
                error: code,
                partitions: HashMap::new(),
            };
        }

        if let Some(fetchers) = self.fetchers() {
            fetchers.remove_fetcher_for_partitions(&req.partitions).await;
        }

        let mut codes = HashMap::new();
        for tp in &req.partitions {
            self.leader_partitions.lock().remove(tp);
            if req.delete_partitions {
                if self.partitions.remove(tp).is_none() {
                    warn!(partition = %tp, "asked to delete a partition this broker does not host");
                }
                self.log_manager.remove(&tp.topic, tp.partition);
            } else if !self.partitions.contains_key(tp) {
                warn!(partition = %tp, "asked to stop a partition this broker does not host");
            }
            codes.insert(tp.clone(), ErrorCode::NoError);
        }

        StopReplicaResponse {
            correlation_id: req.correlation_id,
            error: ErrorCode::NoError,
            partitions: codes,
        }
    }

    /// Route a follower's position report to its partition. Unknown
    /// partitions are dropped with a warning: the broker may simply not have
    /// caught up with the controller yet.
    pub async fn record_follower_position(
        &self,
        tp: &TopicPartition,
        broker_id: BrokerId,
        offset: u64,
    ) {
        let Some(partition) = self.partition(tp) else {
            warn!(
                partition = %tp,
                follower = broker_id,
                "position report for unknown partition, dropping"
            );
            return;
        };
        if let Err(e) = partition.record_follower_position(broker_id, offset).await {
            warn!(
                partition = %tp,
                follower = broker_id,
                error = %e,
                "failed to record follower position"
            );
        }
    }

    /// Write the high watermark of every local replica with an open log to
    /// the checkpoint file.
    pub async fn checkpoint_high_watermarks(&self) -> Result<()> {
        checkpoint_high_watermarks(&self.partitions, &self.checkpoint).await?;
        debug!(broker = self.config.broker_id, "checkpointed high watermarks");
        Ok(())
    }

    /// Stop background tasks and the fetch subsystem, then write one final
    /// checkpoint.
    pub async fn shutdown(&self) -> Result<()> {
        info!(broker = self.config.broker_id, "replica coordinator shutting down");
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        if let Some(fetchers) = self.fetchers() {
            fetchers.shutdown().await;
        }

        self.checkpoint_high_watermarks().await?;
        self.log_manager.flush_all()?;

        info!(broker = self.config.broker_id, "replica coordinator shutdown complete");
        Ok(())
    }

    // ==================== Internal ====================

    /// Reject messages from deposed controllers and adopt newer epochs.
    /// Callers hold `state_change_lock`.
    fn fence_controller_epoch(&self, received: u64) -> std::result::Result<(), ErrorCode> {
        let current = self.controller_epoch.load(Ordering::SeqCst);
        if received < current {
            warn!(
                broker = self.config.broker_id,
                received, current,
                "rejecting controller request with stale epoch"
            );
            return Err(ErrorCode::StaleControllerEpoch);
        }
        self.controller_epoch.store(received, Ordering::SeqCst);
        Ok(())
    }

    fn get_or_create_partition(&self, tp: &TopicPartition) -> Arc<Partition> {
        self.partitions
            .entry(tp.clone())
            .or_insert_with(|| {
                Arc::new(Partition::new(
                    tp.clone(),
                    self.config.broker_id,
                    self.log_manager.clone(),
                    self.metadata.clone(),
                    self.checkpoint.clone(),
                ))
            })
            .value()
            .clone()
    }

    /// A former follower must stop fetching before it accepts writes as
    /// leader, so fetcher removal precedes the partition transitions.
    async fn make_leaders(
        &self,
        req: &LeaderAndIsrRequest,
        entries: &[(TopicPartition, PartitionStateInfo)],
        codes: &mut HashMap<TopicPartition, ErrorCode>,
    ) {
        if entries.is_empty() {
            return;
        }

        let set: HashSet<TopicPartition> = entries.iter().map(|(tp, _)| tp.clone()).collect();
        if let Some(fetchers) = self.fetchers() {
            fetchers.remove_fetcher_for_partitions(&set).await;
        }

        for (tp, state) in entries {
            let Some(partition) = self.partition(tp) else {
                codes.insert(tp.clone(), ErrorCode::UnknownTopicOrPartition);
                continue;
            };
            match partition
                .make_leader(req.controller_id, state, req.correlation_id)
                .await
            {
                Ok(()) => {
                    codes.insert(tp.clone(), ErrorCode::NoError);
                    self.leader_partitions.lock().insert(tp.clone());
                }
                Err(e) => {
                    error!(
                        partition = %tp,
                        correlation_id = req.correlation_id,
                        error = %e,
                        "failed to make partition leader"
                    );
                    codes.insert(tp.clone(), e.error_code());
                }
            }
        }
    }

    /// Follower transitions, in an order that protects acknowledged writes:
    /// stop fetching, cut each local log back to its high watermark (a
    /// former leader may hold an uncommitted suffix the new leader never
    /// saw), only then resume fetching from the designated leader at the
    /// post-truncation offset.
    async fn make_followers(
        &self,
        req: &LeaderAndIsrRequest,
        entries: &[(TopicPartition, PartitionStateInfo)],
        codes: &mut HashMap<TopicPartition, ErrorCode>,
    ) {
        if entries.is_empty() {
            return;
        }

        let set: HashSet<TopicPartition> = entries.iter().map(|(tp, _)| tp.clone()).collect();
        if let Some(fetchers) = self.fetchers() {
            fetchers.remove_fetcher_for_partitions(&set).await;
        }

        let mut fetch_targets: HashMap<TopicPartition, FetchTarget> = HashMap::new();
        for (tp, state) in entries {
            let Some(partition) = self.partition(tp) else {
                codes.insert(tp.clone(), ErrorCode::UnknownTopicOrPartition);
                continue;
            };
            let offset = match partition.truncate_to_high_watermark().await {
                Ok(offset) => offset,
                Err(e) => {
                    error!(
                        partition = %tp,
                        correlation_id = req.correlation_id,
                        error = %e,
                        "failed to truncate log for follower transition"
                    );
                    codes.insert(tp.clone(), e.error_code());
                    continue;
                }
            };

            let leader = req
                .leaders
                .iter()
                .find(|broker| broker.id == state.leader_and_isr.leader);
            match leader {
                Some(leader) if !self.shutting_down.load(Ordering::SeqCst) => {
                    fetch_targets.insert(
                        tp.clone(),
                        FetchTarget {
                            leader: leader.clone(),
                            initial_offset: offset,
                        },
                    );
                }
                _ => {}
            }
        }

        if !fetch_targets.is_empty() {
            if let Some(fetchers) = self.fetchers() {
                fetchers.add_fetcher_for_partitions(fetch_targets).await;
            }
        }

        for (tp, state) in entries {
            if codes.get(tp).is_some_and(|code| code.is_error()) {
                continue;
            }
            let Some(partition) = self.partition(tp) else {
                codes.insert(tp.clone(), ErrorCode::UnknownTopicOrPartition);
                continue;
            };
            match partition
                .make_follower(req.controller_id, state, &req.leaders, req.correlation_id)
                .await
            {
                Ok(()) => {
                    codes.insert(tp.clone(), ErrorCode::NoError);
                }
                Err(e) => {
                    error!(
                        partition = %tp,
                        correlation_id = req.correlation_id,
                        error = %e,
                        "failed to make partition follower"
                    );
                    codes.insert(tp.clone(), e.error_code());
                }
            }
        }

        let mut leaders = self.leader_partitions.lock();
        for tp in &set {
            leaders.remove(tp);
        }
    }

    /// A failed checkpoint would let a restart recover past what every ISR
    /// member holds, silently breaking acknowledged writes, so the process
    /// halts instead.
    fn start_hw_checkpoint_task(&self) {
        let partitions = self.partitions.clone();
        let checkpoint = self.checkpoint.clone();
        let period = self.config.replication.hw_checkpoint_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = checkpoint_high_watermarks(&partitions, &checkpoint).await {
                            error!(
                                error = %e,
                                "high watermark checkpoint failed, halting broker"
                            );
                            std::process::abort();
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
        debug!(broker = self.config.broker_id, "high watermark checkpoint task started");
    }
}

/// Collect the high watermark of every local replica with an open log and
/// write them out atomically.
async fn checkpoint_high_watermarks(
    partitions: &PartitionTable,
    checkpoint: &HighWatermarkCheckpoint,
) -> Result<()> {
    let started = Instant::now();
    let snapshot: Vec<Arc<Partition>> = partitions
        .iter()
        .map(|entry| entry.value().clone())
        .collect();

    let mut entries = HashMap::with_capacity(snapshot.len());
    for partition in snapshot {
        if let Some(hw) = partition.high_watermark().await {
            entries.insert(partition.topic_partition().clone(), hw);
        }
    }

    checkpoint.write(&entries)?;
    ReplicationMetrics::increment_hw_checkpoints();
    ReplicationMetrics::record_hw_checkpoint_duration(started.elapsed());
    Ok(())
}

/// One pass of the periodic ISR evaluation: shrink where followers fell
/// behind, refresh the replication gauges.
async fn evaluate_isr(
    partitions: &PartitionTable,
    leader_partitions: &parking_lot::Mutex<HashSet<TopicPartition>>,
    lag_time: std::time::Duration,
    lag_messages: u64,
) {
    let snapshot: Vec<TopicPartition> = leader_partitions.lock().iter().cloned().collect();

    let mut under_replicated = 0usize;
    for tp in &snapshot {
        let Some(partition) = partitions.get(tp).map(|entry| entry.value().clone()) else {
            continue;
        };
        if let Err(e) = partition.maybe_shrink_isr(lag_time, lag_messages).await {
            warn!(partition = %tp, error = %e, "ISR evaluation failed");
        }
        if partition.in_sync_replicas().await.len() < partition.assigned_broker_ids().await.len() {
            under_replicated += 1;
        }
    }

    ReplicationMetrics::set_leader_partition_count(snapshot.len());
    ReplicationMetrics::set_under_replicated_partitions(under_replicated);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerInfo;
    use crate::metadata::{leader_isr_path, InMemoryMetadataStore, LeaderIsrRecord};
    use crate::protocol::LeaderAndIsr;
    use bytes::Bytes;
    use skarv_core::Message;
    use tempfile::TempDir;

    const CONTROLLER: BrokerId = 100;

    struct Fixture {
        _dir: TempDir,
        metadata: Arc<InMemoryMetadataStore>,
        coordinator: Arc<ReplicaCoordinator>,
    }

    async fn fixture(broker_id: BrokerId) -> Fixture {
        let dir = TempDir::new().unwrap();
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let config = BrokerConfig::new(broker_id).with_data_dir(dir.path().join("data"));
        let coordinator =
            Arc::new(ReplicaCoordinator::new(config, metadata.clone()).unwrap());
        Fixture {
            _dir: dir,
            metadata,
            coordinator,
        }
    }

    async fn seed_record(fx: &Fixture, tp: &TopicPartition, record: &LeaderIsrRecord) -> u64 {
        let path = leader_isr_path(tp);
        let payload = record.to_bytes().unwrap();
        match fx.metadata.version_of(&path).await {
            Some(v) => fx
                .metadata
                .conditional_update(&path, payload, v)
                .await
                .unwrap(),
            None => fx.metadata.create(&path, payload).await.unwrap(),
        }
    }

    async fn request(
        fx: &Fixture,
        controller_epoch: u64,
        tp: &TopicPartition,
        leader: BrokerId,
        leader_epoch: u64,
        isr: Vec<BrokerId>,
        replicas: Vec<BrokerId>,
        leaders: Vec<BrokerInfo>,
    ) -> LeaderAndIsrRequest {
        let record = LeaderIsrRecord {
            leader,
            leader_epoch,
            isr: isr.clone(),
            controller_epoch,
        };
        let zk_version = seed_record(fx, tp, &record).await;
        LeaderAndIsrRequest {
            controller_id: CONTROLLER,
            controller_epoch,
            correlation_id: 1,
            partition_states: HashMap::from([(
                tp.clone(),
                PartitionStateInfo {
                    leader_and_isr: LeaderAndIsr {
                        leader,
                        leader_epoch,
                        isr,
                        zk_version,
                    },
                    controller_epoch,
                    replicas,
                },
            )]),
            leaders,
        }
    }

    #[tokio::test]
    async fn test_become_leader() {
        let fx = fixture(0).await;
        let tp = TopicPartition::new("events", 0);
        let req = request(&fx, 1, &tp, 0, 1, vec![0], vec![0, 1], vec![]).await;

        let resp = fx.coordinator.become_leader_or_follower(req).await;
        assert_eq!(resp.error, ErrorCode::NoError);
        assert_eq!(resp.partitions[&tp], ErrorCode::NoError);
        assert_eq!(fx.coordinator.leader_partition_count(), 1);
        assert_eq!(fx.coordinator.controller_epoch(), 1);
        assert!(fx.coordinator.partition(&tp).unwrap().is_leader().await);
    }

    #[tokio::test]
    async fn test_stale_controller_epoch_rejected_wholesale() {
        let fx = fixture(0).await;
        let tp = TopicPartition::new("events", 0);
        let req = request(&fx, 5, &tp, 0, 1, vec![0], vec![0], vec![]).await;
        fx.coordinator.become_leader_or_follower(req).await;

        let tp2 = TopicPartition::new("events", 1);
        let stale = request(&fx, 4, &tp2, 0, 1, vec![0], vec![0], vec![]).await;
        let resp = fx.coordinator.become_leader_or_follower(stale).await;

        assert_eq!(resp.error, ErrorCode::StaleControllerEpoch);
        assert!(resp.partitions.is_empty());
        // Nothing was mutated for the stale request.
        assert!(fx.coordinator.partition(&tp2).is_none());
        assert_eq!(fx.coordinator.controller_epoch(), 5);
    }

    #[tokio::test]
    async fn test_duplicate_request_reports_stale_leader_epoch() {
        let fx = fixture(0).await;
        let tp = TopicPartition::new("events", 0);

        let req = request(&fx, 1, &tp, 0, 3, vec![0], vec![0, 1], vec![]).await;
        let first = fx.coordinator.become_leader_or_follower(req.clone()).await;
        assert_eq!(first.partitions[&tp], ErrorCode::NoError);

        let partition = fx.coordinator.partition(&tp).unwrap();
        partition
            .append_to_leader(vec![Message::new(Bytes::from("a"))])
            .await
            .unwrap();
        let hw_before = partition.high_watermark().await;

        // The exact same decision again: refused per partition, state intact.
        let second = fx.coordinator.become_leader_or_follower(req).await;
        assert_eq!(second.error, ErrorCode::NoError);
        assert_eq!(second.partitions[&tp], ErrorCode::StaleLeaderEpoch);
        assert_eq!(partition.leader_epoch().await, Some(3));
        assert_eq!(partition.high_watermark().await, hw_before);
        assert_eq!(fx.coordinator.leader_partition_count(), 1);
    }

    #[tokio::test]
    async fn test_follower_with_unknown_leader_gets_a_code() {
        let fx = fixture(2).await;
        let tp = TopicPartition::new("events", 0);

        // Leader broker 0 is not described in the request.
        let req = request(&fx, 1, &tp, 0, 1, vec![0], vec![0, 2], vec![]).await;
        let resp = fx.coordinator.become_leader_or_follower(req).await;

        assert_eq!(resp.error, ErrorCode::NoError);
        assert_eq!(resp.partitions[&tp], ErrorCode::ReplicaNotAvailable);
    }

    #[tokio::test]
    async fn test_leader_to_follower_truncates_to_hw() {
        let fx = fixture(0).await;
        let tp = TopicPartition::new("events", 0);

        let req = request(&fx, 1, &tp, 0, 1, vec![0, 1], vec![0, 1], vec![]).await;
        fx.coordinator.become_leader_or_follower(req).await;

        let partition = fx.coordinator.partition(&tp).unwrap();
        for _ in 0..3 {
            partition
                .append_to_leader(vec![Message::new(Bytes::from("x"))])
                .await
                .unwrap();
        }
        partition.record_follower_position(1, 2).await.unwrap();
        assert_eq!(partition.high_watermark().await, Some(2));

        // Demote: broker 1 takes over at the next epoch.
        let leaders = vec![BrokerInfo::new(1, "127.0.0.1:9001".parse().unwrap())];
        let req = request(&fx, 1, &tp, 1, 2, vec![1], vec![0, 1], leaders).await;
        let resp = fx.coordinator.become_leader_or_follower(req).await;

        assert_eq!(resp.partitions[&tp], ErrorCode::NoError);
        assert!(!partition.is_leader().await);
        assert_eq!(fx.coordinator.leader_partition_count(), 0);
        // The unacknowledged record at offset 2 is gone.
        assert_eq!(partition.local_log_end_offset().await, Some(2));
    }

    #[tokio::test]
    async fn test_stop_replicas() {
        let fx = fixture(0).await;
        let tp = TopicPartition::new("events", 0);
        let req = request(&fx, 1, &tp, 0, 1, vec![0], vec![0], vec![]).await;
        fx.coordinator.become_leader_or_follower(req).await;

        let resp = fx
            .coordinator
            .stop_replicas(StopReplicaRequest {
                controller_id: CONTROLLER,
                controller_epoch: 1,
                correlation_id: 2,
                delete_partitions: false,
                partitions: HashSet::from([tp.clone()]),
            })
            .await;
        assert_eq!(resp.partitions[&tp], ErrorCode::NoError);
        assert_eq!(fx.coordinator.leader_partition_count(), 0);
        // Without delete the partition stays known.
        assert!(fx.coordinator.partition(&tp).is_some());

        let resp = fx
            .coordinator
            .stop_replicas(StopReplicaRequest {
                controller_id: CONTROLLER,
                controller_epoch: 1,
                correlation_id: 3,
                delete_partitions: true,
                partitions: HashSet::from([tp.clone()]),
            })
            .await;
        assert_eq!(resp.partitions[&tp], ErrorCode::NoError);
        assert!(fx.coordinator.partition(&tp).is_none());
    }

    #[tokio::test]
    async fn test_stop_replicas_fenced() {
        let fx = fixture(0).await;
        let tp = TopicPartition::new("events", 0);
        let req = request(&fx, 3, &tp, 0, 1, vec![0], vec![0], vec![]).await;
        fx.coordinator.become_leader_or_follower(req).await;

        let resp = fx
            .coordinator
            .stop_replicas(StopReplicaRequest {
                controller_id: CONTROLLER,
                controller_epoch: 2,
                correlation_id: 4,
                delete_partitions: true,
                partitions: HashSet::from([tp.clone()]),
            })
            .await;
        assert_eq!(resp.error, ErrorCode::StaleControllerEpoch);
        assert!(fx.coordinator.partition(&tp).is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let fx = fixture(0).await;
        let tp = TopicPartition::new("events", 0);
        let req = request(&fx, 1, &tp, 0, 1, vec![0], vec![0], vec![]).await;
        fx.coordinator.become_leader_or_follower(req).await;

        let partition = fx.coordinator.partition(&tp).unwrap();
        partition
            .append_to_leader(vec![
                Message::new(Bytes::from("a")),
                Message::new(Bytes::from("b")),
            ])
            .await
            .unwrap();
        assert_eq!(partition.high_watermark().await, Some(2));

        fx.coordinator.checkpoint_high_watermarks().await.unwrap();

        let read_back =
            HighWatermarkCheckpoint::new(&fx.coordinator.config.data_dir).read().unwrap();
        assert_eq!(read_back, HashMap::from([(tp, 2)]));
    }

    #[tokio::test]
    async fn test_unknown_position_report_is_dropped() {
        let fx = fixture(0).await;
        // No partition state at all; must not panic or create state.
        fx.coordinator
            .record_follower_position(&TopicPartition::new("ghost", 0), 1, 5)
            .await;
        assert!(fx.coordinator.partition(&TopicPartition::new("ghost", 0)).is_none());
    }
}
