//! Follower fetch subsystem.
//!
//! The coordinator drives fetchers only through the [`FetcherControl`]
//! contract; [`ReplicaFetcherManager`] is the in-process implementation. It
//! runs one fetch task per followed partition. Each task loops: fetch from
//! the partition's leader starting at the local log end offset, append the
//! returned batch preserving the leader-assigned offsets, adopt the leader's
//! high watermark (clamped to what was actually written), repeat.
//!
//! The fetch offset carried by every request is the follower's log end
//! offset, so serving a fetch doubles as the follower's position report at
//! the leader.

use crate::broker::{BrokerId, BrokerInfo};
use crate::config::ReplicationConfig;
use crate::error::Result;
use crate::partition::{Partition, PartitionTable, TopicPartition};
use async_trait::async_trait;
use skarv_core::{Log, LogManager, Message};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where a follower should fetch a partition from, and starting at which
/// offset.
#[derive(Debug, Clone)]
pub struct FetchTarget {
    pub leader: BrokerInfo,
    pub initial_offset: u64,
}

/// Control contract the coordinator holds over the fetch subsystem
#[async_trait]
pub trait FetcherControl: Send + Sync {
    /// Start fetching the given partitions from their designated leaders.
    /// Re-adding a partition replaces its existing fetcher.
    async fn add_fetcher_for_partitions(&self, targets: HashMap<TopicPartition, FetchTarget>);

    /// Stop fetching the given partitions. Idempotent.
    async fn remove_fetcher_for_partitions(&self, partitions: &HashSet<TopicPartition>);

    /// Best-effort cleanup of fetcher tasks that have finished on their own.
    async fn shutdown_idle_fetchers(&self);

    /// Terminate all fetcher work.
    async fn shutdown(&self);
}

/// One batch of records pulled from a leader
#[derive(Debug, Clone)]
pub struct FetchedBatch {
    pub messages: Vec<Message>,
    /// The leader's high watermark at serve time
    pub high_watermark: u64,
}

/// Transport abstraction a fetch task pulls through.
///
/// Implementations route to the leader broker for the partition. The
/// `fetch_offset` is the follower's log end offset and must be recorded at
/// the leader as this follower's position.
#[async_trait]
pub trait FetchSource: Send + Sync {
    async fn fetch(
        &self,
        leader: &BrokerInfo,
        partition: &TopicPartition,
        follower: BrokerId,
        fetch_offset: u64,
        max_bytes: u32,
    ) -> Result<FetchedBatch>;
}

struct FetcherHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Per-broker fetcher pool: one task per followed partition
pub struct ReplicaFetcherManager {
    broker_id: BrokerId,
    log_manager: Arc<LogManager>,
    partitions: Arc<PartitionTable>,
    source: Arc<dyn FetchSource>,
    config: ReplicationConfig,
    tasks: parking_lot::Mutex<HashMap<TopicPartition, FetcherHandle>>,
}

impl ReplicaFetcherManager {
    pub fn new(
        broker_id: BrokerId,
        log_manager: Arc<LogManager>,
        partitions: Arc<PartitionTable>,
        source: Arc<dyn FetchSource>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            broker_id,
            log_manager,
            partitions,
            source,
            config,
            tasks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Number of live fetch tasks
    pub fn fetcher_count(&self) -> usize {
        self.tasks.lock().len()
    }

    async fn stop_task(tp: &TopicPartition, handle: FetcherHandle) {
        let _ = handle.shutdown_tx.send(());
        if handle.handle.await.is_err() {
            warn!(partition = %tp, "fetcher task ended abnormally");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_fetcher(
        broker_id: BrokerId,
        tp: TopicPartition,
        target: FetchTarget,
        log: Arc<dyn Log>,
        partition: Arc<Partition>,
        source: Arc<dyn FetchSource>,
        config: ReplicationConfig,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut fetch_offset = target.initial_offset;
        let mut interval = tokio::time::interval(config.fetch_interval);

        info!(
            partition = %tp,
            leader = %target.leader,
            fetch_offset,
            "fetcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(partition = %tp, "fetcher shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let batch = match source
                        .fetch(&target.leader, &tp, broker_id, fetch_offset, config.fetch_max_bytes)
                        .await
                    {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!(partition = %tp, error = %e, "fetch from leader failed");
                            continue;
                        }
                    };

                    if !batch.messages.is_empty() {
                        // Persist before advancing the fetch offset, so a
                        // failure re-fetches instead of skipping records.
                        match log.append_replicated(batch.messages) {
                            Ok(info) => {
                                fetch_offset = info.next_offset();
                                debug!(
                                    partition = %tp,
                                    new_offset = fetch_offset,
                                    leader_hw = batch.high_watermark,
                                    "applied records from leader"
                                );
                            }
                            Err(e) => {
                                error!(
                                    partition = %tp,
                                    error = %e,
                                    "failed to apply replicated batch"
                                );
                                continue;
                            }
                        }
                    }

                    partition.record_leader_high_watermark(batch.high_watermark).await;
                }
            }
        }
    }
}

#[async_trait]
impl FetcherControl for ReplicaFetcherManager {
    async fn add_fetcher_for_partitions(&self, targets: HashMap<TopicPartition, FetchTarget>) {
        for (tp, target) in targets {
            // Replace any existing fetcher for the partition.
            let previous = self.tasks.lock().remove(&tp);
            if let Some(handle) = previous {
                Self::stop_task(&tp, handle).await;
            }

            let log: Arc<dyn Log> = match self
                .log_manager
                .get_or_create(&tp.topic, tp.partition)
            {
                Ok(log) => log,
                Err(e) => {
                    error!(partition = %tp, error = %e, "cannot open log for fetcher");
                    continue;
                }
            };
            let Some(partition) = self.partitions.get(&tp).map(|p| p.value().clone()) else {
                warn!(partition = %tp, "no partition state for fetcher, skipping");
                continue;
            };

            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let handle = tokio::spawn(Self::run_fetcher(
                self.broker_id,
                tp.clone(),
                target,
                log,
                partition,
                self.source.clone(),
                self.config.clone(),
                shutdown_rx,
            ));

            self.tasks.lock().insert(
                tp,
                FetcherHandle {
                    shutdown_tx,
                    handle,
                },
            );
        }
    }

    async fn remove_fetcher_for_partitions(&self, partitions: &HashSet<TopicPartition>) {
        let mut stopped = Vec::new();
        {
            let mut tasks = self.tasks.lock();
            for tp in partitions {
                if let Some(handle) = tasks.remove(tp) {
                    stopped.push((tp.clone(), handle));
                }
            }
        }
        for (tp, handle) in stopped {
            Self::stop_task(&tp, handle).await;
        }
    }

    async fn shutdown_idle_fetchers(&self) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|tp, handle| {
            if handle.handle.is_finished() {
                debug!(partition = %tp, "reaped finished fetcher");
                false
            } else {
                true
            }
        });
    }

    async fn shutdown(&self) {
        let drained: Vec<(TopicPartition, FetcherHandle)> =
            self.tasks.lock().drain().collect();
        for (tp, handle) in drained {
            Self::stop_task(&tp, handle).await;
        }
        info!(broker = self.broker_id, "fetcher manager shut down");
    }
}
