//! Per-replica bookkeeping.
//!
//! A partition tracks one [`Replica`] per assigned broker. The local replica
//! is bound to its log and carries the partition's high watermark; remote
//! replicas exist only as the log end offset their broker last reported and
//! the time of that report, which drives slowness detection.
//!
//! None of these accessors synchronize; the owning partition's lock covers
//! every call.

use crate::broker::BrokerId;
use skarv_core::Log;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
enum ReplicaKind {
    Local {
        log: Arc<dyn Log>,
        high_watermark: u64,
    },
    Remote {
        /// Last reported log end offset; `None` until the broker reports one
        /// (or after a leadership change invalidates the previous report)
        log_end_offset: Option<u64>,
        updated_at: Instant,
    },
}

/// A single replica of a partition
#[derive(Debug)]
pub struct Replica {
    broker_id: BrokerId,
    kind: ReplicaKind,
}

impl Replica {
    /// Create the replica hosted on this broker, bound to its log
    pub fn local(broker_id: BrokerId, log: Arc<dyn Log>, high_watermark: u64) -> Self {
        Self {
            broker_id,
            kind: ReplicaKind::Local {
                log,
                high_watermark,
            },
        }
    }

    /// Create a replica hosted on another broker
    pub fn remote(broker_id: BrokerId) -> Self {
        Self {
            broker_id,
            kind: ReplicaKind::Remote {
                log_end_offset: None,
                updated_at: Instant::now(),
            },
        }
    }

    pub fn broker_id(&self) -> BrokerId {
        self.broker_id
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, ReplicaKind::Local { .. })
    }

    /// Log end offset: authoritative from the log for the local replica,
    /// last reported value for remote ones.
    pub fn log_end_offset(&self) -> Option<u64> {
        match &self.kind {
            ReplicaKind::Local { log, .. } => Some(log.log_end_offset()),
            ReplicaKind::Remote { log_end_offset, .. } => *log_end_offset,
        }
    }

    /// Record a remote replica's reported log end offset, stamping the
    /// report time. The local replica's offset comes from its log and is
    /// never set this way.
    pub fn update_log_end_offset(&mut self, offset: u64) {
        match &mut self.kind {
            ReplicaKind::Remote {
                log_end_offset,
                updated_at,
            } => {
                *log_end_offset = Some(offset);
                *updated_at = Instant::now();
            }
            ReplicaKind::Local { .. } => {
                debug_assert!(false, "local log end offset is derived from the log");
            }
        }
    }

    /// Invalidate a remote replica's reported offset: a previous epoch's
    /// report is no longer authoritative after a leadership change.
    pub fn reset_log_end_offset(&mut self) {
        if let ReplicaKind::Remote {
            log_end_offset,
            updated_at,
        } = &mut self.kind
        {
            *log_end_offset = None;
            *updated_at = Instant::now();
        }
    }

    /// When the remote replica's offset was last set (or reset)
    pub fn log_end_offset_updated_at(&self) -> Option<Instant> {
        match &self.kind {
            ReplicaKind::Remote { updated_at, .. } => Some(*updated_at),
            ReplicaKind::Local { .. } => None,
        }
    }

    /// High watermark, tracked only on the local replica
    pub fn high_watermark(&self) -> Option<u64> {
        match &self.kind {
            ReplicaKind::Local { high_watermark, .. } => Some(*high_watermark),
            ReplicaKind::Remote { .. } => None,
        }
    }

    /// Set the local replica's high watermark
    pub fn set_high_watermark(&mut self, hw: u64) {
        if let ReplicaKind::Local { high_watermark, .. } = &mut self.kind {
            *high_watermark = hw;
        } else {
            debug_assert!(false, "remote replicas carry no high watermark");
        }
    }

    /// The local replica's log handle
    pub fn log(&self) -> Option<&Arc<dyn Log>> {
        match &self.kind {
            ReplicaKind::Local { log, .. } => Some(log),
            ReplicaKind::Remote { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use skarv_core::{FileLog, Message};

    #[test]
    fn test_remote_replica_tracking() {
        let mut replica = Replica::remote(2);
        assert!(!replica.is_local());
        assert_eq!(replica.log_end_offset(), None);
        assert!(replica.high_watermark().is_none());

        replica.update_log_end_offset(10);
        assert_eq!(replica.log_end_offset(), Some(10));
        let first_stamp = replica.log_end_offset_updated_at().unwrap();

        replica.reset_log_end_offset();
        assert_eq!(replica.log_end_offset(), None);
        assert!(replica.log_end_offset_updated_at().unwrap() >= first_stamp);
    }

    #[test]
    fn test_local_replica_reads_log() {
        let dir = tempfile::tempdir().unwrap();
        let log: Arc<dyn Log> = Arc::new(FileLog::open(dir.path(), 1024 * 1024).unwrap());
        log.append(vec![Message::new(Bytes::from("a"))]).unwrap();

        let mut replica = Replica::local(0, log.clone(), 0);
        assert!(replica.is_local());
        assert_eq!(replica.log_end_offset(), Some(1));
        assert_eq!(replica.high_watermark(), Some(0));
        assert!(replica.log_end_offset_updated_at().is_none());

        replica.set_high_watermark(1);
        assert_eq!(replica.high_watermark(), Some(1));

        log.append(vec![Message::new(Bytes::from("b"))]).unwrap();
        assert_eq!(replica.log_end_offset(), Some(2));
    }
}
