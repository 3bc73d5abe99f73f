use crate::{Message, Result};

/// Outcome of a log append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogAppendInfo {
    /// Offset assigned to the first record of the batch
    pub first_offset: u64,
    /// Offset assigned to the last record of the batch
    pub last_offset: u64,
}

impl LogAppendInfo {
    /// One past the last appended offset
    pub fn next_offset(&self) -> u64 {
        self.last_offset + 1
    }
}

/// The log contract the replication layer consumes.
///
/// Implementations are internally synchronized: every method takes `&self`
/// and may be called from multiple threads. Disk I/O may block the caller.
pub trait Log: Send + Sync + std::fmt::Debug {
    /// Append a batch as the partition leader, assigning consecutive offsets
    /// starting at the current log end offset.
    fn append(&self, messages: Vec<Message>) -> Result<LogAppendInfo>;

    /// Append a batch replicated from the leader, preserving the offsets the
    /// leader assigned. The batch must continue exactly at the current log
    /// end offset and be internally contiguous.
    fn append_replicated(&self, messages: Vec<Message>) -> Result<LogAppendInfo>;

    /// Read records with offset >= `from_offset`, up to roughly `max_bytes`.
    fn read(&self, from_offset: u64, max_bytes: usize) -> Result<Vec<Message>>;

    /// One past the largest offset this log contains.
    fn log_end_offset(&self) -> u64;

    /// Discard every record with offset >= `offset`.
    fn truncate_to(&self, offset: u64) -> Result<()>;

    /// Flush buffered writes to stable storage.
    fn flush(&self) -> Result<()>;
}
