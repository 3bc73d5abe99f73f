//! Segmented log storage.
//!
//! [`FileLog`] stores one partition's records across size-bounded segment
//! files and recovers its end offset by scanning the newest segment at open.
//! [`LogManager`] owns the logs for every partition hosted under a single
//! data directory.

mod log;
mod segment;

pub use log::{Log, LogAppendInfo};

use crate::{Error, Message, Result};
use parking_lot::{Mutex, RwLock};
use segment::Segment;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A segmented, file-backed partition log.
#[derive(Debug)]
pub struct FileLog {
    dir: PathBuf,
    max_segment_size: u64,
    inner: Mutex<FileLogInner>,
}

#[derive(Debug)]
struct FileLogInner {
    /// Ordered by base offset; the last entry is the active segment.
    segments: Vec<Segment>,
    next_offset: u64,
}

impl FileLog {
    /// Open the log stored in `dir`, creating it if absent. Scans the newest
    /// segment to recover the end offset and drop any torn tail.
    pub fn open(dir: impl Into<PathBuf>, max_segment_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut bases: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<u64>().ok())
            })
            .collect();
        bases.sort_unstable();

        let mut segments = Vec::with_capacity(bases.len().max(1));
        if bases.is_empty() {
            segments.push(Segment::open(&dir, 0)?);
        } else {
            for base in bases {
                segments.push(Segment::open(&dir, base)?);
            }
        }

        let active = segments.last_mut().expect("at least one segment");
        let next_offset = match active.recover()? {
            Some(last) => last + 1,
            None => active.base_offset(),
        };

        debug!(
            dir = %dir.display(),
            segments = segments.len(),
            next_offset,
            "opened log"
        );

        Ok(Self {
            dir,
            max_segment_size,
            inner: Mutex::new(FileLogInner {
                segments,
                next_offset,
            }),
        })
    }

    /// Number of segment files currently backing the log.
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    fn roll_if_needed(&self, inner: &mut FileLogInner) -> Result<()> {
        let active = inner.segments.last_mut().expect("at least one segment");
        if active.size() >= self.max_segment_size {
            active.flush()?;
            let base = inner.next_offset;
            inner.segments.push(Segment::open(&self.dir, base)?);
            debug!(dir = %self.dir.display(), base, "rolled log segment");
        }
        Ok(())
    }

    fn append_at(
        &self,
        inner: &mut FileLogInner,
        messages: Vec<Message>,
    ) -> Result<LogAppendInfo> {
        let first_offset = inner.next_offset;
        for message in &messages {
            self.roll_if_needed(inner)?;
            let active = inner.segments.last_mut().expect("at least one segment");
            active.append(message)?;
            inner.next_offset += 1;
        }
        Ok(LogAppendInfo {
            first_offset,
            last_offset: inner.next_offset - 1,
        })
    }
}

impl Log for FileLog {
    fn append(&self, mut messages: Vec<Message>) -> Result<LogAppendInfo> {
        if messages.is_empty() {
            return Err(Error::EmptyBatch);
        }
        let mut inner = self.inner.lock();
        let mut offset = inner.next_offset;
        for message in &mut messages {
            message.offset = offset;
            offset += 1;
        }
        self.append_at(&mut inner, messages)
    }

    fn append_replicated(&self, messages: Vec<Message>) -> Result<LogAppendInfo> {
        if messages.is_empty() {
            return Err(Error::EmptyBatch);
        }
        let mut inner = self.inner.lock();
        let mut expected = inner.next_offset;
        for message in &messages {
            if message.offset != expected {
                return Err(Error::NonContiguousBatch {
                    expected,
                    got: message.offset,
                });
            }
            expected += 1;
        }
        self.append_at(&mut inner, messages)
    }

    fn read(&self, from_offset: u64, max_bytes: usize) -> Result<Vec<Message>> {
        let mut inner = self.inner.lock();

        // First segment whose records can include `from_offset`.
        let start = inner
            .segments
            .partition_point(|s| s.base_offset() <= from_offset)
            .saturating_sub(1);

        let mut out = Vec::new();
        let mut budget = max_bytes;
        for segment in inner.segments[start..].iter_mut() {
            if budget == 0 {
                break;
            }
            let collected = segment.read_from(from_offset, budget, &mut out)?;
            budget = budget.saturating_sub(collected);
        }
        Ok(out)
    }

    fn log_end_offset(&self) -> u64 {
        self.inner.lock().next_offset
    }

    fn truncate_to(&self, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if offset >= inner.next_offset {
            return Ok(());
        }

        info!(
            dir = %self.dir.display(),
            from = inner.next_offset,
            to = offset,
            "truncating log"
        );

        // Drop whole segments that start at or beyond the cut, then trim the
        // boundary segment.
        let keep = inner.segments.partition_point(|s| s.base_offset() < offset);
        for segment in inner.segments.split_off(keep) {
            segment.delete()?;
        }

        match inner.segments.last_mut() {
            Some(boundary) => boundary.truncate_to(offset)?,
            None => inner.segments.push(Segment::open(&self.dir, offset)?),
        }
        inner.next_offset = offset;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for segment in inner.segments.iter_mut() {
            segment.flush()?;
        }
        Ok(())
    }
}

/// Owns one [`FileLog`] per hosted topic-partition.
#[derive(Debug)]
pub struct LogManager {
    base_dir: PathBuf,
    max_segment_size: u64,
    logs: RwLock<HashMap<(String, u32), Arc<FileLog>>>,
}

impl LogManager {
    pub fn new(base_dir: impl Into<PathBuf>, max_segment_size: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_segment_size,
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Data directory this manager owns.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Open the log for `topic`/`partition`, creating it if absent.
    pub fn get_or_create(&self, topic: &str, partition: u32) -> Result<Arc<FileLog>> {
        if let Some(log) = self.logs.read().get(&(topic.to_string(), partition)) {
            return Ok(log.clone());
        }

        let mut logs = self.logs.write();
        // Double-checked: another thread may have opened it meanwhile.
        if let Some(log) = logs.get(&(topic.to_string(), partition)) {
            return Ok(log.clone());
        }

        let dir = self
            .base_dir
            .join(topic)
            .join(format!("partition-{partition}"));
        let log = Arc::new(FileLog::open(dir, self.max_segment_size)?);
        logs.insert((topic.to_string(), partition), log.clone());
        Ok(log)
    }

    /// Look up an already-open log.
    pub fn get(&self, topic: &str, partition: u32) -> Option<Arc<FileLog>> {
        self.logs.read().get(&(topic.to_string(), partition)).cloned()
    }

    /// Drop a log from the table (its files stay on disk unless deleted).
    pub fn remove(&self, topic: &str, partition: u32) -> Option<Arc<FileLog>> {
        self.logs.write().remove(&(topic.to_string(), partition))
    }

    /// Flush every open log.
    pub fn flush_all(&self) -> Result<()> {
        let logs: Vec<Arc<FileLog>> = self.logs.read().values().cloned().collect();
        for log in logs {
            log.flush()?;
        }
        Ok(())
    }
}
