//! High watermark checkpoint file.
//!
//! One file per log directory records the high watermark of every local
//! replica so a restarting broker can recover each log to a consistent
//! prefix. The format is line-oriented for human inspection:
//!
//! ```text
//! 0                       <- format version
//! 2                       <- entry count
//! events 0 42
//! events 1 17
//! ```
//!
//! Writes serialize the complete map to a sibling temp file, fsync it, and
//! rename it over the target, so a concurrent reader observes either the
//! previous or the new map, never a partial one. A missing or empty file
//! reads as an empty map.

use crate::error::{ReplicaError, Result};
use crate::partition::TopicPartition;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name within a log directory
pub const CHECKPOINT_FILE_NAME: &str = "replication-offset-checkpoint";

const CURRENT_VERSION: u32 = 0;

/// Durable `{partition -> high watermark}` map for one log directory
#[derive(Debug)]
pub struct HighWatermarkCheckpoint {
    path: PathBuf,
    /// Serializes writers; readers rely on the atomic rename instead.
    write_lock: Mutex<()>,
}

impl HighWatermarkCheckpoint {
    /// Checkpoint for the given log directory
    pub fn new(log_dir: &Path) -> Self {
        Self {
            path: log_dir.join(CHECKPOINT_FILE_NAME),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the checkpoint with `entries`.
    pub fn write(&self, entries: &HashMap<TopicPartition, u64>) -> Result<()> {
        let _guard = self.write_lock.lock();

        let tmp_path = self.path.with_extension("tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "{CURRENT_VERSION}")?;
        writeln!(writer, "{}", entries.len())?;
        for (tp, offset) in entries {
            writeln!(writer, "{} {} {}", tp.topic, tp.partition, offset)?;
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        debug!(path = %self.path.display(), entries = entries.len(), "wrote high watermark checkpoint");
        Ok(())
    }

    /// Read the checkpointed map. A missing or zero-length file is an empty
    /// map; anything else that fails to parse is corruption.
    pub fn read(&self) -> Result<HashMap<TopicPartition, u64>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(ReplicaError::Io(e)),
        };

        let mut lines = BufReader::new(file).lines();

        let version_line = match lines.next() {
            Some(line) => line?,
            None => return Ok(HashMap::new()),
        };
        let version: u32 = version_line
            .trim()
            .parse()
            .map_err(|_| self.corrupt(format!("bad version line {version_line:?}")))?;
        if version != CURRENT_VERSION {
            return Err(self.corrupt(format!("unsupported version {version}")));
        }

        let count_line = lines
            .next()
            .ok_or_else(|| self.corrupt("missing entry count".to_string()))??;
        let count: usize = count_line
            .trim()
            .parse()
            .map_err(|_| self.corrupt(format!("bad entry count {count_line:?}")))?;

        let mut entries = HashMap::with_capacity(count);
        for line in lines.take(count) {
            let line = line?;
            let mut fields = line.split_whitespace();
            let (topic, partition, offset) = match (fields.next(), fields.next(), fields.next()) {
                (Some(t), Some(p), Some(o)) => (t, p, o),
                _ => return Err(self.corrupt(format!("malformed entry {line:?}"))),
            };
            let partition: u32 = partition
                .parse()
                .map_err(|_| self.corrupt(format!("bad partition in {line:?}")))?;
            let offset: u64 = offset
                .parse()
                .map_err(|_| self.corrupt(format!("bad offset in {line:?}")))?;
            entries.insert(TopicPartition::new(topic, partition), offset);
        }

        if entries.len() != count {
            return Err(self.corrupt(format!(
                "expected {count} entries, found {}",
                entries.len()
            )));
        }
        Ok(entries)
    }

    fn corrupt(&self, reason: String) -> ReplicaError {
        ReplicaError::CorruptCheckpoint {
            path: self.path.display().to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = HighWatermarkCheckpoint::new(dir.path());
        assert!(checkpoint.read().unwrap().is_empty());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = HighWatermarkCheckpoint::new(dir.path());

        let mut entries = HashMap::new();
        entries.insert(TopicPartition::new("events", 0), 42);
        entries.insert(TopicPartition::new("events", 1), 17);
        entries.insert(TopicPartition::new("audit", 0), 0);
        checkpoint.write(&entries).unwrap();

        assert_eq!(checkpoint.read().unwrap(), entries);
    }

    #[test]
    fn test_rewrite_replaces_whole_map() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = HighWatermarkCheckpoint::new(dir.path());

        let mut first = HashMap::new();
        first.insert(TopicPartition::new("a", 0), 1);
        first.insert(TopicPartition::new("b", 0), 2);
        checkpoint.write(&first).unwrap();

        let mut second = HashMap::new();
        second.insert(TopicPartition::new("a", 0), 5);
        checkpoint.write(&second).unwrap();

        // The dropped entry must not linger.
        assert_eq!(checkpoint.read().unwrap(), second);
    }

    #[test]
    fn test_unsupported_version_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = HighWatermarkCheckpoint::new(dir.path());
        fs::write(checkpoint.path(), "7\n0\n").unwrap();

        assert!(matches!(
            checkpoint.read(),
            Err(ReplicaError::CorruptCheckpoint { .. })
        ));
    }

    #[test]
    fn test_truncated_entries_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = HighWatermarkCheckpoint::new(dir.path());
        fs::write(checkpoint.path(), "0\n3\nevents 0 5\n").unwrap();

        assert!(matches!(
            checkpoint.read(),
            Err(ReplicaError::CorruptCheckpoint { .. })
        ));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        prop_compose! {
            fn arbitrary_topic()(s in "[a-zA-Z0-9_\\-\\.]{1,40}") -> String {
                s
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn roundtrip_preserves_every_entry(
                entries in prop::collection::hash_map(
                    (arbitrary_topic(), 0u32..64).prop_map(|(t, p)| TopicPartition::new(t, p)),
                    any::<u64>(),
                    0..32,
                )
            ) {
                let dir = tempfile::tempdir().unwrap();
                let checkpoint = HighWatermarkCheckpoint::new(dir.path());
                checkpoint.write(&entries).unwrap();
                prop_assert_eq!(checkpoint.read().unwrap(), entries);
            }
        }
    }
}
