//! On-disk log segment.
//!
//! A segment is a single append-only file of framed records:
//!
//! ```text
//! [payload length: u32 BE][crc32 of payload: u32 BE][postcard-encoded Message]
//! ```
//!
//! Files are named by the offset of their first record (`{:020}.log`) so a
//! lexicographic sort of the directory is also an offset sort. Reads always
//! scan forward from the segment start; the replication paths that consume
//! segments (follower catch-up, recovery, truncation) are sequential, so no
//! index is kept.

use crate::{Error, Message, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const LOG_SUFFIX: &str = "log";
const FRAME_HEADER_SIZE: u64 = 8;

#[derive(Debug)]
pub(crate) struct Segment {
    base_offset: u64,
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
}

impl Segment {
    /// Open or create the segment whose first record has `base_offset`.
    pub(crate) fn open(dir: &Path, base_offset: u64) -> Result<Self> {
        let path = dir.join(format!("{:020}.{}", base_offset, LOG_SUFFIX));

        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;
        let size = file.seek(SeekFrom::End(0))?;

        Ok(Self {
            base_offset,
            path,
            writer: BufWriter::with_capacity(8192, file),
            size,
        })
    }

    pub(crate) fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Append a single record. Durability requires a later `flush`.
    pub(crate) fn append(&mut self, message: &Message) -> Result<()> {
        let payload = postcard::to_allocvec(message)?;
        let crc = crc32fast::hash(&payload);

        self.writer.write_all(&(payload.len() as u32).to_be_bytes())?;
        self.writer.write_all(&crc.to_be_bytes())?;
        self.writer.write_all(&payload)?;
        self.size += FRAME_HEADER_SIZE + payload.len() as u64;
        Ok(())
    }

    /// Collect records with offset >= `from_offset` into `out`, stopping once
    /// roughly `max_bytes` of payload has been gathered. Returns the byte
    /// estimate collected.
    pub(crate) fn read_from(
        &mut self,
        from_offset: u64,
        max_bytes: usize,
        out: &mut Vec<Message>,
    ) -> Result<usize> {
        let mut collected = 0usize;
        self.scan(|_, msg| {
            if msg.offset >= from_offset {
                collected += FRAME_HEADER_SIZE as usize
                    + msg.value.len()
                    + msg.key.as_ref().map(|k| k.len()).unwrap_or(0);
                out.push(msg);
            }
            collected < max_bytes
        })?;
        Ok(collected)
    }

    /// Scan the segment after a restart: returns the offset of the last fully
    /// written record (`None` if the segment holds none) and truncates any
    /// torn frame left by a crash.
    pub(crate) fn recover(&mut self) -> Result<Option<u64>> {
        let mut last = None;
        let clean_len = self.scan(|_, msg| {
            last = Some(msg.offset);
            true
        })?;

        let file_len = fs::metadata(&self.path)?.len();
        if clean_len < file_len {
            warn!(
                path = %self.path.display(),
                torn_bytes = file_len - clean_len,
                "dropping torn tail left by unclean shutdown"
            );
            self.set_len(clean_len)?;
        }
        Ok(last)
    }

    /// Discard every record with offset >= `offset`.
    pub(crate) fn truncate_to(&mut self, offset: u64) -> Result<()> {
        let cut = self.scan(|_, msg| msg.offset < offset)?;
        if cut < self.size {
            self.set_len(cut)?;
        }
        Ok(())
    }

    /// Flush buffered writes and fsync the file.
    pub(crate) fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Remove the segment file. Consumes the segment.
    pub(crate) fn delete(self) -> Result<()> {
        drop(self.writer);
        fs::remove_file(&self.path)?;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.writer.flush()?;
        OpenOptions::new().write(true).open(&self.path)?.set_len(len)?;
        self.size = len;
        Ok(())
    }

    /// Walk the segment from the start, invoking `visit` with each record's
    /// byte position. Stops at end of file, at the first torn or corrupt
    /// frame, or when `visit` returns false. Returns the byte position one
    /// past the last record accepted by `visit`.
    fn scan<F>(&mut self, mut visit: F) -> Result<u64>
    where
        F: FnMut(u64, Message) -> bool,
    {
        // Buffered writes must be visible to the read handle.
        self.writer.flush()?;

        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut pos = 0u64;
        let mut header = [0u8; FRAME_HEADER_SIZE as usize];

        loop {
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::Io(e)),
            }

            let len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
            let crc = u32::from_be_bytes(header[4..8].try_into().unwrap());

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::Io(e)),
            }

            if crc32fast::hash(&payload) != crc {
                warn!(
                    path = %self.path.display(),
                    position = pos,
                    "crc mismatch, stopping scan"
                );
                break;
            }

            let message: Message = match postcard::from_bytes(&payload) {
                Ok(m) => m,
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        position = pos,
                        error = %e,
                        "undecodable record, stopping scan"
                    );
                    break;
                }
            };

            if !visit(pos, message) {
                return Ok(pos);
            }
            pos += FRAME_HEADER_SIZE + len as u64;
        }

        Ok(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message(offset: u64, value: &str) -> Message {
        let mut m = Message::new(Bytes::from(value.to_string()));
        m.offset = offset;
        m
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::open(dir.path(), 0).unwrap();

        for i in 0..5 {
            segment.append(&message(i, &format!("msg-{i}"))).unwrap();
        }

        let mut out = Vec::new();
        segment.read_from(2, usize::MAX, &mut out).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].offset, 2);
        assert_eq!(out[2].value, Bytes::from("msg-4"));
    }

    #[test]
    fn test_recover_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut segment = Segment::open(dir.path(), 0).unwrap();
            segment.append(&message(0, "ok")).unwrap();
            segment.flush().unwrap();
        }

        // Simulate a crash mid-write: append garbage that parses as a frame
        // header pointing past end of file.
        let path = dir.path().join(format!("{:020}.log", 0));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0, 0, 0, 99, 1, 2, 3, 4, 9]).unwrap();
        drop(file);

        let mut segment = Segment::open(dir.path(), 0).unwrap();
        let last = segment.recover().unwrap();
        assert_eq!(last, Some(0));

        // A fresh append after recovery lands where the torn frame was.
        segment.append(&message(1, "next")).unwrap();
        let mut out = Vec::new();
        segment.read_from(0, usize::MAX, &mut out).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_truncate_to() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::open(dir.path(), 0).unwrap();
        for i in 0..10 {
            segment.append(&message(i, "x")).unwrap();
        }

        segment.truncate_to(4).unwrap();

        let mut out = Vec::new();
        segment.read_from(0, usize::MAX, &mut out).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out.last().unwrap().offset, 3);

        // Truncating past the end is a no-op.
        segment.truncate_to(100).unwrap();
        let mut out = Vec::new();
        segment.read_from(0, usize::MAX, &mut out).unwrap();
        assert_eq!(out.len(), 4);
    }
}
