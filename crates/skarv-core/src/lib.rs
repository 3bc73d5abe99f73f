//! # Skarv Core
//!
//! Record and log storage primitives shared by the Skarv broker components:
//!
//! - [`Message`]: the record carried through partition logs
//! - [`Log`]: the append/read/truncate contract the replication layer consumes
//! - [`FileLog`]: a segmented, crash-recovering file-backed log
//! - [`LogManager`]: one log per hosted topic-partition under a data directory

pub mod error;
pub mod message;
pub mod storage;

pub use error::{Error, Result};
pub use message::Message;
pub use storage::{FileLog, Log, LogAppendInfo, LogManager};
