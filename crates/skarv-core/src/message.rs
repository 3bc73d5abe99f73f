use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single record in a partition log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique offset within the partition
    pub offset: u64,

    /// Record key (optional, used for partitioning)
    pub key: Option<Bytes>,

    /// Record payload
    pub value: Bytes,

    /// Timestamp when the record was created
    pub timestamp: DateTime<Utc>,

    /// Optional headers for metadata
    pub headers: Vec<(String, Vec<u8>)>,
}

impl Message {
    /// Create a new message
    pub fn new(value: Bytes) -> Self {
        Self {
            offset: 0,
            key: None,
            value,
            timestamp: Utc::now(),
            headers: Vec::new(),
        }
    }

    /// Create a message with a key
    pub fn with_key(key: Bytes, value: Bytes) -> Self {
        Self {
            offset: 0,
            key: Some(key),
            value,
            timestamp: Utc::now(),
            headers: Vec::new(),
        }
    }

    /// Add a header to the message
    pub fn add_header(mut self, key: String, value: Vec<u8>) -> Self {
        self.headers.push((key, value));
        self
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
        Ok(postcard::from_bytes(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let msg = Message::with_key(Bytes::from("k"), Bytes::from("v"))
            .add_header("source".to_string(), b"test".to_vec());

        let bytes = msg.to_bytes().unwrap();
        let restored = Message::from_bytes(&bytes).unwrap();

        assert_eq!(restored.key, Some(Bytes::from("k")));
        assert_eq!(restored.value, Bytes::from("v"));
        assert_eq!(restored.headers.len(), 1);
    }
}
