//! Broker identity and descriptors

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Unique broker identifier assigned by the cluster operator
pub type BrokerId = u32;

/// Descriptor for a broker referenced by a controller request, carrying the
/// address followers use to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerInfo {
    /// Unique broker identifier
    pub id: BrokerId,

    /// Replication traffic address
    pub addr: SocketAddr,
}

impl BrokerInfo {
    pub fn new(id: BrokerId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl std::fmt::Display for BrokerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "broker-{}@{}", self.id, self.addr)
    }
}
