use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use crate::routing::K;

/// Construction-time settings for a [`crate::network::KademliaNode`].
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub bind_addr: SocketAddrV4,
    /// Capacity of each k-bucket.
    pub bucket_size: usize,
    /// Threads handling decoded datagrams.
    pub workers: usize,
    /// Decoded datagrams waiting for a worker; beyond this they are dropped.
    pub inbound_queue: usize,
    pub request_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080),
            bucket_size: K,
            workers: default_workers(),
            inbound_queue: 1024,
            request_timeout: Duration::from_secs(1),
        }
    }
}

impl NodeConfig {
    pub fn with_bind_addr(bind_addr: SocketAddrV4) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }
}

// Minus 2 for the receiver and sender threads
pub fn default_workers() -> usize {
    num_cpus::get().saturating_sub(2).max(1)
}
