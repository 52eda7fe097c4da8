//! Core of a Kademlia-style DHT node.
//!
//! - [`routing`]: 160-bit ids, XOR distance, the bucketed routing table
//! - [`network::message`]: the fixed-width big-endian wire codec
//! - [`network::rpc`]: datagram dispatch and message builders
//! - [`network::KademliaNode`]: a UDP-bound node tying them together
//! - [`storage`]: in-memory values answered to find-value requests

pub mod config;
pub mod error;
pub mod network;
pub mod routing;
pub mod storage;

pub use config::NodeConfig;
pub use error::{DecodeError, KadError, Result};
pub use network::KademliaNode;
pub use routing::{NodeId, RoutingTable};
