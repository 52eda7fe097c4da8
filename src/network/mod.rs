pub mod kademlia_node;
pub mod message;
pub mod rpc;

pub use kademlia_node::KademliaNode;
pub use message::{MessageKind, RemoteNode, RpcMessage, RpcPayload};
pub use rpc::Transport;

// Every header carries this version; anything else is rejected on decode
pub const PROTOCOL_VERSION: u32 = 1;

// Largest value a find-value reply may carry
pub const MAX_VALUE_LEN: usize = 1024;

// Receive buffer size, comfortably above the largest valid message
pub const MAX_DATAGRAM_SIZE: usize = 1500;
