pub mod id;
pub mod routing_table;

pub use id::NodeId;
pub use routing_table::{AddOutcome, Peer, RoutingTable};

// Constants
pub const ID_LENGTH_BYTES: usize = 20;
pub const ID_LENGTH_BITS: usize = ID_LENGTH_BYTES * 8;

// One bucket per possible prefix length, 0..=160
pub const BUCKET_COUNT: usize = ID_LENGTH_BITS + 1;

// K represents the max nodes per k-bucket
pub const K: usize = 20;

// Alpha is the max number of nodes handed out per find-node answer
pub const ALPHA: usize = 7;
