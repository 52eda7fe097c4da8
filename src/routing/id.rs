// src/routing/id.rs
use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{ID_LENGTH_BITS, ID_LENGTH_BYTES};

/// The 160-bit identifier used for nodes, lookup keys and correlation tokens.
///
/// Only XOR distance and prefix length are meaningful comparisons; ids have no
/// total order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LENGTH_BYTES]);

impl NodeId {
    pub fn new(bytes: [u8; ID_LENGTH_BYTES]) -> Self {
        NodeId(bytes)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, String> {
        let bytes: [u8; ID_LENGTH_BYTES] = data.try_into().map_err(|_| {
            format!(
                "ID must be {} bytes, got {}",
                ID_LENGTH_BYTES,
                data.len()
            )
        })?;
        Ok(NodeId(bytes))
    }

    pub fn zero() -> Self {
        NodeId([0_u8; ID_LENGTH_BYTES])
    }

    /// Draws a fresh identifier from the thread-local CSPRNG.
    ///
    /// Used both for bootstrap identities and per-request correlation tokens.
    pub fn random_id() -> Self {
        NodeId(rand::random::<[u8; ID_LENGTH_BYTES]>())
    }

    /// Deterministic identifier: the first 20 bytes of SHA-256(seed).
    pub fn from_seed(seed: &[u8]) -> Self {
        let hash = Sha256::digest(seed);
        let mut bytes = [0_u8; ID_LENGTH_BYTES];
        bytes.copy_from_slice(&hash[..ID_LENGTH_BYTES]);
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH_BYTES] {
        &self.0
    }

    /// Zero-padded, 40 digit lowercase hex.
    pub fn as_hex_string(&self) -> String {
        format!(
            "{:0width$x}",
            BigUint::from_bytes_be(&self.0),
            width = ID_LENGTH_BYTES * 2
        )
    }

    /// Calculates the XOR distance between two IDs.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut out = [0_u8; ID_LENGTH_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(out)
    }

    /// Number of leading bits shared by both IDs, in `0..=160`.
    ///
    /// Finds the first differing byte, then the first differing bit inside it
    /// starting from the most significant one.
    pub fn prefix_length(&self, other: &NodeId) -> usize {
        match self.0.iter().zip(other.0.iter()).position(|(a, b)| a != b) {
            None => ID_LENGTH_BITS,
            Some(byte) => {
                let diff = self.0[byte] ^ other.0[byte];
                byte * 8 + diff.leading_zeros() as usize
            }
        }
    }

    /// Same identity, expressed through the prefix metric.
    pub fn matches(&self, other: &NodeId) -> bool {
        self.prefix_length(other) == ID_LENGTH_BITS
    }

    /// The bit at `position`, counting from the most significant bit.
    pub fn bit(&self, position: usize) -> bool {
        assert!(position < ID_LENGTH_BITS, "bit {position} out of range");
        (self.0[position / 8] >> (7 - position % 8)) & 1 == 1
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.as_hex_string()[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex_string())
    }
}
