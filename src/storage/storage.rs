use dashmap::DashMap;

use crate::error::{KadError, Result};
use crate::network::MAX_VALUE_LEN;
use crate::routing::NodeId;

/// In-memory values served to find-value requests. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct Storage {
    values: DashMap<NodeId, Vec<u8>>,
}

impl Storage {
    pub fn new() -> Self {
        Storage::default()
    }

    pub fn get(&self, key: &NodeId) -> Option<Vec<u8>> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Values must fit in a single find-value reply.
    pub fn set(&self, key: NodeId, value: Vec<u8>) -> Result<()> {
        if value.len() > MAX_VALUE_LEN {
            return Err(KadError::ValueTooLarge(value.len()));
        }
        self.values.insert(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &NodeId) -> Option<Vec<u8>> {
        self.values.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
