//! In-memory node store for development and testing

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::NodeError;
use crate::record::MeshNodeRecord;
use crate::store::NodeStore;

/// In-memory node store
#[derive(Debug, Clone, Default)]
pub struct MemoryNodeStore {
    /// Primary unicast address -> record
    records: Arc<DashMap<u16, MeshNodeRecord>>,
    /// Serializes the overlap check with the insert
    write_lock: Arc<Mutex<()>>,
}

impl MemoryNodeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no records are stored
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn load(&self, address: u16) -> Result<Option<MeshNodeRecord>, NodeError> {
        if let Some(record) = self.records.get(&address) {
            return Ok(Some(record.clone()));
        }
        // Secondary element addresses resolve to their node
        Ok(self
            .records
            .iter()
            .find(|entry| entry.value().contains_address(address))
            .map(|entry| entry.value().clone()))
    }

    async fn store(&self, record: MeshNodeRecord) -> Result<(), NodeError> {
        let address = record.unicast_address();
        let _guard = self.write_lock.lock().await;
        let overlap = self.records.iter().any(|entry| {
            *entry.key() != address
                && (0..record.element_count())
                    .any(|i| entry.value().contains_address(address + u16::from(i)))
        });
        if overlap {
            return Err(NodeError::Store(format!(
                "elements of {:#06x} overlap an existing node",
                address
            )));
        }

        debug!(
            "Store node {:#06x} ({} element(s))",
            address,
            record.element_count()
        );
        self.records.insert(address, record);
        Ok(())
    }

    async fn remove(&self, unicast_address: u16) -> Result<Option<MeshNodeRecord>, NodeError> {
        let _guard = self.write_lock.lock().await;
        debug!("Remove node {:#06x}", unicast_address);
        Ok(self
            .records
            .remove(&unicast_address)
            .map(|(_, record)| record))
    }

    async fn list(&self) -> Result<Vec<MeshNodeRecord>, NodeError> {
        let mut records: Vec<MeshNodeRecord> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(|record| record.unicast_address());
        Ok(records)
    }
}
