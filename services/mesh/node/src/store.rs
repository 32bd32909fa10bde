//! Node record persistence interface.

use async_trait::async_trait;

use crate::error::NodeError;
use crate::record::MeshNodeRecord;

/// Storage for provisioned node records, keyed by primary unicast address
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Record of the node owning `address` (any of its element addresses)
    async fn load(&self, address: u16) -> Result<Option<MeshNodeRecord>, NodeError>;

    /// Insert or replace a record
    async fn store(&self, record: MeshNodeRecord) -> Result<(), NodeError>;

    /// Remove a record by primary address, returning it
    async fn remove(&self, unicast_address: u16) -> Result<Option<MeshNodeRecord>, NodeError>;

    /// All records ordered by primary address
    async fn list(&self) -> Result<Vec<MeshNodeRecord>, NodeError>;
}
