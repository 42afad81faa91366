//! # Vector Clock Store Contract
//!
//! Persistence interface for a node's own vector-clock snapshot, keyed by
//! `NodeId`. Implementations must be atomic at the file/record level so a
//! crash leaves either the prior or new snapshot, never a torn write.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::NodeId;
use crate::vector_clock::VectorClockSnapshot;

#[async_trait]
pub trait VectorClockStoreContract: Send + Sync {
    async fn save(&self, node: &NodeId, clock: &VectorClockSnapshot) -> Result<()>;
    async fn load(&self, node: &NodeId) -> Result<Option<VectorClockSnapshot>>;
    async fn has(&self, node: &NodeId) -> Result<bool>;
    async fn delete(&self, node: &NodeId) -> Result<bool>;
    async fn close(&self) -> Result<()>;
}
