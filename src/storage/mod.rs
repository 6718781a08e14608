pub mod persist_queue;

pub use persist_queue::{PersistHealth, PersistQueue};

use crate::utils::errors::Result;

/// Narrow capability contract for the pending-upload store. The worker
/// pool appends before handing work to the in-memory channel and
/// removes after a successful upload; everything else is operational.
#[async_trait::async_trait]
pub trait QueueStore: Send + Sync {
    async fn append(&self, payload: &str) -> Result<()>;
    async fn remove_one(&self, payload: &str) -> Result<()>;
    async fn peek(&self) -> Vec<String>;
    async fn reset(&self) -> Result<()>;
}
