use thiserror::Error;

use std::time::Duration;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("path is outside every watch root: {0}")]
    PathOutsideRoot(String),

    #[error("upload queue full")]
    QueueFull,

    #[error("upload queue saturated")]
    QueueSaturated,

    #[error("pending-queue store error: {0}")]
    Persist(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("file watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("file system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("worker pool drain exceeded {0:?}")]
    ShutdownTimeout(Duration),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// True for enqueue rejections that are expected under load and must
    /// not tear anything down.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, AgentError::QueueFull | AgentError::QueueSaturated)
    }
}
