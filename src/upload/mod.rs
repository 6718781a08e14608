pub mod pool;
pub mod retry;
pub mod s3;

pub use pool::{JobHandler, PoolStats, WorkerPool};
pub use retry::{RetryPolicy, RetryUploader, UploadOutcome};
pub use s3::{ObjectPut, S3ObjectStore};
