pub mod config;
pub mod console;
pub mod notify;
pub mod service;
pub mod state;
pub mod storage;
pub mod upload;
pub mod utils;
pub mod watch;

pub use config::AgentConfig;
pub use console::ConsoleServer;
pub use notify::{LogNotifier, Notifier, UploadNotice, WebhookNotifier};
pub use service::{ConfigPatch, FileService, HealthSnapshot};
pub use state::{DashboardSnapshot, FileStatus, RuntimeState, StatsSnapshot};
pub use storage::{PersistQueue, QueueStore};
pub use upload::{ObjectPut, RetryPolicy, RetryUploader, S3ObjectStore, WorkerPool};
pub use utils::errors::{AgentError, Result};
pub use utils::setup_logging;
pub use watch::{DirWatcher, WatchEvent, WatchFilter, WatchSettings};
