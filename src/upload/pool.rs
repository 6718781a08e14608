use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::storage::QueueStore;
use crate::utils::errors::{AgentError, Result};

/// Handler invoked by a worker for each dequeued path. Receives a child
/// of the pool's cancellation token so shutdown reaches into uploads.
pub type JobHandler =
    Arc<dyn Fn(CancellationToken, String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Point-in-time view of the pool. `backlog()` is what operators see as
/// queue depth.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub queue_length: usize,
    pub in_flight: usize,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl PoolStats {
    pub fn backlog(&self) -> usize {
        self.queue_length + self.in_flight
    }

    pub fn saturation(&self) -> f64 {
        if self.queue_capacity == 0 {
            return 1.0;
        }
        self.queue_length as f64 / self.queue_capacity as f64
    }
}

/// Bounded FIFO queue of upload paths with a fixed set of consumers.
///
/// When a [`QueueStore`] is attached, the store append happens before
/// the in-memory send and is reverted if the channel is full, and the
/// store entry is cleared only after the handler succeeds. Within one
/// process a payload reaches at most one worker at a time; across
/// crashes it may be processed again.
pub struct WorkerPool {
    tx: mpsc::Sender<String>,
    in_flight: Arc<AtomicUsize>,
    store: Option<Arc<dyn QueueStore>>,
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
    capacity: usize,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        workers: usize,
        queue_size: usize,
        store: Option<Arc<dyn QueueStore>>,
        handler: JobHandler,
    ) -> Arc<Self> {
        let workers = workers.max(1);
        let capacity = queue_size.max(1);
        let (tx, rx) = mpsc::channel::<String>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let token = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&rx),
                token.clone(),
                Arc::clone(&in_flight),
                store.clone(),
                handler.clone(),
            )));
        }
        info!("Worker pool started: {} workers, queue capacity {}", workers, capacity);

        Arc::new(Self {
            tx,
            in_flight,
            store,
            token,
            handles: Mutex::new(handles),
            workers,
            capacity,
            closed: AtomicBool::new(false),
        })
    }

    /// Non-blocking enqueue. Persist first, then send; a full channel
    /// reverts the persisted entry and reports `QueueFull`.
    pub async fn add_file(&self, payload: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::PoolShutdown);
        }
        if let Some(store) = &self.store {
            store.append(payload).await?;
        }
        match self.tx.try_send(payload.to_string()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.remove_one(payload).await {
                        warn!("Failed to revert persisted enqueue of {}: {}", payload, e);
                    }
                }
                Err(AgentError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AgentError::PoolShutdown),
        }
    }

    /// Enqueue a payload that is already present in the attached store
    /// (restart replay); the persist append is skipped. A full queue
    /// leaves the payload in the store for the next start.
    pub async fn requeue_file(&self, payload: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::PoolShutdown);
        }
        match self.tx.try_send(payload.to_string()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(AgentError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AgentError::PoolShutdown),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queue_length: self.capacity.saturating_sub(self.tx.capacity()),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            workers: self.workers,
            queue_capacity: self.capacity,
        }
    }

    /// Stop accepting, let queued and in-flight work finish, then stop
    /// the workers. If the backlog does not drain within `timeout` the
    /// pool context is cancelled anyway and an error is returned.
    pub async fn shutdown_graceful(&self, timeout: Duration) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let stats = self.stats();
            if stats.backlog() == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Pool drain exceeded {:?} with backlog {}, cancelling workers",
                    timeout,
                    stats.backlog()
                );
                self.token.cancel();
                return Err(AgentError::ShutdownTimeout(timeout));
            }
            debug!("Waiting for {} items to finish", stats.backlog());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.token.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().await);
        let grace = deadline
            .saturating_duration_since(tokio::time::Instant::now())
            .max(Duration::from_secs(1));
        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!("Worker pool drained and stopped");
                Ok(())
            }
            Err(_) => Err(AgentError::ShutdownTimeout(timeout)),
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
    token: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    store: Option<Arc<dyn QueueStore>>,
    handler: JobHandler,
) {
    loop {
        let payload = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => break,
                received = rx.recv() => match received {
                    Some(payload) => payload,
                    None => break,
                },
            }
        };

        in_flight.fetch_add(1, Ordering::SeqCst);
        let result = handler(token.child_token(), payload.clone()).await;
        in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(()) => {
                if let Some(store) = &store {
                    // Duplicate on restart is safer than loss: a failed
                    // removal is logged and processing continues.
                    if let Err(e) = store.remove_one(&payload).await {
                        warn!("Failed to clear {} from pending store: {}", payload, e);
                    }
                }
            }
            Err(e) => debug!("Worker {}: {} failed: {}", worker_id, payload, e),
        }
    }
    debug!("Worker {} stopped", worker_id);
}
