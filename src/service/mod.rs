//! The orchestrator. Owns the state/pool/uploader trio, wires the
//! watcher into the queue, enforces auto-upload gating and the one-shot
//! manual flag, and performs hot reconfiguration.

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{AgentConfig, ObjectStoreConfig};
use crate::notify::{LogNotifier, Notifier, UploadNotice, WebhookNotifier};
use crate::state::{DashboardSnapshot, RuntimeState, StatsSnapshot};
use crate::storage::{PersistHealth, PersistQueue, QueueStore};
use crate::upload::retry::normalise_reason;
use crate::upload::{JobHandler, ObjectPut, RetryPolicy, RetryUploader, S3ObjectStore, WorkerPool};
use crate::utils::errors::{AgentError, Result};
use crate::utils::paths;
use crate::watch::{DirWatcher, WatchEvent, WatchSettings};

/// Builds an object store client from connection settings. Injected so
/// tests can substitute in-memory stores.
pub type StoreFactory =
    Arc<dyn Fn(&ObjectStoreConfig) -> Result<Arc<dyn ObjectPut>> + Send + Sync>;

/// Fields the console may change at runtime. Everything else requires a
/// restart.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub watch_dirs: Option<String>,
    pub file_ext: Option<String>,
    pub silence: Option<String>,
    pub workers: Option<usize>,
    pub queue_size: Option<usize>,
    pub retry_delays: Option<String>,
    pub retry_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatcherHealth {
    pub subscribed_dirs: usize,
    pub degraded_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub queue: StatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist: Option<PersistHealth>,
    pub watcher: WatcherHealth,
}

/// The swappable component set. Reads grab clones of the Arcs under the
/// lock and act outside it.
struct ServiceInner {
    config: AgentConfig,
    state: Arc<RuntimeState>,
    pool: Arc<WorkerPool>,
}

pub struct FileService {
    inner: RwLock<ServiceInner>,
    watcher: Arc<DirWatcher>,
    manual_once: Arc<Mutex<HashSet<String>>>,
    notifier: Arc<dyn Notifier>,
    persist: Option<Arc<PersistQueue>>,
    store_factory: StoreFactory,
    config_file: Option<PathBuf>,
    host: String,
    started_at: Instant,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl FileService {
    /// Production wiring: S3 client plus the configured notifier.
    pub async fn new(config: AgentConfig, config_file: Option<PathBuf>) -> Result<Arc<Self>> {
        let notifier: Arc<dyn Notifier> = if config.notify.webhook_url.is_empty() {
            Arc::new(LogNotifier)
        } else {
            Arc::new(WebhookNotifier::new(config.notify.webhook_url.clone()))
        };
        let factory: StoreFactory = Arc::new(|cfg: &ObjectStoreConfig| {
            Ok(Arc::new(S3ObjectStore::new(cfg)?) as Arc<dyn ObjectPut>)
        });
        Self::with_parts(config, config_file, factory, notifier).await
    }

    /// Fully injected constructor; the seams are the object store and
    /// the notification hook.
    pub async fn with_parts(
        config: AgentConfig,
        config_file: Option<PathBuf>,
        store_factory: StoreFactory,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Arc<Self>> {
        let roots = config.watch_roots()?;
        let filter = config.watch_filter();
        let silence = config.silence_window()?;
        let host = paths::local_hostname();

        let persist = if config.queue.persist_enabled {
            Some(Arc::new(
                PersistQueue::open(Path::new(&config.queue.persist_file)).await?,
            ))
        } else {
            None
        };

        let state = Arc::new(RuntimeState::new(roots.clone(), filter.clone()));
        let manual_once = Arc::new(Mutex::new(HashSet::new()));

        let store = store_factory(&config.object_store)?;
        let uploader = Arc::new(RetryUploader::new(
            store,
            retry_policy(&config),
            roots.clone(),
            host.clone(),
            retry_hook(&state),
        ));
        let handler = make_handler(
            Arc::clone(&state),
            uploader,
            Arc::clone(&manual_once),
            Arc::clone(&notifier),
        );
        let pool = WorkerPool::new(
            config.queue.workers,
            config.queue.size,
            persist.clone().map(|p| p as Arc<dyn QueueStore>),
            handler,
        );

        let watcher = Arc::new(DirWatcher::new(WatchSettings {
            roots,
            filter,
            silence,
        }));

        Ok(Arc::new(Self {
            inner: RwLock::new(ServiceInner {
                config,
                state,
                pool,
            }),
            watcher,
            manual_once,
            notifier,
            persist,
            store_factory,
            config_file,
            host,
            started_at: Instant::now(),
            dispatcher: Mutex::new(None),
        }))
    }

    /// Start watching and dispatching, then replay any uploads that were
    /// pending when the previous process died.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.watcher.start().await?;

        if let Some(mut events) = self.watcher.take_events() {
            let service = Arc::clone(self);
            let handle = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    service.dispatch(event).await;
                }
                debug!("Watch event dispatcher stopped");
            });
            *self.dispatcher.lock().await = Some(handle);
        }

        if let Some(persist) = &self.persist {
            let pending = persist.peek().await;
            if !pending.is_empty() {
                info!("Replaying {} uploads pending from the previous run", pending.len());
                let (state, pool) = self.parts().await;
                for path in pending {
                    state.mark_queued(&path).await;
                    if let Err(e) = pool.requeue_file(&path).await {
                        warn!("Could not replay {}: {}", path, e);
                    }
                }
                state.set_queue_stats(pool.stats()).await;
            }
        }

        info!("File service started on host {}", self.host);
        Ok(())
    }

    /// Stop in reverse order: dispatcher, pool (graceful), watcher.
    pub async fn stop(&self) {
        if let Some(handle) = self.dispatcher.lock().await.take() {
            handle.abort();
        }

        let (config, pool) = {
            let inner = self.inner.read().await;
            (inner.config.clone(), Arc::clone(&inner.pool))
        };
        let timeout = Duration::from_secs(config.queue.shutdown_timeout_secs);
        if let Err(e) = pool.shutdown_graceful(timeout).await {
            warn!("Pool shutdown incomplete: {}", e);
        }

        self.watcher.close().await;
        info!("File service stopped");
    }

    async fn dispatch(self: &Arc<Self>, event: WatchEvent) {
        match event {
            WatchEvent::Completed(path) => {
                if let Err(e) = self.enqueue_auto(&path).await {
                    debug!("Auto enqueue of {} rejected: {}", path, e);
                }
            }
            WatchEvent::Ready(path) => {
                let upload_existing = {
                    let inner = self.inner.read().await;
                    inner.config.watch.upload_existing_on_start
                };
                if upload_existing {
                    if let Err(e) = self.enqueue_auto(&path).await {
                        debug!("Startup enqueue of {} rejected: {}", path, e);
                    }
                }
            }
        }
    }

    pub async fn enqueue_auto(&self, path: &str) -> Result<()> {
        self.enqueue(path, false).await
    }

    pub async fn enqueue_manual(&self, path: &str) -> Result<()> {
        self.enqueue(path, true).await
    }

    #[instrument(skip(self), fields(manual = manual))]
    async fn enqueue(&self, raw: &str, manual: bool) -> Result<()> {
        let path = paths::normalise(Path::new(raw));
        let (config, state, pool) = {
            let inner = self.inner.read().await;
            (
                inner.config.clone(),
                Arc::clone(&inner.state),
                Arc::clone(&inner.pool),
            )
        };

        let roots = config.watch_roots()?;
        if !roots.iter().any(|root| paths::is_under(root, &path)) {
            return Err(AgentError::PathOutsideRoot(path));
        }

        if manual {
            state.mark_manual_queued(&path).await;
            self.manual_once.lock().await.insert(path.clone());
        } else {
            if !state.auto_upload_enabled(&path).await {
                state.mark_skipped(&path).await;
                debug!("Auto upload disabled for {}, skipped", path);
                return Ok(());
            }
            state.mark_queued(&path).await;

            // Saturation shedding applies only to automatic traffic.
            let stats = pool.stats();
            if stats.saturation() >= config.queue.saturation_threshold {
                state.record_queue_shed(&path).await;
                warn!(
                    "Shedding {} at queue saturation {:.2}",
                    path,
                    stats.saturation()
                );
                return Err(AgentError::QueueSaturated);
            }
        }

        match pool.add_file(&path).await {
            Ok(()) => {
                state.set_queue_stats(pool.stats()).await;
                Ok(())
            }
            Err(AgentError::QueueFull) => {
                if manual {
                    self.manual_once.lock().await.remove(&path);
                }
                state.record_queue_full(&path).await;
                Err(AgentError::QueueFull)
            }
            Err(e) => {
                if manual {
                    self.manual_once.lock().await.remove(&path);
                }
                state.mark_failed(&path, &e.to_string()).await;
                Err(e)
            }
        }
    }

    pub async fn set_auto_upload(&self, path: &str, enabled: bool) -> Result<()> {
        let norm = paths::normalise(Path::new(path));
        let (config, state) = {
            let inner = self.inner.read().await;
            (inner.config.clone(), Arc::clone(&inner.state))
        };
        let roots = config.watch_roots()?;
        if !roots.iter().any(|root| paths::is_under(root, &norm)) {
            return Err(AgentError::PathOutsideRoot(norm));
        }
        state.set_auto_upload(&norm, enabled).await;
        info!("Auto upload for {} set to {}", norm, enabled);
        Ok(())
    }

    pub async fn stats(&self) -> StatsSnapshot {
        let (state, pool) = self.parts().await;
        state.set_queue_stats(pool.stats()).await;
        state.stats_snapshot().await
    }

    pub async fn dashboard(&self, refresh: bool) -> DashboardSnapshot {
        let (config, state, pool) = {
            let inner = self.inner.read().await;
            (
                inner.config.clone(),
                Arc::clone(&inner.state),
                Arc::clone(&inner.pool),
            )
        };
        state.set_queue_stats(pool.stats()).await;
        let stats = state.stats_snapshot().await;
        state.dashboard(&config, stats, refresh).await
    }

    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let queue = self.stats().await;
        HealthSnapshot {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            queue,
            persist: self.persist.as_ref().map(|p| p.health()),
            watcher: WatcherHealth {
                subscribed_dirs: self.watcher.subscribed_dir_count(),
                degraded_total: self.watcher.degraded_total(),
            },
        }
    }

    pub async fn current_config(&self) -> AgentConfig {
        self.inner.read().await.config.clone()
    }

    /// Hot reconfiguration. New components are built while the old ones
    /// keep serving; the swap is atomic under the lock; counters and
    /// history carry over. Construction or watcher failures roll back
    /// without touching the live trio.
    #[instrument(skip(self, patch))]
    pub async fn update_config(&self, patch: ConfigPatch) -> Result<AgentConfig> {
        let (old_config, old_state) = {
            let inner = self.inner.read().await;
            (inner.config.clone(), Arc::clone(&inner.state))
        };

        let mut merged = old_config.clone();
        apply_patch(&mut merged, &patch);
        merged
            .validate()
            .map_err(|e| AgentError::Config(e.to_string()))?;

        let roots = merged.watch_roots()?;
        let filter = merged.watch_filter();
        let silence = merged.silence_window()?;

        let new_state = Arc::new(RuntimeState::new(roots.clone(), filter.clone()));
        new_state.carry_over_from(&old_state).await;

        let store = (self.store_factory)(&merged.object_store)?;
        let uploader = Arc::new(RetryUploader::new(
            store,
            retry_policy(&merged),
            roots.clone(),
            self.host.clone(),
            retry_hook(&new_state),
        ));
        let handler = make_handler(
            Arc::clone(&new_state),
            uploader,
            Arc::clone(&self.manual_once),
            Arc::clone(&self.notifier),
        );
        let new_pool = WorkerPool::new(
            merged.queue.workers,
            merged.queue.size,
            self.persist.clone().map(|p| p as Arc<dyn QueueStore>),
            handler,
        );

        if let Err(e) = self
            .watcher
            .reset(WatchSettings {
                roots,
                filter,
                silence,
            })
            .await
        {
            error!("Watcher reset failed, rolling back: {}", e);
            let _ = new_pool.shutdown_graceful(Duration::from_secs(1)).await;
            if let (Ok(old_roots), Ok(old_silence)) =
                (old_config.watch_roots(), old_config.silence_window())
            {
                let _ = self
                    .watcher
                    .reset(WatchSettings {
                        roots: old_roots,
                        filter: old_config.watch_filter(),
                        silence: old_silence,
                    })
                    .await;
            }
            return Err(e);
        }

        let old_pool = {
            let mut inner = self.inner.write().await;
            let old_pool = Arc::clone(&inner.pool);
            inner.config = merged.clone();
            inner.state = Arc::clone(&new_state);
            inner.pool = Arc::clone(&new_pool);
            old_pool
        };
        new_state.set_queue_stats(new_pool.stats()).await;
        info!(
            "Reconfigured: workers={} queue={} silence={}",
            merged.queue.workers, merged.queue.size, merged.watch.silence
        );

        let timeout = Duration::from_secs(merged.queue.shutdown_timeout_secs);
        if let Err(e) = old_pool.shutdown_graceful(timeout).await {
            // The new trio is already live; pending items stay in the
            // persist store and replay on the next start.
            warn!("Old pool did not drain cleanly: {}", e);
        }

        if let Some(config_file) = &self.config_file {
            if let Err(e) = merged.save_runtime_overlay(config_file) {
                warn!("Could not persist runtime overlay: {}", e);
            }
        }

        Ok(merged)
    }

    async fn parts(&self) -> (Arc<RuntimeState>, Arc<WorkerPool>) {
        let inner = self.inner.read().await;
        (Arc::clone(&inner.state), Arc::clone(&inner.pool))
    }
}

fn retry_policy(config: &AgentConfig) -> RetryPolicy {
    RetryPolicy {
        enabled: config.retry.enabled,
        max_attempts: config.retry.max_attempts,
        delays: config.retry_delays(),
    }
}

fn retry_hook(state: &Arc<RuntimeState>) -> Arc<dyn Fn() + Send + Sync> {
    let state = Arc::clone(state);
    Arc::new(move || {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            state.incr_retry().await;
        });
    })
}

fn make_handler(
    state: Arc<RuntimeState>,
    uploader: Arc<RetryUploader>,
    manual_once: Arc<Mutex<HashSet<String>>>,
    notifier: Arc<dyn Notifier>,
) -> JobHandler {
    Arc::new(move |ctx: CancellationToken, path: String| {
        let state = Arc::clone(&state);
        let uploader = Arc::clone(&uploader);
        let manual_once = Arc::clone(&manual_once);
        let notifier = Arc::clone(&notifier);
        Box::pin(async move { process_file(ctx, path, state, uploader, manual_once, notifier).await })
    })
}

/// The worker-side half of the pipeline: consume the one-shot manual
/// flag, re-check gating, upload with retries, record the outcome.
async fn process_file(
    ctx: CancellationToken,
    path: String,
    state: Arc<RuntimeState>,
    uploader: Arc<RetryUploader>,
    manual_once: Arc<Mutex<HashSet<String>>>,
    notifier: Arc<dyn Notifier>,
) -> Result<()> {
    let manual = manual_once.lock().await.remove(&path);

    if !manual && !state.auto_upload_enabled(&path).await {
        state.mark_skipped(&path).await;
        return Ok(());
    }

    match uploader.upload(&ctx, &path).await {
        Ok(outcome) => {
            state
                .mark_uploaded(&path, &outcome.url, outcome.latency, manual)
                .await;
            let notice = UploadNotice::success(&path, &outcome.url);
            match notifier.notify(&notice).await {
                Ok(()) => state.attach_notification(notifier.kind()).await,
                Err(e) => warn!("Post-upload notification failed for {}: {}", path, e),
            }
            Ok(())
        }
        Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
        Err(e) => {
            let reason = match &e {
                AgentError::Upload(reason) => reason.clone(),
                other => normalise_reason(&other.to_string()),
            };
            state.record_upload_failure(&reason).await;
            state.mark_failed(&path, &reason).await;
            Err(e)
        }
    }
}

fn apply_patch(config: &mut AgentConfig, patch: &ConfigPatch) {
    if let Some(dirs) = &patch.watch_dirs {
        config.watch.dirs = dirs.clone();
    }
    if let Some(ext) = &patch.file_ext {
        config.watch.extensions = ext.clone();
    }
    if let Some(silence) = &patch.silence {
        config.watch.silence = silence.clone();
    }
    if let Some(workers) = patch.workers {
        config.queue.workers = workers;
    }
    if let Some(size) = patch.queue_size {
        config.queue.size = size;
    }
    if let Some(delays) = &patch.retry_delays {
        config.retry.delays = delays.clone();
    }
    if let Some(enabled) = patch.retry_enabled {
        config.retry.enabled = enabled;
    }
}
