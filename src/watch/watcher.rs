use notify::event::{CreateKind, ModifyKind};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::utils::errors::Result;
use crate::utils::paths;
use crate::watch::filter::WatchFilter;

/// What the watcher reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file that already existed when a root was bound.
    Ready(String),
    /// A file whose writes have been silent for the full window.
    Completed(String),
}

/// Everything the watcher needs to know about what to watch.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub roots: Vec<String>,
    pub filter: WatchFilter,
    pub silence: Duration,
}

/// Recursive, debounced directory watcher.
///
/// Each directory gets its own non-recursive subscription so exclusions
/// hold exactly; directories created later are subscribed on their
/// CREATE event. A per-path one-shot timer implements the silence
/// window: refreshed on every write, cancelled on remove/rename, and
/// emitting `Completed` when it survives the full window.
pub struct DirWatcher {
    settings: RwLock<WatchSettings>,
    fs_watcher: Mutex<Option<RecommendedWatcher>>,
    subscribed: Mutex<HashSet<String>>,
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    events_tx: mpsc::UnboundedSender<WatchEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
    raw_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<notify::Event>>>,
    raw_tx: mpsc::UnboundedSender<notify::Event>,
    pump: Mutex<Option<JoinHandle<()>>>,
    subscribed_dirs: AtomicUsize,
    degraded_total: AtomicU64,
}

impl DirWatcher {
    pub fn new(settings: WatchSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        Self {
            settings: RwLock::new(settings),
            fs_watcher: Mutex::new(None),
            subscribed: Mutex::new(HashSet::new()),
            timers: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            raw_rx: std::sync::Mutex::new(Some(raw_rx)),
            raw_tx,
            pump: Mutex::new(None),
            subscribed_dirs: AtomicUsize::new(0),
            degraded_total: AtomicU64::new(0),
        }
    }

    /// The single consumer side of the watcher's output. Callable once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<WatchEvent>> {
        self.events_rx.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Bind the OS watcher, walk every root, and start dispatching.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let tx = self.raw_tx.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if let Err(e) = tx.send(event) {
                        error!("Failed to forward file event: {}", e);
                    }
                }
                Err(e) => error!("File watcher error: {:?}", e),
            }
        })?;
        *self.fs_watcher.lock().await = Some(watcher);

        let roots = self.settings.read().await.roots.clone();
        for root in &roots {
            self.subscribe_tree(root, true, false).await;
        }
        info!(
            "Watcher bound to {} roots, {} directories subscribed",
            roots.len(),
            self.subscribed_dirs.load(Ordering::Relaxed)
        );

        let raw_rx = self
            .raw_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(mut raw_rx) = raw_rx {
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move {
                while let Some(event) = raw_rx.recv().await {
                    this.handle_raw_event(event).await;
                }
                debug!("Watcher event pump stopped");
            });
            *self.pump.lock().await = Some(handle);
        }

        Ok(())
    }

    /// Re-bind subscriptions to a new configuration without touching the
    /// output channel. Pre-existing files are not re-announced.
    pub async fn reset(&self, settings: WatchSettings) -> Result<()> {
        {
            let mut guard = self.fs_watcher.lock().await;
            if let Some(watcher) = guard.as_mut() {
                let mut subscribed = self.subscribed.lock().await;
                for dir in subscribed.drain() {
                    if let Err(e) = watcher.unwatch(Path::new(&dir)) {
                        debug!("Unwatch {} failed during reset: {}", dir, e);
                    }
                }
            }
        }
        self.subscribed_dirs.store(0, Ordering::Relaxed);
        self.cancel_all_timers().await;

        *self.settings.write().await = settings;

        let roots = self.settings.read().await.roots.clone();
        for root in &roots {
            self.subscribe_tree(root, false, false).await;
        }
        info!(
            "Watcher reset to {} roots, {} directories subscribed",
            roots.len(),
            self.subscribed_dirs.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// Drop every subscription and stop dispatching.
    pub async fn close(&self) {
        if let Some(handle) = self.pump.lock().await.take() {
            handle.abort();
        }
        self.cancel_all_timers().await;
        *self.fs_watcher.lock().await = None;
        self.subscribed.lock().await.clear();
        self.subscribed_dirs.store(0, Ordering::Relaxed);
        info!("Watcher closed");
    }

    pub fn subscribed_dir_count(&self) -> usize {
        self.subscribed_dirs.load(Ordering::Relaxed)
    }

    /// Subscriptions refused by the OS (EMFILE and friends). Non-zero
    /// means coverage is partial.
    pub fn degraded_total(&self) -> u64 {
        self.degraded_total.load(Ordering::Relaxed)
    }

    async fn handle_raw_event(&self, event: notify::Event) {
        let settings = self.settings.read().await.clone();
        for path in &event.paths {
            let norm = paths::normalise(path);
            if settings.filter.dir_excluded(&norm) {
                continue;
            }
            match event.kind {
                EventKind::Create(CreateKind::Folder) => {
                    self.subscribe_tree(&norm, false, true).await;
                }
                EventKind::Create(_) => {
                    if path.is_dir() {
                        self.subscribe_tree(&norm, false, true).await;
                    } else if settings.filter.accepts_file(&norm) {
                        self.schedule_timer(norm.clone(), settings.silence).await;
                    }
                }
                EventKind::Modify(ModifyKind::Name(_)) | EventKind::Remove(_) => {
                    self.cancel_timer(&norm).await;
                }
                EventKind::Modify(ModifyKind::Metadata(_)) => {}
                EventKind::Modify(_) => {
                    if settings.filter.accepts_file(&norm) && !path.is_dir() {
                        self.schedule_timer(norm.clone(), settings.silence).await;
                    }
                }
                _ => {}
            }
        }
    }

    /// Walk a directory, subscribing every non-excluded dir beneath it.
    /// Files found along the way are either announced as `Ready`
    /// (initial bind) or debounced as fresh writes (dir created while
    /// running).
    async fn subscribe_tree(&self, root: &str, emit_ready: bool, files_as_writes: bool) {
        let settings = self.settings.read().await.clone();
        if settings.filter.dir_excluded(root) {
            return;
        }

        let filter = settings.filter.clone();
        let walker = WalkDir::new(root).follow_links(false).into_iter();
        for entry in walker.filter_entry(|e| {
            !(e.file_type().is_dir() && filter.dir_excluded(&paths::normalise(e.path())))
        }) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", root, e);
                    continue;
                }
            };
            let norm = paths::normalise(entry.path());
            if entry.file_type().is_dir() {
                self.watch_dir(&norm).await;
            } else if settings.filter.accepts_file(&norm) {
                if emit_ready {
                    let _ = self.events_tx.send(WatchEvent::Ready(norm));
                } else if files_as_writes {
                    self.schedule_timer(norm, settings.silence).await;
                }
            }
        }
    }

    // Lock order is fs_watcher then subscribed, matching reset().
    async fn watch_dir(&self, dir: &str) {
        let mut guard = self.fs_watcher.lock().await;
        let Some(watcher) = guard.as_mut() else {
            return;
        };
        let mut subscribed = self.subscribed.lock().await;
        if subscribed.contains(dir) {
            return;
        }
        match watcher.watch(Path::new(dir), RecursiveMode::NonRecursive) {
            Ok(()) => {
                subscribed.insert(dir.to_string());
                self.subscribed_dirs.store(subscribed.len(), Ordering::Relaxed);
                debug!("Subscribed to directory: {}", dir);
            }
            Err(e) => {
                let exhausted = matches!(e.kind, notify::ErrorKind::MaxFilesWatch)
                    || matches!(&e.kind, notify::ErrorKind::Io(io) if io.raw_os_error() == Some(24));
                if exhausted {
                    self.degraded_total.fetch_add(1, Ordering::Relaxed);
                    warn!("Watch descriptor limit hit at {}, coverage degraded: {}", dir, e);
                } else {
                    warn!("Failed to subscribe to {}: {}", dir, e);
                }
            }
        }
    }

    /// One pending timer per path. A new write replaces the old timer,
    /// so `Completed` fires exactly once per silent window.
    async fn schedule_timer(&self, path: String, silence: Duration) {
        let mut timers = self.timers.lock().await;
        if let Some(previous) = timers.remove(&path) {
            previous.abort();
        }
        let timers_ref = Arc::clone(&self.timers);
        let tx = self.events_tx.clone();
        let key = path.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(silence).await;
            timers_ref.lock().await.remove(&key);
            if Path::new(&key).is_file() {
                let _ = tx.send(WatchEvent::Completed(key));
            }
        });
        timers.insert(path, handle);
    }

    async fn cancel_timer(&self, path: &str) {
        if let Some(handle) = self.timers.lock().await.remove(path) {
            handle.abort();
            debug!("Cancelled pending timer for {}", path);
        }
    }

    async fn cancel_all_timers(&self) {
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::fs;
    use tokio::time::{sleep, timeout};

    fn settings_for(dir: &TempDir, extensions: &str, silence_ms: u64) -> WatchSettings {
        WatchSettings {
            roots: vec![paths::normalise(dir.path())],
            filter: WatchFilter::new(extensions, &[]),
            silence: Duration::from_millis(silence_ms),
        }
    }

    async fn next_completed(
        rx: &mut mpsc::UnboundedReceiver<WatchEvent>,
        wait: Duration,
    ) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, rx.recv()).await {
                Ok(Some(WatchEvent::Completed(path))) => return Some(path),
                Ok(Some(WatchEvent::Ready(_))) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    #[tokio::test]
    async fn completed_fires_once_after_silence() {
        let dir = TempDir::new().unwrap();
        let watcher = Arc::new(DirWatcher::new(settings_for(&dir, ".log", 300)));
        let mut rx = watcher.take_events().unwrap();
        watcher.start().await.unwrap();

        let file = dir.path().join("a.log");
        fs::write(&file, "x").await.unwrap();

        let completed = next_completed(&mut rx, Duration::from_secs(3)).await;
        assert_eq!(completed, Some(paths::normalise(&file)));

        // No second event without further writes.
        assert!(next_completed(&mut rx, Duration::from_millis(700)).await.is_none());
        watcher.close().await;
    }

    #[tokio::test]
    async fn writes_refresh_the_window() {
        let dir = TempDir::new().unwrap();
        let watcher = Arc::new(DirWatcher::new(settings_for(&dir, "", 400)));
        let mut rx = watcher.take_events().unwrap();
        watcher.start().await.unwrap();

        let file = dir.path().join("streaming.bin");
        fs::write(&file, "1").await.unwrap();
        for chunk in 0..3 {
            sleep(Duration::from_millis(150)).await;
            fs::write(&file, format!("chunk-{chunk}")).await.unwrap();
        }
        // Still inside the refreshed window right after the last write.
        assert!(next_completed(&mut rx, Duration::from_millis(100)).await.is_none());
        // And exactly one completion once writes go quiet.
        let completed = next_completed(&mut rx, Duration::from_secs(3)).await;
        assert_eq!(completed, Some(paths::normalise(&file)));
        watcher.close().await;
    }

    #[tokio::test]
    async fn temp_suffixes_never_complete() {
        let dir = TempDir::new().unwrap();
        let watcher = Arc::new(DirWatcher::new(settings_for(&dir, "", 200)));
        let mut rx = watcher.take_events().unwrap();
        watcher.start().await.unwrap();

        fs::write(dir.path().join("download.part"), "x").await.unwrap();
        fs::write(dir.path().join("scratch.tmp"), "x").await.unwrap();

        assert!(next_completed(&mut rx, Duration::from_millis(900)).await.is_none());
        watcher.close().await;
    }

    #[tokio::test]
    async fn new_subdirectories_are_subscribed() {
        let dir = TempDir::new().unwrap();
        let watcher = Arc::new(DirWatcher::new(settings_for(&dir, ".log", 300)));
        let mut rx = watcher.take_events().unwrap();
        watcher.start().await.unwrap();

        let sub = dir.path().join("deep/nested");
        fs::create_dir_all(&sub).await.unwrap();
        sleep(Duration::from_millis(300)).await;

        let file = sub.join("late.log");
        fs::write(&file, "x").await.unwrap();

        let completed = next_completed(&mut rx, Duration::from_secs(3)).await;
        assert_eq!(completed, Some(paths::normalise(&file)));
        watcher.close().await;
    }

    #[tokio::test]
    async fn remove_cancels_pending_timer() {
        let dir = TempDir::new().unwrap();
        let watcher = Arc::new(DirWatcher::new(settings_for(&dir, "", 500)));
        let mut rx = watcher.take_events().unwrap();
        watcher.start().await.unwrap();

        let file = dir.path().join("gone.dat");
        fs::write(&file, "x").await.unwrap();
        sleep(Duration::from_millis(100)).await;
        fs::remove_file(&file).await.unwrap();

        assert!(next_completed(&mut rx, Duration::from_millis(1200)).await.is_none());
        watcher.close().await;
    }

    #[tokio::test]
    async fn existing_files_announced_ready() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("old.log"), "x").await.unwrap();

        let watcher = Arc::new(DirWatcher::new(settings_for(&dir, ".log", 200)));
        let mut rx = watcher.take_events().unwrap();
        watcher.start().await.unwrap();

        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(
            event,
            Some(WatchEvent::Ready(paths::normalise(&dir.path().join("old.log"))))
        );
        watcher.close().await;
    }

    #[tokio::test]
    async fn reset_rebinds_to_new_roots() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();

        let watcher = Arc::new(DirWatcher::new(settings_for(&first, ".log", 200)));
        let mut rx = watcher.take_events().unwrap();
        watcher.start().await.unwrap();

        watcher
            .reset(settings_for(&second, ".log", 200))
            .await
            .unwrap();
        sleep(Duration::from_millis(200)).await;

        fs::write(first.path().join("stale.log"), "x").await.unwrap();
        let file = second.path().join("fresh.log");
        fs::write(&file, "x").await.unwrap();

        let completed = next_completed(&mut rx, Duration::from_secs(3)).await;
        assert_eq!(completed, Some(paths::normalise(&file)));
        watcher.close().await;
    }
}
