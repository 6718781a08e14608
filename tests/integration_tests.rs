//! End-to-end scenarios: watcher through worker pool to the object
//! store, with persistence and restart replay.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::Notify;

use updrift::config::{AgentConfig, ObjectStoreConfig};
use updrift::notify::LogNotifier;
use updrift::service::{FileService, StoreFactory};
use updrift::upload::ObjectPut;
use updrift::utils::errors::Result as AgentResult;
use updrift::utils::paths;

/// In-memory object store recording keys; optionally parks every put
/// until the gate is released.
struct MemoryObjectStore {
    puts: AtomicU32,
    keys: std::sync::Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
}

impl MemoryObjectStore {
    fn open() -> Arc<Self> {
        Arc::new(Self {
            puts: AtomicU32::new(0),
            keys: std::sync::Mutex::new(Vec::new()),
            gate: None,
        })
    }

    fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            puts: AtomicU32::new(0),
            keys: std::sync::Mutex::new(Vec::new()),
            gate: Some(gate),
        })
    }
}

#[async_trait::async_trait]
impl ObjectPut for MemoryObjectStore {
    async fn put(&self, key: &str, _body: Vec<u8>, _content_type: &str) -> AgentResult<Option<String>> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(key.to_string());
        Ok(Some("etag".to_string()))
    }

    fn download_url(&self, key: &str) -> String {
        format!("memory://bucket/{key}")
    }
}

fn factory(store: Arc<MemoryObjectStore>) -> StoreFactory {
    Arc::new(move |_cfg: &ObjectStoreConfig| Ok(Arc::clone(&store) as Arc<dyn ObjectPut>))
}

fn agent_config(watch_dir: &TempDir) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.watch.dirs = watch_dir.path().to_string_lossy().into_owned();
    config.watch.extensions = ".log".to_string();
    config.watch.silence = "1s".to_string();
    config.queue.workers = 1;
    config.queue.size = 8;
    config.queue.persist_enabled = false;
    config.retry.enabled = false;
    config
}

async fn wait_for_puts(store: &MemoryObjectStore, expected: u32, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while store.puts.load(Ordering::SeqCst) < expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {} uploads, saw {}",
            expected,
            store.puts.load(Ordering::SeqCst)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn auto_upload_completes_one_file() {
    let watch_dir = TempDir::new().unwrap();
    let store = MemoryObjectStore::open();
    let service = FileService::with_parts(
        agent_config(&watch_dir),
        None,
        factory(Arc::clone(&store)),
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    service.start().await.unwrap();

    std::fs::create_dir(watch_dir.path().join("app")).unwrap();
    std::fs::write(watch_dir.path().join("app/a.log"), b"x").unwrap();

    // One silence window later the file is delivered exactly once.
    wait_for_puts(&store, 1, Duration::from_secs(10)).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(store.puts.load(Ordering::SeqCst), 1);

    let keys = store.keys.lock().unwrap().clone();
    assert!(keys[0].ends_with("/app/a.log"), "unexpected key {}", keys[0]);

    let stats = service.stats().await;
    assert_eq!(stats.today_uploaded, 1);
    assert_eq!(stats.backlog, 0);

    let dashboard = service.dashboard(true).await;
    assert_eq!(dashboard.upload_records.len(), 1);
    assert_eq!(dashboard.upload_records[0].file, "a.log");

    service.stop().await;
}

#[tokio::test]
async fn pending_uploads_survive_restart() {
    let watch_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let persist_file = store_dir.path().join("q.json");
    let file = watch_dir.path().join("b.log");
    std::fs::write(&file, b"payload").unwrap();

    let mut config = agent_config(&watch_dir);
    config.queue.persist_enabled = true;
    config.queue.persist_file = persist_file.to_string_lossy().into_owned();

    // First life: the worker is parked, so the enqueue lands in the
    // store and the "crash" (drop) leaves it there.
    {
        let gate = Arc::new(Notify::new());
        let blocked = MemoryObjectStore::gated(gate);
        let service = FileService::with_parts(
            config.clone(),
            None,
            factory(blocked),
            Arc::new(LogNotifier),
        )
        .await
        .unwrap();

        service.enqueue_auto(&paths::normalise(&file)).await.unwrap();
        let pending = std::fs::read_to_string(&persist_file).unwrap();
        assert!(pending.contains("b.log"));
    }

    // Second life replays the store and clears it after success.
    let store = MemoryObjectStore::open();
    let service = FileService::with_parts(
        config,
        None,
        factory(Arc::clone(&store)),
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();

    let health = service.health_snapshot().await;
    let persist = health.persist.expect("persistence enabled");
    assert_eq!(persist.recovered_total, 1);

    service.start().await.unwrap();
    wait_for_puts(&store, 1, Duration::from_secs(10)).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let content = std::fs::read_to_string(&persist_file).unwrap();
        if content.trim() == "[]" {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "persist store still holds {content}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    service.stop().await;
}

#[tokio::test]
async fn corrupt_persist_store_is_quarantined_at_startup() {
    let watch_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let persist_file = store_dir.path().join("q.json");
    std::fs::write(&persist_file, b"{bad").unwrap();

    let mut config = agent_config(&watch_dir);
    config.queue.persist_enabled = true;
    config.queue.persist_file = persist_file.to_string_lossy().into_owned();

    let store = MemoryObjectStore::open();
    let service = FileService::with_parts(
        config,
        None,
        factory(Arc::clone(&store)),
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    service.start().await.unwrap();

    let health = service.health_snapshot().await;
    let persist = health.persist.expect("persistence enabled");
    assert_eq!(persist.corrupt_fallback_total, 1);
    assert_eq!(health.status, "ok");

    // Original bytes are preserved next to the fresh empty store.
    let quarantined = std::fs::read_dir(store_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with("q.json.corrupt-") && name.ends_with(".bak")
        })
        .expect("quarantine file present");
    assert_eq!(std::fs::read(quarantined.path()).unwrap(), b"{bad");
    assert_eq!(std::fs::read_to_string(&persist_file).unwrap(), "[]");

    // The agent still accepts and delivers work.
    let file = watch_dir.path().join("fresh.log");
    std::fs::write(&file, b"x").unwrap();
    wait_for_puts(&store, 1, Duration::from_secs(10)).await;

    service.stop().await;
}

#[tokio::test]
async fn existing_files_upload_only_when_policy_allows() {
    let opt_out_dir = TempDir::new().unwrap();
    std::fs::write(opt_out_dir.path().join("old.log"), b"x").unwrap();

    let store = MemoryObjectStore::open();
    let service = FileService::with_parts(
        agent_config(&opt_out_dir),
        None,
        factory(Arc::clone(&store)),
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    service.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Default policy: recorded as existing, never uploaded.
    assert_eq!(store.puts.load(Ordering::SeqCst), 0);
    let dashboard = service.dashboard(true).await;
    assert_eq!(dashboard.file_items.len(), 1);
    service.stop().await;

    // Opt-in policy enqueues bootstrap discoveries.
    let opt_in_dir = TempDir::new().unwrap();
    std::fs::write(opt_in_dir.path().join("old.log"), b"x").unwrap();
    let mut config = agent_config(&opt_in_dir);
    config.watch.upload_existing_on_start = true;

    let eager_store = MemoryObjectStore::open();
    let eager = FileService::with_parts(
        config,
        None,
        factory(Arc::clone(&eager_store)),
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    eager.start().await.unwrap();
    wait_for_puts(&eager_store, 1, Duration::from_secs(10)).await;
    eager.stop().await;
}
