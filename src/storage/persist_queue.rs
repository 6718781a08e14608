use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::storage::QueueStore;
use crate::utils::errors::{AgentError, Result};

/// Health counters for the pending-queue store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PersistHealth {
    pub store_file: String,
    pub recovered_total: u64,
    pub corrupt_fallback_total: u64,
    pub persist_write_failure_total: u64,
}

/// Crash-safe pending-upload queue: one JSON array of normalised paths,
/// rewritten atomically (same-directory temp file + rename) on every
/// mutation. Single-instance, single-writer.
///
/// Semantics are at-least-once: a crash between upload success and
/// `remove_one` replays the path on the next start.
pub struct PersistQueue {
    store_file: PathBuf,
    items: Mutex<Vec<String>>,
    recovered_total: AtomicU64,
    corrupt_fallback_total: AtomicU64,
    persist_write_failure_total: AtomicU64,
}

impl PersistQueue {
    /// Load the store, quarantining a corrupt file instead of refusing
    /// to start: the old bytes move to `<store>.corrupt-<nanos>.bak` and
    /// an empty store takes their place.
    pub async fn open(store_file: &Path) -> Result<Self> {
        if let Some(parent) = store_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut corrupt_fallback_total = 0u64;
        let items: Vec<String> = match fs::read(store_file).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(items) => items,
                Err(e) => {
                    let quarantine = format!(
                        "{}.corrupt-{}.bak",
                        store_file.display(),
                        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
                    );
                    warn!(
                        "Pending-queue store is corrupt ({}), quarantining to {}",
                        e, quarantine
                    );
                    fs::rename(store_file, &quarantine).await?;
                    corrupt_fallback_total = 1;
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let queue = Self {
            store_file: store_file.to_path_buf(),
            recovered_total: AtomicU64::new(items.len() as u64),
            corrupt_fallback_total: AtomicU64::new(corrupt_fallback_total),
            persist_write_failure_total: AtomicU64::new(0),
            items: Mutex::new(items),
        };

        if corrupt_fallback_total > 0 {
            queue.rewrite(&[]).await?;
        }
        let recovered = queue.recovered_total.load(Ordering::Relaxed);
        if recovered > 0 {
            info!(
                "Recovered {} pending uploads from {}",
                recovered,
                store_file.display()
            );
        }
        Ok(queue)
    }

    pub async fn append(&self, payload: &str) -> Result<()> {
        let mut items = self.items.lock().await;
        items.push(payload.to_string());
        self.rewrite(&items).await
    }

    /// Remove the first occurrence of `payload`. Unknown payloads are a
    /// no-op with a log line, never an error.
    pub async fn remove_one(&self, payload: &str) -> Result<()> {
        let mut items = self.items.lock().await;
        match items.iter().position(|item| item == payload) {
            Some(index) => {
                items.remove(index);
                self.rewrite(&items).await
            }
            None => {
                warn!("remove_one: {} not present in pending queue", payload);
                Ok(())
            }
        }
    }

    /// Remove and return the head of the queue.
    pub async fn dequeue(&self) -> Result<Option<String>> {
        let mut items = self.items.lock().await;
        if items.is_empty() {
            return Ok(None);
        }
        let head = items.remove(0);
        self.rewrite(&items).await?;
        Ok(Some(head))
    }

    pub async fn peek(&self) -> Vec<String> {
        self.items.lock().await.clone()
    }

    pub async fn reset(&self) -> Result<()> {
        let mut items = self.items.lock().await;
        items.clear();
        self.rewrite(&items).await
    }

    pub fn health(&self) -> PersistHealth {
        PersistHealth {
            store_file: self.store_file.display().to_string(),
            recovered_total: self.recovered_total.load(Ordering::Relaxed),
            corrupt_fallback_total: self.corrupt_fallback_total.load(Ordering::Relaxed),
            persist_write_failure_total: self.persist_write_failure_total.load(Ordering::Relaxed),
        }
    }

    /// Atomic replace: serialise to a sibling temp file, then rename
    /// over the store. Every failure is counted before it bubbles.
    async fn rewrite(&self, items: &[String]) -> Result<()> {
        let result: Result<()> = async {
            let bytes = serde_json::to_vec(items)?;
            let tmp = self.store_file.with_extension("swap");
            fs::write(&tmp, &bytes).await?;
            fs::rename(&tmp, &self.store_file).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.persist_write_failure_total.fetch_add(1, Ordering::Relaxed);
            return Err(AgentError::Persist(e.to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl QueueStore for PersistQueue {
    async fn append(&self, payload: &str) -> Result<()> {
        PersistQueue::append(self, payload).await
    }

    async fn remove_one(&self, payload: &str) -> Result<()> {
        PersistQueue::remove_one(self, payload).await
    }

    async fn peek(&self) -> Vec<String> {
        PersistQueue::peek(self).await
    }

    async fn reset(&self) -> Result<()> {
        PersistQueue::reset(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn append_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("queue.json");

        let queue = PersistQueue::open(&store).await.unwrap();
        queue.append("/w/a.log").await.unwrap();
        queue.append("/w/b.log").await.unwrap();
        drop(queue);

        let reopened = PersistQueue::open(&store).await.unwrap();
        assert_eq!(reopened.peek().await, vec!["/w/a.log", "/w/b.log"]);
        assert_eq!(reopened.health().recovered_total, 2);
    }

    #[tokio::test]
    async fn remove_one_restores_prior_contents() {
        let dir = TempDir::new().unwrap();
        let queue = PersistQueue::open(&dir.path().join("queue.json")).await.unwrap();

        queue.append("/w/a.log").await.unwrap();
        let before = queue.peek().await;
        queue.append("/w/x.log").await.unwrap();
        queue.remove_one("/w/x.log").await.unwrap();
        assert_eq!(queue.peek().await, before);
    }

    #[tokio::test]
    async fn remove_one_takes_first_occurrence_only() {
        let dir = TempDir::new().unwrap();
        let queue = PersistQueue::open(&dir.path().join("queue.json")).await.unwrap();

        queue.append("/w/a.log").await.unwrap();
        queue.append("/w/b.log").await.unwrap();
        queue.append("/w/a.log").await.unwrap();
        queue.remove_one("/w/a.log").await.unwrap();
        assert_eq!(queue.peek().await, vec!["/w/b.log", "/w/a.log"]);
    }

    #[tokio::test]
    async fn dequeue_pops_head_in_order() {
        let dir = TempDir::new().unwrap();
        let queue = PersistQueue::open(&dir.path().join("queue.json")).await.unwrap();

        queue.append("/w/a.log").await.unwrap();
        queue.append("/w/b.log").await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap(), Some("/w/a.log".to_string()));
        assert_eq!(queue.dequeue().await.unwrap(), Some("/w/b.log".to_string()));
        assert_eq!(queue.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_store_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("queue.json");
        tokio::fs::write(&store, b"{bad").await.unwrap();

        let queue = PersistQueue::open(&store).await.unwrap();
        assert_eq!(queue.health().corrupt_fallback_total, 1);
        assert!(queue.peek().await.is_empty());

        // Quarantine file holds the original bytes; the store is empty.
        let mut quarantined = None;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("queue.json.corrupt-") && name.ends_with(".bak") {
                quarantined = Some(entry.path());
            }
        }
        let quarantined = quarantined.expect("quarantine file present");
        assert_eq!(tokio::fs::read(&quarantined).await.unwrap(), b"{bad");
        assert_eq!(tokio::fs::read(&store).await.unwrap(), b"[]");
    }

    #[tokio::test]
    async fn reset_truncates() {
        let dir = TempDir::new().unwrap();
        let queue = PersistQueue::open(&dir.path().join("queue.json")).await.unwrap();
        queue.append("/w/a.log").await.unwrap();
        queue.reset().await.unwrap();
        assert!(queue.peek().await.is_empty());
    }
}
