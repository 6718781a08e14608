//! On-demand dashboard aggregation.
//!
//! Snapshots merge the disk tree with runtime state and the ring
//! buffers. Assembly walks the watch roots, so results are cached for a
//! couple of seconds; `refresh=true` bypasses the cache.

use chrono::{DateTime, Utc};
use serde::Serialize;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::state::{resolve_auto, ChartPoint, FileState, RuntimeState, StatsSnapshot, UploadRecord};
use crate::utils::paths;
use crate::watch::WatchFilter;

const DASHBOARD_CACHE_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct HeroCopy {
    pub title: String,
    pub subtitle: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricCard {
    pub label: String,
    pub value: String,
    pub hint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirNode {
    pub name: String,
    pub path: String,
    pub auto_upload: bool,
    pub file_count: usize,
    pub children: Vec<DirNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSummary {
    pub roots: Vec<String>,
    pub extensions: String,
    pub silence: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub backlog: usize,
    pub persist_enabled: bool,
}

/// Operator-visible configuration; credentials never appear here.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub watch_dirs: String,
    pub extensions: String,
    pub silence: String,
    pub workers: usize,
    pub queue_size: usize,
    pub retry_enabled: bool,
    pub retry_delays: String,
    pub endpoint: String,
    pub bucket: String,
}

impl ConfigSnapshot {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            watch_dirs: config.watch.dirs.clone(),
            extensions: config.watch.extensions.clone(),
            silence: config.watch.silence.clone(),
            workers: config.queue.workers,
            queue_size: config.queue.size,
            retry_enabled: config.retry.enabled,
            retry_delays: config.retry.delays.clone(),
            endpoint: config.object_store.endpoint.clone(),
            bucket: config.object_store.bucket.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub hero: HeroCopy,
    pub metric_cards: Vec<MetricCard>,
    pub directory_tree: Vec<DirNode>,
    pub file_items: Vec<FileState>,
    pub upload_records: Vec<UploadRecord>,
    pub monitor_summary: MonitorSummary,
    pub config: ConfigSnapshot,
    pub chart_points: Vec<ChartPoint>,
}

impl RuntimeState {
    pub async fn dashboard(
        &self,
        config: &AgentConfig,
        stats: StatsSnapshot,
        refresh: bool,
    ) -> DashboardSnapshot {
        if !refresh {
            if let Some(cached) = self.dash_cache_get(DASHBOARD_CACHE_TTL).await {
                return cached;
            }
        }

        let overrides = self.auto_overrides_snapshot().await;
        let directory_tree = self
            .roots()
            .iter()
            .filter_map(|root| scan_dir_node(root, self.filter(), &overrides))
            .collect();

        let file_items = self.file_states().await;
        let upload_records = self.upload_history().await;
        let chart_points = self.chart_points().await;

        let snapshot = DashboardSnapshot {
            hero: HeroCopy {
                title: "Updrift delivery agent".to_string(),
                subtitle: format!(
                    "{} on {} — {} roots, {} files tracked",
                    env!("CARGO_PKG_VERSION"),
                    paths::local_hostname(),
                    self.roots().len(),
                    file_items.len()
                ),
                generated_at: Utc::now(),
            },
            metric_cards: metric_cards(&stats),
            directory_tree,
            file_items,
            upload_records,
            monitor_summary: MonitorSummary {
                roots: self.roots().to_vec(),
                extensions: config.watch.extensions.clone(),
                silence: config.watch.silence.clone(),
                workers: stats.workers,
                queue_capacity: stats.queue_capacity,
                backlog: stats.backlog,
                persist_enabled: config.queue.persist_enabled,
            },
            config: ConfigSnapshot::from_config(config),
            chart_points,
        };

        self.dash_cache_put(snapshot.clone()).await;
        snapshot
    }
}

fn metric_cards(stats: &StatsSnapshot) -> Vec<MetricCard> {
    vec![
        MetricCard {
            label: "Uploaded today".to_string(),
            value: stats.today_uploaded.to_string(),
            hint: "successful deliveries since midnight".to_string(),
        },
        MetricCard {
            label: "Failed today".to_string(),
            value: stats.today_failed.to_string(),
            hint: "failures since midnight".to_string(),
        },
        MetricCard {
            label: "Queue depth".to_string(),
            value: stats.backlog.to_string(),
            hint: format!("{} queued + {} in flight", stats.queue_length, stats.in_flight),
        },
        MetricCard {
            label: "Workers".to_string(),
            value: stats.workers.to_string(),
            hint: format!("queue capacity {}", stats.queue_capacity),
        },
        MetricCard {
            label: "Retries".to_string(),
            value: stats.retry_total.to_string(),
            hint: format!("{} uploads exhausted all attempts", stats.upload_failure_total),
        },
    ]
}

/// Merge a root's on-disk shape with the toggle tree. Unreadable
/// directories simply disappear from the view.
fn scan_dir_node(
    dir: &str,
    filter: &WatchFilter,
    overrides: &HashMap<String, bool>,
) -> Option<DirNode> {
    let path = Path::new(dir);
    if !path.is_dir() || filter.dir_excluded(dir) {
        return None;
    }

    let mut file_count = 0;
    let mut children = Vec::new();
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let child = paths::normalise(&entry.path());
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => {
                    if let Some(node) = scan_dir_node(&child, filter, overrides) {
                        children.push(node);
                    }
                }
                Ok(kind) if kind.is_file() => {
                    if filter.accepts_file(&child) {
                        file_count += 1;
                    }
                }
                _ => {}
            }
        }
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));

    Some(DirNode {
        name: dir.rsplit('/').next().unwrap_or(dir).to_string(),
        path: dir.to_string(),
        auto_upload: resolve_auto(overrides, dir),
        file_count,
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::PoolStats;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.watch.dirs = dir.path().to_string_lossy().into_owned();
        config
    }

    async fn state_for(dir: &TempDir) -> RuntimeState {
        RuntimeState::new(vec![paths::normalise(dir.path())], WatchFilter::default())
    }

    #[tokio::test]
    async fn dashboard_merges_tree_and_state() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("app/a.log"), b"x").unwrap();

        let state = state_for(&dir).await;
        state.set_auto_upload(&paths::normalise(&dir.path().join("app")), false).await;
        state.set_queue_stats(PoolStats::default()).await;

        let stats = state.stats_snapshot().await;
        let snapshot = state.dashboard(&config_for(&dir), stats, true).await;

        assert_eq!(snapshot.directory_tree.len(), 1);
        let root = &snapshot.directory_tree[0];
        assert!(root.auto_upload);
        assert_eq!(root.children.len(), 1);
        assert!(!root.children[0].auto_upload);
        assert_eq!(root.children[0].file_count, 1);
        assert_eq!(snapshot.file_items.len(), 1);
        assert_eq!(snapshot.metric_cards.len(), 5);
    }

    #[tokio::test]
    async fn dashboard_cache_serves_until_refresh() {
        let dir = TempDir::new().unwrap();
        let state = state_for(&dir).await;
        let config = config_for(&dir);

        let stats = state.stats_snapshot().await;
        let first = state.dashboard(&config, stats.clone(), false).await;

        // A new file appears on disk but the cached view stays.
        fs::write(dir.path().join("late.log"), b"x").unwrap();
        let cached = state.dashboard(&config, stats.clone(), false).await;
        assert_eq!(
            cached.hero.generated_at, first.hero.generated_at,
            "cached snapshot should be returned verbatim"
        );

        let fresh = state.dashboard(&config, stats, true).await;
        assert_eq!(fresh.directory_tree[0].file_count, 1);
    }

    #[tokio::test]
    async fn secrets_never_reach_the_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&dir);
        config.object_store.access_key = "AKIA-secret".to_string();
        config.object_store.secret_key = "very-secret".to_string();

        let state = state_for(&dir).await;
        let stats = state.stats_snapshot().await;
        let snapshot = state.dashboard(&config, stats, true).await;
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("AKIA-secret"));
        assert!(!json.contains("very-secret"));
    }
}
