pub mod dashboard;

use chrono::{DateTime, Local, NaiveDate, Utc};
use humansize::{file_size_opts, FileSize};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use walkdir::WalkDir;

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::upload::PoolStats;
use crate::utils::paths;
use crate::watch::WatchFilter;

pub use dashboard::DashboardSnapshot;

/// Upload history keeps this many rows.
pub const HISTORY_CAP: usize = 200;
/// Chart ring keeps this many sampled points.
pub const CHART_CAP: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Existing,
    Queued,
    Uploaded,
    Failed,
    Skipped,
}

/// Per-path lifecycle record. Created on first observation, mutated only
/// through the state API, never deleted while running.
#[derive(Debug, Clone, Serialize)]
pub struct FileState {
    pub path: String,
    pub name: String,
    pub modified: Option<DateTime<Utc>>,
    pub size: u64,
    pub auto_upload: bool,
    pub status: FileStatus,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
    pub last_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadResult {
    Success,
    Failed,
    Pending,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadRecord {
    pub file: String,
    pub path: String,
    pub target: String,
    pub size_human: String,
    pub result: UploadResult,
    pub latency_ms: u64,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Cumulative counters sampled at a moment in time; `queue` is the
/// backlog, not the raw channel length.
#[derive(Debug, Clone, Serialize)]
pub struct ChartPoint {
    pub label: String,
    pub uploads: u64,
    pub failures: u64,
    pub queue: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReason {
    pub reason: String,
    pub count: u64,
}

/// Operator-facing stats snapshot; `backlog` always equals
/// `queue_length + in_flight`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub queue_length: usize,
    pub in_flight: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    pub backlog: usize,
    pub queue_full_total: u64,
    pub queue_shed_total: u64,
    pub retry_total: u64,
    pub upload_failure_total: u64,
    pub today_uploaded: u64,
    pub today_failed: u64,
    pub failure_reasons: Vec<FailureReason>,
}

#[derive(Debug, Default)]
struct StateInner {
    files: HashMap<String, FileState>,
    auto_overrides: HashMap<String, bool>,
    day: Option<NaiveDate>,
    today_uploaded: u64,
    today_failed: u64,
    today_notified: HashMap<String, u64>,
    total_uploaded: u64,
    total_failed: u64,
    queue_full_total: u64,
    queue_shed_total: u64,
    retry_total: u64,
    upload_failure_total: u64,
    failure_reasons: HashMap<String, u64>,
    history: VecDeque<UploadRecord>,
    chart: VecDeque<ChartPoint>,
    queue: PoolStats,
}

/// Central thread-safe store of per-file lifecycle, counters and the
/// bounded history buffers. One lock; every read hands out copies.
pub struct RuntimeState {
    roots: Vec<String>,
    filter: WatchFilter,
    inner: RwLock<StateInner>,
    dash_cache: Mutex<Option<(Instant, DashboardSnapshot)>>,
}

impl RuntimeState {
    /// Build the state and bootstrap-scan every root so the dashboard
    /// has a file inventory before the first event arrives.
    pub fn new(roots: Vec<String>, filter: WatchFilter) -> Self {
        let mut files = HashMap::new();
        for root in &roots {
            let walker = WalkDir::new(root).follow_links(false).into_iter();
            let filter_ref = filter.clone();
            for entry in walker.filter_entry(move |e| {
                !(e.file_type().is_dir() && filter_ref.dir_excluded(&paths::normalise(e.path())))
            }) {
                let Ok(entry) = entry else { continue };
                if !entry.file_type().is_file() {
                    continue;
                }
                let norm = paths::normalise(entry.path());
                if !filter.accepts_file(&norm) {
                    continue;
                }
                let meta = entry.metadata().ok();
                files.insert(
                    norm.clone(),
                    FileState {
                        name: file_name(&norm),
                        path: norm,
                        modified: meta
                            .as_ref()
                            .and_then(|m| m.modified().ok())
                            .map(DateTime::<Utc>::from),
                        size: meta.map(|m| m.len()).unwrap_or(0),
                        auto_upload: true,
                        status: FileStatus::Existing,
                        last_error: None,
                        last_latency_ms: None,
                        last_url: None,
                    },
                );
            }
        }
        debug!("Bootstrap scan recorded {} files", files.len());

        Self {
            roots,
            filter,
            inner: RwLock::new(StateInner {
                files,
                day: Some(Local::now().date_naive()),
                ..StateInner::default()
            }),
            dash_cache: Mutex::new(None),
        }
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn filter(&self) -> &WatchFilter {
        &self.filter
    }

    pub async fn mark_queued(&self, path: &str) {
        self.mark_enqueued(path, false).await;
    }

    pub async fn mark_manual_queued(&self, path: &str) {
        self.mark_enqueued(path, true).await;
    }

    async fn mark_enqueued(&self, path: &str, manual: bool) {
        let (size, modified) = probe(path).await;
        let mut inner = self.inner.write().await;
        roll_day(&mut inner);
        let entry = ensure_entry(&mut inner.files, path, size, modified);
        entry.status = FileStatus::Queued;
        entry.last_error = None;
        let record = UploadRecord {
            file: file_name(path),
            path: path.to_string(),
            target: String::new(),
            size_human: human_size(size),
            result: UploadResult::Pending,
            latency_ms: 0,
            time: Utc::now(),
            note: manual.then(|| "manual".to_string()),
        };
        push_history(&mut inner.history, record);
        drop(inner);
        self.invalidate_dashboard().await;
    }

    pub async fn mark_uploaded(
        &self,
        path: &str,
        url: &str,
        latency: std::time::Duration,
        manual: bool,
    ) {
        let (size, modified) = probe(path).await;
        let latency_ms = latency.as_millis() as u64;
        let mut inner = self.inner.write().await;
        roll_day(&mut inner);
        let entry = ensure_entry(&mut inner.files, path, size, modified);
        entry.status = FileStatus::Uploaded;
        entry.last_error = None;
        entry.last_latency_ms = Some(latency_ms);
        entry.last_url = Some(url.to_string());
        inner.today_uploaded += 1;
        inner.total_uploaded += 1;

        let note = manual.then(|| "manual".to_string());
        if let Some(index) = pending_row(&inner.history, path) {
            let row = &mut inner.history[index];
            row.result = UploadResult::Success;
            row.target = url.to_string();
            row.latency_ms = latency_ms;
            row.size_human = human_size(size);
            row.time = Utc::now();
            row.note = note;
        } else {
            let record = UploadRecord {
                file: file_name(path),
                path: path.to_string(),
                target: url.to_string(),
                size_human: human_size(size),
                result: UploadResult::Success,
                latency_ms,
                time: Utc::now(),
                note,
            };
            push_history(&mut inner.history, record);
        }
        drop(inner);
        self.invalidate_dashboard().await;
    }

    pub async fn mark_failed(&self, path: &str, reason: &str) {
        let (size, modified) = probe(path).await;
        let mut inner = self.inner.write().await;
        roll_day(&mut inner);
        mark_failed_inner(&mut inner, path, reason, size, modified);
        drop(inner);
        self.invalidate_dashboard().await;
    }

    pub async fn mark_skipped(&self, path: &str) {
        let (size, modified) = probe(path).await;
        let mut inner = self.inner.write().await;
        let entry = ensure_entry(&mut inner.files, path, size, modified);
        entry.status = FileStatus::Skipped;
        drop(inner);
        self.invalidate_dashboard().await;
    }

    /// Count a fired notification by transport kind.
    pub async fn attach_notification(&self, kind: &str) {
        let mut inner = self.inner.write().await;
        roll_day(&mut inner);
        *inner.today_notified.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub async fn record_queue_full(&self, path: &str) {
        let (size, modified) = probe(path).await;
        let mut inner = self.inner.write().await;
        roll_day(&mut inner);
        inner.queue_full_total += 1;
        mark_failed_inner(&mut inner, path, "upload queue full", size, modified);
        drop(inner);
        self.invalidate_dashboard().await;
    }

    pub async fn record_queue_shed(&self, path: &str) {
        let (size, modified) = probe(path).await;
        let mut inner = self.inner.write().await;
        roll_day(&mut inner);
        inner.queue_shed_total += 1;
        mark_failed_inner(&mut inner, path, "upload queue saturated", size, modified);
        drop(inner);
        self.invalidate_dashboard().await;
    }

    pub async fn incr_retry(&self) {
        self.inner.write().await.retry_total += 1;
    }

    /// Bucket an exhausted upload's reason and bump the failure total.
    pub async fn record_upload_failure(&self, reason: &str) {
        let mut inner = self.inner.write().await;
        inner.upload_failure_total += 1;
        *inner.failure_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    /// Publish the latest pool view and sample a chart point. Chart
    /// counters are cumulative, the queue column is the backlog.
    pub async fn set_queue_stats(&self, stats: PoolStats) {
        let mut inner = self.inner.write().await;
        let point = ChartPoint {
            label: Local::now().format("%H:%M").to_string(),
            uploads: inner.total_uploaded,
            failures: inner.total_failed,
            queue: stats.backlog(),
        };
        inner.queue = stats;
        inner.chart.push_back(point);
        while inner.chart.len() > CHART_CAP {
            inner.chart.pop_front();
        }
    }

    /// Resolve the auto-upload toggle by walking up from `path` to the
    /// nearest explicitly configured ancestor. Default is on.
    pub async fn auto_upload_enabled(&self, path: &str) -> bool {
        let inner = self.inner.read().await;
        resolve_auto(&inner.auto_overrides, path)
    }

    /// Toggle a node; descendants lose their own overrides so the new
    /// value flows down the tree view.
    pub async fn set_auto_upload(&self, path: &str, enabled: bool) {
        let norm = paths::normalise(std::path::Path::new(path));
        let mut inner = self.inner.write().await;
        inner
            .auto_overrides
            .retain(|existing, _| !paths::is_under(&norm, existing));
        inner.auto_overrides.insert(norm, enabled);
        drop(inner);
        self.invalidate_dashboard().await;
    }

    /// Migrate counters, buffers and surviving file records from the
    /// outgoing state so reconfiguration is invisible to operators.
    pub async fn carry_over_from(&self, old: &RuntimeState) {
        let old_inner = old.inner.read().await;
        let mut inner = self.inner.write().await;
        inner.day = old_inner.day;
        inner.today_uploaded = old_inner.today_uploaded;
        inner.today_failed = old_inner.today_failed;
        inner.today_notified = old_inner.today_notified.clone();
        inner.total_uploaded = old_inner.total_uploaded;
        inner.total_failed = old_inner.total_failed;
        inner.queue_full_total = old_inner.queue_full_total;
        inner.queue_shed_total = old_inner.queue_shed_total;
        inner.retry_total = old_inner.retry_total;
        inner.upload_failure_total = old_inner.upload_failure_total;
        inner.failure_reasons = old_inner.failure_reasons.clone();
        inner.history = old_inner.history.clone();
        inner.chart = old_inner.chart.clone();
        inner.auto_overrides = old_inner.auto_overrides.clone();

        for (path, file) in &old_inner.files {
            if self.roots.iter().any(|root| paths::is_under(root, path)) {
                inner.files.insert(path.clone(), file.clone());
            }
        }
    }

    pub async fn stats_snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.read().await;
        let mut failure_reasons: Vec<FailureReason> = inner
            .failure_reasons
            .iter()
            .map(|(reason, count)| FailureReason {
                reason: reason.clone(),
                count: *count,
            })
            .collect();
        failure_reasons.sort_by(|a, b| b.count.cmp(&a.count).then(a.reason.cmp(&b.reason)));

        StatsSnapshot {
            queue_length: inner.queue.queue_length,
            in_flight: inner.queue.in_flight,
            workers: inner.queue.workers,
            queue_capacity: inner.queue.queue_capacity,
            backlog: inner.queue.backlog(),
            queue_full_total: inner.queue_full_total,
            queue_shed_total: inner.queue_shed_total,
            retry_total: inner.retry_total,
            upload_failure_total: inner.upload_failure_total,
            today_uploaded: inner.today_uploaded,
            today_failed: inner.today_failed,
            failure_reasons,
        }
    }

    /// All known files, newest modification first, with the auto-upload
    /// toggle resolved per file.
    pub async fn file_states(&self) -> Vec<FileState> {
        let inner = self.inner.read().await;
        let mut files: Vec<FileState> = inner
            .files
            .values()
            .map(|file| {
                let mut file = file.clone();
                file.auto_upload = resolve_auto(&inner.auto_overrides, &file.path);
                file
            })
            .collect();
        files.sort_by(|a, b| b.modified.cmp(&a.modified).then(a.path.cmp(&b.path)));
        files
    }

    pub async fn upload_history(&self) -> Vec<UploadRecord> {
        let inner = self.inner.read().await;
        inner.history.iter().cloned().collect()
    }

    pub async fn chart_points(&self) -> Vec<ChartPoint> {
        let inner = self.inner.read().await;
        inner.chart.iter().cloned().collect()
    }

    pub async fn today_notified(&self) -> HashMap<String, u64> {
        self.inner.read().await.today_notified.clone()
    }

    pub(crate) async fn auto_overrides_snapshot(&self) -> HashMap<String, bool> {
        self.inner.read().await.auto_overrides.clone()
    }

    async fn invalidate_dashboard(&self) {
        *self.dash_cache.lock().await = None;
    }

    pub(crate) async fn dash_cache_get(&self, max_age: std::time::Duration) -> Option<DashboardSnapshot> {
        let cache = self.dash_cache.lock().await;
        match cache.as_ref() {
            Some((stamp, snapshot)) if stamp.elapsed() < max_age => Some(snapshot.clone()),
            _ => None,
        }
    }

    pub(crate) async fn dash_cache_put(&self, snapshot: DashboardSnapshot) {
        *self.dash_cache.lock().await = Some((Instant::now(), snapshot));
    }
}

fn file_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn human_size(size: u64) -> String {
    size.file_size(file_size_opts::BINARY)
        .unwrap_or_else(|_| format!("{size} B"))
}

async fn probe(path: &str) -> (u64, Option<DateTime<Utc>>) {
    match tokio::fs::metadata(path).await {
        Ok(meta) => (
            meta.len(),
            meta.modified().ok().map(DateTime::<Utc>::from),
        ),
        Err(_) => (0, None),
    }
}

fn ensure_entry<'a>(
    files: &'a mut HashMap<String, FileState>,
    path: &str,
    size: u64,
    modified: Option<DateTime<Utc>>,
) -> &'a mut FileState {
    let entry = files.entry(path.to_string()).or_insert_with(|| FileState {
        name: file_name(path),
        path: path.to_string(),
        modified: None,
        size: 0,
        auto_upload: true,
        status: FileStatus::Existing,
        last_error: None,
        last_latency_ms: None,
        last_url: None,
    });
    if size > 0 {
        entry.size = size;
    }
    if modified.is_some() {
        entry.modified = modified;
    }
    entry
}

fn mark_failed_inner(
    inner: &mut StateInner,
    path: &str,
    reason: &str,
    size: u64,
    modified: Option<DateTime<Utc>>,
) {
    let entry = ensure_entry(&mut inner.files, path, size, modified);
    entry.status = FileStatus::Failed;
    entry.last_error = Some(reason.to_string());
    inner.today_failed += 1;
    inner.total_failed += 1;

    if let Some(index) = pending_row(&inner.history, path) {
        let row = &mut inner.history[index];
        row.result = UploadResult::Failed;
        row.time = Utc::now();
        row.note = Some(reason.to_string());
    } else {
        let record = UploadRecord {
            file: file_name(path),
            path: path.to_string(),
            target: String::new(),
            size_human: human_size(size),
            result: UploadResult::Failed,
            latency_ms: 0,
            time: Utc::now(),
            note: Some(reason.to_string()),
        };
        push_history(&mut inner.history, record);
    }
}

fn pending_row(history: &VecDeque<UploadRecord>, path: &str) -> Option<usize> {
    history
        .iter()
        .rposition(|row| row.path == path && row.result == UploadResult::Pending)
}

fn push_history(history: &mut VecDeque<UploadRecord>, record: UploadRecord) {
    history.push_back(record);
    while history.len() > HISTORY_CAP {
        history.pop_front();
    }
}

fn roll_day(inner: &mut StateInner) {
    let today = Local::now().date_naive();
    if inner.day != Some(today) {
        inner.day = Some(today);
        inner.today_uploaded = 0;
        inner.today_failed = 0;
        inner.today_notified.clear();
    }
}

fn resolve_auto(overrides: &HashMap<String, bool>, path: &str) -> bool {
    let mut current = path.trim_end_matches('/').to_string();
    if current.is_empty() {
        current = "/".to_string();
    }
    loop {
        if let Some(enabled) = overrides.get(&current) {
            return *enabled;
        }
        if current == "/" || !current.contains('/') {
            return true;
        }
        match current.rfind('/') {
            Some(0) => current = "/".to_string(),
            Some(index) => current.truncate(index),
            None => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn empty_state() -> RuntimeState {
        RuntimeState::new(vec!["/w".to_string()], WatchFilter::default())
    }

    #[tokio::test]
    async fn queued_then_uploaded_is_one_history_row() {
        let state = empty_state();
        state.mark_queued("/w/a.log").await;
        state
            .mark_uploaded("/w/a.log", "https://s/logs/h/a.log", Duration::from_millis(42), false)
            .await;

        let history = state.upload_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].file, "a.log");
        assert_eq!(history[0].result, UploadResult::Success);
        assert_eq!(history[0].latency_ms, 42);

        let stats = state.stats_snapshot().await;
        assert_eq!(stats.today_uploaded, 1);
    }

    #[tokio::test]
    async fn failed_upload_updates_pending_row() {
        let state = empty_state();
        state.mark_queued("/w/a.log").await;
        state.mark_failed("/w/a.log", "connection refused").await;

        let history = state.upload_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result, UploadResult::Failed);
        assert_eq!(history[0].note.as_deref(), Some("connection refused"));
        assert_eq!(state.stats_snapshot().await.today_failed, 1);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let state = empty_state();
        for i in 0..(HISTORY_CAP + 25) {
            state.mark_queued(&format!("/w/{i}.log")).await;
        }
        assert_eq!(state.upload_history().await.len(), HISTORY_CAP);
    }

    #[tokio::test]
    async fn chart_is_bounded_and_cumulative() {
        let state = empty_state();
        for i in 0..(CHART_CAP + 10) {
            state
                .mark_uploaded(&format!("/w/{i}.log"), "url", Duration::ZERO, false)
                .await;
            state.set_queue_stats(PoolStats::default()).await;
        }
        let chart = state.chart_points().await;
        assert_eq!(chart.len(), CHART_CAP);
        // Cumulative counters never decrease across points.
        for pair in chart.windows(2) {
            assert!(pair[1].uploads >= pair[0].uploads);
        }
        assert_eq!(chart.last().unwrap().uploads, (CHART_CAP + 10) as u64);
    }

    #[tokio::test]
    async fn auto_upload_inherits_from_nearest_ancestor() {
        let state = empty_state();
        assert!(state.auto_upload_enabled("/w/app/a.log").await);

        state.set_auto_upload("/w/app", false).await;
        assert!(!state.auto_upload_enabled("/w/app/a.log").await);
        assert!(!state.auto_upload_enabled("/w/app/deep/b.log").await);
        assert!(state.auto_upload_enabled("/w/other/c.log").await);

        // Child override wins over the parent...
        state.set_auto_upload("/w/app/deep", true).await;
        assert!(state.auto_upload_enabled("/w/app/deep/b.log").await);
        // ...until the parent is re-set, which clears descendants.
        state.set_auto_upload("/w/app", false).await;
        assert!(!state.auto_upload_enabled("/w/app/deep/b.log").await);
    }

    #[tokio::test]
    async fn carry_over_preserves_counters_and_buffers() {
        let state = empty_state();
        for i in 0..5 {
            let path = format!("/w/{i}.log");
            state.mark_queued(&path).await;
            state.mark_uploaded(&path, "url", Duration::ZERO, false).await;
        }
        state.record_upload_failure("timeout").await;
        state.set_queue_stats(PoolStats::default()).await;
        state.set_auto_upload("/w/app", false).await;

        let replacement = empty_state();
        replacement.carry_over_from(&state).await;

        let stats = replacement.stats_snapshot().await;
        assert_eq!(stats.today_uploaded, 5);
        assert_eq!(stats.upload_failure_total, 1);
        assert_eq!(replacement.upload_history().await.len(), 5);
        assert_eq!(replacement.chart_points().await.len(), 1);
        assert!(!replacement.auto_upload_enabled("/w/app/x.log").await);
    }

    #[tokio::test]
    async fn bootstrap_scan_records_existing_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("seen.log"), b"x").unwrap();
        std::fs::write(dir.path().join("ignored.tmp"), b"x").unwrap();

        let state = RuntimeState::new(
            vec![paths::normalise(dir.path())],
            WatchFilter::default(),
        );
        let files = state.file_states().await;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "seen.log");
        assert_eq!(files[0].status, FileStatus::Existing);
        assert!(files[0].size > 0);
    }

    #[tokio::test]
    async fn failure_reasons_bucket_and_sort() {
        let state = empty_state();
        state.record_upload_failure("timeout").await;
        state.record_upload_failure("timeout").await;
        state.record_upload_failure("denied").await;

        let stats = state.stats_snapshot().await;
        assert_eq!(stats.upload_failure_total, 3);
        assert_eq!(stats.failure_reasons[0].reason, "timeout");
        assert_eq!(stats.failure_reasons[0].count, 2);
    }

    #[tokio::test]
    async fn backlog_is_queue_plus_in_flight() {
        let state = empty_state();
        state
            .set_queue_stats(PoolStats {
                queue_length: 4,
                in_flight: 2,
                workers: 3,
                queue_capacity: 100,
            })
            .await;
        let stats = state.stats_snapshot().await;
        assert_eq!(stats.backlog, 6);
        assert_eq!(stats.backlog, stats.queue_length + stats.in_flight);
    }
}
