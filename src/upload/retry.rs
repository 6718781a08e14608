use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::upload::s3::ObjectPut;
use crate::utils::errors::{AgentError, Result};
use crate::utils::paths;

/// Retry attempts are hard-capped regardless of configuration.
const ATTEMPTS_CAP: u32 = 20;
/// Extended (doubled) delays never exceed this.
const DELAY_CAP: Duration = Duration::from_secs(60);
/// Failure reasons are trimmed to this many characters for bucketing.
const REASON_CAP: usize = 120;

/// Bounded-retry plan for a single upload.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 4,
            delays: default_delays(),
        }
    }
}

fn default_delays() -> Vec<Duration> {
    vec![
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(5),
    ]
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        if !self.enabled {
            return 1;
        }
        self.max_attempts.clamp(1, ATTEMPTS_CAP)
    }

    /// The inter-attempt delays, one fewer than the attempt count.
    /// Configured delays are taken in order; missing tail entries double
    /// the last delay, capped at 60s.
    pub fn plan(&self) -> Vec<Duration> {
        let needed = self.attempts().saturating_sub(1) as usize;
        if needed == 0 {
            return Vec::new();
        }
        let mut delays = if self.delays.is_empty() {
            default_delays()
        } else {
            self.delays.clone()
        };
        delays.truncate(needed);
        while delays.len() < needed {
            let last = delays.last().copied().unwrap_or(Duration::from_secs(1));
            delays.push((last * 2).min(DELAY_CAP));
        }
        delays
    }
}

/// Trim and cap an upload failure reason so it buckets cleanly.
pub fn normalise_reason(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "unknown error".to_string();
    }
    trimmed.chars().take(REASON_CAP).collect()
}

/// Per-file upload with bounded attempts and configured backoff. Wraps
/// a single object-store `put`; requeueing is never its job.
pub struct RetryUploader {
    store: Arc<dyn ObjectPut>,
    policy: RetryPolicy,
    roots: Vec<String>,
    host: String,
    on_retry: Arc<dyn Fn() + Send + Sync>,
}

/// What a successful upload reports back.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub url: String,
    pub latency: Duration,
    pub attempts: u32,
}

impl RetryUploader {
    pub fn new(
        store: Arc<dyn ObjectPut>,
        policy: RetryPolicy,
        roots: Vec<String>,
        host: String,
        on_retry: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            store,
            policy,
            roots,
            host: paths::sanitise_hostname(&host),
            on_retry,
        }
    }

    pub async fn upload(&self, ctx: &CancellationToken, path: &str) -> Result<UploadOutcome> {
        let started = Instant::now();
        let key = paths::object_key(&self.roots, path, &self.host)?;
        let attempts = self.policy.attempts();
        let plan = self.policy.plan();
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                (self.on_retry)();
                let delay = plan[(attempt - 2) as usize];
                debug!("Retrying {} in {:?} (attempt {}/{})", path, delay, attempt, attempts);
                tokio::select! {
                    _ = ctx.cancelled() => return Err(AgentError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.try_put(path, &key).await {
                Ok(()) => {
                    return Ok(UploadOutcome {
                        url: self.store.download_url(&key),
                        latency: started.elapsed(),
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!("Upload attempt {}/{} for {} failed: {}", attempt, attempts, path, e);
                    last_reason = e.to_string();
                }
            }

            if ctx.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
        }

        Err(AgentError::Upload(normalise_reason(&last_reason)))
    }

    async fn try_put(&self, path: &str, key: &str) -> Result<()> {
        let body = tokio::fs::read(path).await?;
        let content_type = content_type_for(path);
        self.store.put(key, body, content_type).await?;
        Ok(())
    }
}

fn content_type_for(path: &str) -> &'static str {
    let lower = path.to_lowercase();
    match lower.rsplit('.').next() {
        Some("log") | Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("gz") => "application/gzip",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
