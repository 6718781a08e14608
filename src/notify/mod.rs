//! Post-upload notification hook.
//!
//! The orchestrator calls the hook at most once per successful upload;
//! hook failures are logged and never affect the upload outcome.
//! Transports beyond logging and a generic webhook live elsewhere.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::utils::errors::{AgentError, Result};

/// Payload handed to the hook for each successful upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadNotice {
    pub level: String,
    pub rule: String,
    pub file: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl UploadNotice {
    pub fn success(file: &str, url: &str) -> Self {
        Self {
            level: "info".to_string(),
            rule: "upload-complete".to_string(),
            file: file.to_string(),
            message: format!("uploaded {} to {}", file, url),
            time: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Transport name used for per-kind notification counters.
    fn kind(&self) -> &str;

    async fn notify(&self, notice: &UploadNotice) -> Result<()>;
}

/// Default transport: a structured log line.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    fn kind(&self) -> &str {
        "log"
    }

    async fn notify(&self, notice: &UploadNotice) -> Result<()> {
        info!(
            rule = %notice.rule,
            file = %notice.file,
            "{}",
            notice.message
        );
        Ok(())
    }
}

/// POSTs the notice as JSON to a configured endpoint.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    fn kind(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, notice: &UploadNotice) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(notice)
            .send()
            .await
            .map_err(|e| AgentError::Upload(format!("webhook send failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AgentError::Upload(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
