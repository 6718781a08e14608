use serde::{Deserialize, Serialize};

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, warn};
use url::Url;

use crate::utils::paths;
use crate::watch::filter::WatchFilter;

/// Layered agent configuration: YAML file, then the runtime overlay the
/// console writes, then a fixed whitelist of environment variables, then
/// defaults, then validation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub watch: WatchConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub object_store: ObjectStoreConfig,
    pub api: ApiConfig,
    pub notify: NotifyConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Raw multi-root string; split on `, ; whitespace ，；`.
    pub dirs: String,
    /// Comma/space-separated dot-prefixed extensions; empty accepts all.
    pub extensions: String,
    /// Silence window, e.g. `10s`, `1m`, `10秒`.
    pub silence: String,
    /// Directory base names or absolute prefixes never descended into.
    pub exclude: Vec<String>,
    /// Enqueue files discovered by the bootstrap scan.
    pub upload_existing_on_start: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub size: usize,
    pub saturation_threshold: f64,
    pub persist_enabled: bool,
    pub persist_file: String,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    /// Comma-separated delays, e.g. `1s,2s,5s`.
    pub delays: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub access_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub secret_key: String,
    pub region: Option<String>,
    pub force_path_style: bool,
    pub disable_ssl: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Bind address, `:8080` or `127.0.0.1:8080`.
    pub bind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub auth_token: String,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook target for the post-upload hook; empty disables it.
    pub webhook_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dirs: String::new(),
            extensions: String::new(),
            silence: "10s".to_string(),
            exclude: Vec::new(),
            upload_existing_on_start: false,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            size: 100,
            saturation_threshold: 0.9,
            persist_enabled: true,
            persist_file: "logs/upload-queue.json".to_string(),
            shutdown_timeout_secs: 30,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 4,
            delays: "1s,2s,5s".to_string(),
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            region: None,
            force_path_style: true,
            disable_ssl: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: ":8080".to_string(),
            auth_token: String::new(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            watch: WatchConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            object_store: ObjectStoreConfig::default(),
            api: ApiConfig::default(),
            notify: NotifyConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// The narrow set of fields the console may rewrite at runtime. Saved
/// next to the config file as `<config>.runtime.yaml` and layered over
/// it on every load.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeOverlay {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_dirs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delays: Option<String>,
}

impl RuntimeOverlay {
    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(dirs) = &self.watch_dirs {
            config.watch.dirs = dirs.clone();
        }
        if let Some(ext) = &self.extensions {
            config.watch.extensions = ext.clone();
        }
        if let Some(silence) = &self.silence {
            config.watch.silence = silence.clone();
        }
        if let Some(workers) = self.workers {
            config.queue.workers = workers;
        }
        if let Some(size) = self.queue_size {
            config.queue.size = size;
        }
        if let Some(enabled) = self.retry_enabled {
            config.retry.enabled = enabled;
        }
        if let Some(delays) = &self.retry_delays {
            config.retry.delays = delays.clone();
        }
    }

    /// Capture the runtime-editable fields of a live config.
    pub fn capture(config: &AgentConfig) -> Self {
        Self {
            watch_dirs: Some(config.watch.dirs.clone()),
            extensions: Some(config.watch.extensions.clone()),
            silence: Some(config.watch.silence.clone()),
            workers: Some(config.queue.workers),
            queue_size: Some(config.queue.size),
            retry_enabled: Some(config.retry.enabled),
            retry_delays: Some(config.retry.delays.clone()),
        }
    }
}

const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

impl AgentConfig {
    pub fn load(config_file: &Path) -> Result<Self> {
        let mut config = if config_file.exists() {
            info!("Loading configuration from: {}", config_file.display());
            let content = fs::read_to_string(config_file)
                .with_context(|| format!("Failed to read config file: {}", config_file.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", config_file.display()))?
        } else {
            warn!("Config file not found, starting from defaults");
            Self::default()
        };

        let overlay_file = Self::overlay_path(config_file);
        if overlay_file.exists() {
            let content = fs::read_to_string(&overlay_file).with_context(|| {
                format!("Failed to read runtime overlay: {}", overlay_file.display())
            })?;
            match serde_yaml::from_str::<RuntimeOverlay>(&content) {
                Ok(overlay) => {
                    overlay.apply(&mut config);
                    info!("Applied runtime overlay from: {}", overlay_file.display());
                }
                Err(e) => warn!("Ignoring unreadable runtime overlay: {}", e),
            }
        }

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    pub fn overlay_path(config_file: &Path) -> PathBuf {
        let mut name = config_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config".to_string());
        name.push_str(".runtime.yaml");
        config_file.with_file_name(name)
    }

    fn load_from_env(&mut self) {
        let overrides: [(&str, &mut String); 5] = [
            ("UPDRIFT_S3_ENDPOINT", &mut self.object_store.endpoint),
            ("UPDRIFT_S3_BUCKET", &mut self.object_store.bucket),
            ("UPDRIFT_S3_ACCESS_KEY", &mut self.object_store.access_key),
            ("UPDRIFT_S3_SECRET_KEY", &mut self.object_store.secret_key),
            ("UPDRIFT_PERSIST_FILE", &mut self.queue.persist_file),
        ];
        for (var, slot) in overrides {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    *slot = value;
                    info!("Loaded {} from environment", var);
                }
            }
        }

        if let Ok(token) = std::env::var("API_AUTH_TOKEN") {
            if !token.is_empty() {
                self.api.auth_token = token;
                info!("Loaded API auth token from environment");
            }
        }
        if let Ok(region) = std::env::var("UPDRIFT_S3_REGION") {
            if !region.is_empty() {
                self.object_store.region = Some(region);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for root in self.watch_roots().map_err(|e| anyhow::anyhow!("{e}"))? {
            let path = Path::new(&root);
            if !path.is_dir() {
                anyhow::bail!("watch directory does not exist or is not a directory: {root}");
            }
        }

        for ext in split_list(&self.watch.extensions) {
            if !ext.starts_with('.') {
                anyhow::bail!("file extension must begin with '.': {ext}");
            }
        }

        if !LOG_LEVELS.contains(&self.log.level.as_str()) {
            anyhow::bail!("log level must be one of debug/info/warn/error: {}", self.log.level);
        }

        if !self.object_store.endpoint.is_empty() {
            parse_endpoint(&self.object_store.endpoint)
                .with_context(|| format!("invalid object-store endpoint: {}", self.object_store.endpoint))?;
        }

        self.silence_window()
            .map_err(|e| anyhow::anyhow!("invalid silence window: {e}"))?;

        if self.queue.workers == 0 {
            anyhow::bail!("queue workers must be at least 1");
        }
        if self.queue.size == 0 {
            anyhow::bail!("queue size must be at least 1");
        }
        if !(self.queue.saturation_threshold > 0.0 && self.queue.saturation_threshold <= 1.0) {
            anyhow::bail!(
                "queue saturation threshold must lie in (0, 1]: {}",
                self.queue.saturation_threshold
            );
        }

        Ok(())
    }

    /// Save only the runtime-editable fields, atomically.
    pub fn save_runtime_overlay(&self, config_file: &Path) -> Result<()> {
        let overlay_file = Self::overlay_path(config_file);
        let dir = overlay_file.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let mut content = String::from("# Runtime overlay written by the updrift console.\n");
        content.push_str("# Fields here shadow the base config file on every load.\n");
        content.push_str(
            &serde_yaml::to_string(&RuntimeOverlay::capture(self))
                .context("Failed to serialize runtime overlay")?,
        );

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .context("Failed to create temp file for runtime overlay")?;
        tmp.write_all(content.as_bytes())
            .context("Failed to write runtime overlay")?;
        tmp.persist(&overlay_file)
            .with_context(|| format!("Failed to replace {}", overlay_file.display()))?;

        info!("Runtime overlay saved to: {}", overlay_file.display());
        Ok(())
    }

    pub fn watch_roots(&self) -> crate::utils::Result<Vec<String>> {
        paths::split_roots(&self.watch.dirs)
    }

    pub fn silence_window(&self) -> crate::utils::Result<Duration> {
        parse_duration(&self.watch.silence)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        split_list(&self.retry.delays)
            .iter()
            .filter_map(|piece| parse_duration(piece).ok())
            .collect()
    }

    pub fn watch_filter(&self) -> WatchFilter {
        WatchFilter::new(&self.watch.extensions, &self.watch.exclude)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', ' ', '\t'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Accepts `10s`, `10秒`, bare `10` (seconds), `1m`/`1分钟`, `1h`/`1小时`.
pub fn parse_duration(raw: &str) -> crate::utils::Result<Duration> {
    let pattern = Regex::new(r"^\s*(\d+)\s*(s|秒|m|分钟|h|小时)?\s*$").expect("static regex");
    let caps = pattern.captures(raw).ok_or_else(|| {
        crate::utils::AgentError::Config(format!("unparseable duration: {raw:?}"))
    })?;
    let value: u64 = caps[1]
        .parse()
        .map_err(|_| crate::utils::AgentError::Config(format!("duration out of range: {raw:?}")))?;
    let multiplier = match caps.get(2).map(|m| m.as_str()) {
        None | Some("s") | Some("秒") => 1,
        Some("m") | Some("分钟") => 60,
        Some("h") | Some("小时") => 3600,
        Some(other) => {
            return Err(crate::utils::AgentError::Config(format!(
                "unknown duration unit: {other:?}"
            )))
        }
    };
    Ok(Duration::from_secs(value * multiplier))
}

/// Endpoints may arrive as bare hosts; re-parse with a `//` prefix the
/// way URL-less hosts are conventionally promoted.
pub fn parse_endpoint(raw: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(raw) {
        if url.host().is_some() {
            return Ok(url);
        }
    }
    Url::parse(&format!("https://{}", raw.trim_start_matches("//")))
        .map_err(|e| anyhow::anyhow!("{e}"))
}
