use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::debug;

use crate::config::ObjectStoreConfig;
use crate::utils::errors::{AgentError, Result};
use crate::utils::paths;

/// The one capability the pipeline needs from an object store.
#[async_trait::async_trait]
pub trait ObjectPut: Send + Sync {
    /// Store `body` under `key`, returning the ETag when the backend
    /// provides one.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<Option<String>>;

    /// Public URL of the stored object.
    fn download_url(&self, key: &str) -> String;
}

/// S3-compatible store over a custom endpoint with static credentials.
/// Path-style addressing is the default since most self-hosted backends
/// (MinIO and friends) require it.
pub struct S3ObjectStore {
    client: Client,
    endpoint: String,
    bucket: String,
    force_path_style: bool,
    disable_ssl: bool,
}

impl S3ObjectStore {
    pub fn new(cfg: &ObjectStoreConfig) -> Result<Self> {
        if cfg.endpoint.is_empty() {
            return Err(AgentError::Config("object-store endpoint is not set".to_string()));
        }
        if cfg.bucket.is_empty() {
            return Err(AgentError::Config("object-store bucket is not set".to_string()));
        }

        let endpoint_url = endpoint_with_scheme(&cfg.endpoint, cfg.disable_ssl);
        let credentials = Credentials::new(
            cfg.access_key.clone(),
            cfg.secret_key.clone(),
            None,
            None,
            "updrift-config",
        );
        let region = cfg.region.clone().unwrap_or_else(|| "us-east-1".to_string());
        let sdk_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .endpoint_url(endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(cfg.force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(sdk_config),
            endpoint: cfg.endpoint.clone(),
            bucket: cfg.bucket.clone(),
            force_path_style: cfg.force_path_style,
            disable_ssl: cfg.disable_ssl,
        })
    }
}

fn endpoint_with_scheme(endpoint: &str, disable_ssl: bool) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    let scheme = if disable_ssl { "http" } else { "https" };
    format!("{}://{}", scheme, endpoint.trim_start_matches("//"))
}

#[async_trait::async_trait]
impl ObjectPut for S3ObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<Option<String>> {
        let size = body.len();
        let response = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(size as i64)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| AgentError::Upload(format!("{}", DisplayErrorContext(&e))))?;

        debug!("Stored {} bytes at {}/{}", size, self.bucket, key);
        Ok(response.e_tag().map(str::to_string))
    }

    fn download_url(&self, key: &str) -> String {
        paths::build_download_url(
            &self.endpoint,
            &self.bucket,
            key,
            self.force_path_style,
            self.disable_ssl,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_cfg(endpoint: &str, path_style: bool, disable_ssl: bool) -> ObjectStoreConfig {
        ObjectStoreConfig {
            endpoint: endpoint.to_string(),
            bucket: "logs".to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            region: None,
            force_path_style: path_style,
            disable_ssl,
        }
    }

    #[test]
    fn scheme_added_only_when_missing() {
        assert_eq!(
            endpoint_with_scheme("minio.local:9000", true),
            "http://minio.local:9000"
        );
        assert_eq!(
            endpoint_with_scheme("minio.local:9000", false),
            "https://minio.local:9000"
        );
        assert_eq!(
            endpoint_with_scheme("https://s3.example.com", true),
            "https://s3.example.com"
        );
    }

    #[test]
    fn download_url_follows_addressing_style() {
        let path_style = S3ObjectStore::new(&store_cfg("minio.local:9000", true, true)).unwrap();
        assert_eq!(
            path_style.download_url("host/a.log"),
            "http://minio.local:9000/logs/host/a.log"
        );

        let virtual_host = S3ObjectStore::new(&store_cfg("s3.example.com", false, false)).unwrap();
        assert_eq!(
            virtual_host.download_url("host/a.log"),
            "https://logs.s3.example.com/host/a.log"
        );
    }

    #[test]
    fn construction_requires_endpoint_and_bucket() {
        let mut cfg = store_cfg("", true, true);
        assert!(S3ObjectStore::new(&cfg).is_err());
        cfg.endpoint = "minio.local:9000".to_string();
        cfg.bucket = String::new();
        assert!(S3ObjectStore::new(&cfg).is_err());
    }
}
