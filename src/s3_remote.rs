use crate::fingerprint::{canonicalize, Fingerprint};
use crate::remote::{ContainerStatus, RemoteStore};
use crate::SyncError;
use aws_config::Region;
use aws_sdk_s3::{primitives::ByteStream, types::Object, Client};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Remote store in an S3 bucket. Folders are zero-byte `<prefix>/` marker objects.
#[derive(Clone)]
pub struct S3Remote {
    client: Client,
    bucket: String,
    prefix: String,
    runtime: Arc<Runtime>,
}

#[derive(Clone)]
pub struct S3RemoteConfig {
    pub bucket: String,
    pub region: String,
    /// Key prefix inside the bucket; fingerprints are relative to it.
    pub prefix: String,
    pub endpoint: Option<String>,
}

impl S3RemoteConfig {
    pub fn from_env() -> Result<Option<Self>, SyncError> {
        let bucket = match std::env::var("PANELSYNC_S3_BUCKET") {
            Ok(b) if !b.is_empty() => b,
            _ => return Ok(None),
        };

        let region = std::env::var("PANELSYNC_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let prefix = std::env::var("PANELSYNC_S3_PREFIX").unwrap_or_default();
        let endpoint = std::env::var("PANELSYNC_S3_ENDPOINT").ok().filter(|e| !e.is_empty());

        Ok(Some(Self {
            bucket,
            region,
            prefix,
            endpoint,
        }))
    }
}

impl S3Remote {
    pub fn new(config: S3RemoteConfig) -> Result<Self, SyncError> {
        let runtime = Runtime::new().map_err(|e| SyncError::Other(format!("tokio runtime error: {}", e)))?;
        let region = Region::new(config.region.clone());
        let base_config = runtime.block_on(aws_config::from_env().region(region.clone()).load());

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&base_config).region(region);
        if let Some(endpoint) = &config.endpoint {
            s3_builder = s3_builder.endpoint_url(endpoint);
            s3_builder = s3_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_builder.build()),
            bucket: config.bucket,
            prefix: config.prefix,
            runtime: Arc::new(runtime),
        })
    }

    pub fn try_from_env() -> Result<Option<Self>, SyncError> {
        match S3RemoteConfig::from_env()? {
            Some(cfg) => Ok(Some(Self::new(cfg)?)),
            None => Ok(None),
        }
    }

    fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str, overwrite: bool) -> Result<(), SyncError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.prefixed(key))
            .content_type(content_type)
            .body(ByteStream::from(bytes));
        if !overwrite {
            request = request.if_none_match("*");
        }

        self.runtime.block_on(request.send()).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("PreconditionFailed") {
                SyncError::Transfer(format!("{} already exists remotely", key))
            } else {
                SyncError::Transfer(format!("S3 put {}: {}", key, msg))
            }
        })?;
        Ok(())
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<Object>, SyncError> {
        let mut token: Option<String> = None;
        let mut objects = Vec::new();

        let prefixed_prefix = self.prefixed(prefix);

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefixed_prefix.clone());

            if let Some(ref cont) = token {
                request = request.continuation_token(cont);
            }

            let resp = self
                .runtime
                .block_on(request.send())
                .map_err(|e| SyncError::Remote(format!("S3 list {}: {}", prefix, e)))?;

            objects.extend(resp.contents().iter().cloned());

            if resp.is_truncated().unwrap_or(false) {
                token = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(objects)
    }

    fn prefixed(&self, key: &str) -> String {
        let clean = key.trim_start_matches('/');
        if self.prefix.is_empty() {
            clean.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), clean)
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else if let Some(rest) = key.strip_prefix(&format!("{}/", self.prefix.trim_end_matches('/'))) {
            rest
        } else {
            key
        }
    }
}

fn folder_key(prefix: &str) -> String {
    format!("{}/", prefix.trim_matches('/'))
}

fn content_type(key: &Fingerprint) -> &'static str {
    match key.extension() {
        Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

impl RemoteStore for S3Remote {
    fn list_remote_fingerprints(&self, prefix: &str) -> Result<BTreeSet<Fingerprint>, SyncError> {
        // Trailing slash keeps `manga/solo` from matching `manga/solo-2`
        let objects = self.list_objects(&folder_key(prefix))?;
        Ok(objects
            .iter()
            .filter_map(|object| object.key())
            .filter(|key| !key.ends_with('/'))
            .map(|key| canonicalize(self.strip_prefix(key)))
            .collect())
    }

    fn ensure_remote_container(&self, prefix: &str) -> Result<ContainerStatus, SyncError> {
        let marker = folder_key(prefix);
        let exists = self
            .runtime
            .block_on(
                self.client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(self.prefixed(&marker))
                    .max_keys(1)
                    .send(),
            )
            .map_err(|e| SyncError::Remote(format!("S3 list {}: {}", marker, e)))?
            .key_count()
            .unwrap_or(0)
            > 0;
        if exists {
            return Ok(ContainerStatus::AlreadyExists);
        }

        self.put_object(&marker, Vec::new(), "application/x-directory", true)
            .map_err(|e| SyncError::Remote(format!("create folder {}: {}", prefix, e)))?;
        Ok(ContainerStatus::Created)
    }

    fn upload_item(&self, local_path: &Path, key: &Fingerprint) -> Result<(), SyncError> {
        let bytes = fs::read(local_path)?;
        self.put_object(key.as_str(), bytes, content_type(key), false)
    }
}
