use crate::fingerprint::unit_dir_name;
use crate::SyncError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BASE_PATH: &str = "./panelsync_data";
pub const DEFAULT_REMOTE_PREFIX: &str = "manga";
pub const DEFAULT_RETRY_CEILING: u32 = 3;
pub const DEFAULT_SETTLE_DELAY_SECS: u64 = 5;
pub const DEFAULT_UNIT_DELAY_SECS: u64 = 2;
pub const DEFAULT_COLLECTION_DELAY_SECS: u64 = 10;

/// Everything the pipeline needs to know about where things live and how patient to be.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Local root holding one folder per collection.
    pub base_path: PathBuf,
    /// Remote folder collections are stored under.
    pub remote_prefix: String,
    pub retry_ceiling: u32,
    /// Pause between repair rounds.
    pub settle_delay: Duration,
    /// Politeness pause between unit acquisitions.
    pub unit_delay: Duration,
    /// Pause between collections of a batch.
    pub collection_delay: Duration,
    pub metadata_path: PathBuf,
    pub progress_path: PathBuf,
    /// Upload units that failed verification as well.
    pub upload_unverified: bool,
}

impl PipelineConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            metadata_path: base_path.join("manga_metadata.json"),
            progress_path: base_path.join("pipeline_log.json"),
            base_path,
            remote_prefix: DEFAULT_REMOTE_PREFIX.to_string(),
            retry_ceiling: DEFAULT_RETRY_CEILING,
            settle_delay: Duration::from_secs(DEFAULT_SETTLE_DELAY_SECS),
            unit_delay: Duration::from_secs(DEFAULT_UNIT_DELAY_SECS),
            collection_delay: Duration::from_secs(DEFAULT_COLLECTION_DELAY_SECS),
            upload_unverified: false,
        }
    }

    /// Configuration from `PANELSYNC_*` environment variables, defaults elsewhere.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let base_path = lookup("PANELSYNC_BASE_PATH")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_PATH.to_string());
        let mut config = Self::new(base_path);

        if let Some(prefix) = lookup("PANELSYNC_REMOTE_PREFIX").filter(|v| !v.is_empty()) {
            config.remote_prefix = prefix;
        }
        if let Some(ceiling) = parse_var(&lookup, "PANELSYNC_RETRY_CEILING")? {
            config.retry_ceiling = ceiling;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PANELSYNC_SETTLE_DELAY_SECS")? {
            config.settle_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PANELSYNC_UNIT_DELAY_SECS")? {
            config.unit_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PANELSYNC_COLLECTION_DELAY_SECS")? {
            config.collection_delay = Duration::from_secs(secs);
        }
        if let Some(flag) = parse_var(&lookup, "PANELSYNC_UPLOAD_UNVERIFIED")? {
            config.upload_unverified = flag;
        }

        Ok(config)
    }

    pub fn with_remote_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.remote_prefix = prefix.into();
        self
    }

    pub fn with_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_unit_delay(mut self, delay: Duration) -> Self {
        self.unit_delay = delay;
        self
    }

    pub fn with_collection_delay(mut self, delay: Duration) -> Self {
        self.collection_delay = delay;
        self
    }

    pub fn with_upload_unverified(mut self, upload_unverified: bool) -> Self {
        self.upload_unverified = upload_unverified;
        self
    }

    /// No pauses at all; for tests and local mirrors.
    pub fn without_delays(self) -> Self {
        self.with_settle_delay(Duration::ZERO)
            .with_unit_delay(Duration::ZERO)
            .with_collection_delay(Duration::ZERO)
    }

    pub fn collection_dir(&self, collection: &str) -> PathBuf {
        self.base_path.join(collection)
    }

    pub fn unit_dir(&self, collection: &str, unit: u32) -> PathBuf {
        self.collection_dir(collection).join(unit_dir_name(unit))
    }

    /// Remote folder holding one collection, e.g. `manga/solo-leveling`.
    pub fn remote_collection_prefix(&self, collection: &str) -> String {
        let prefix = self.remote_prefix.trim_matches('/');
        if prefix.is_empty() {
            collection.to_string()
        } else {
            format!("{}/{}", prefix, collection)
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PATH)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, SyncError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SyncError::Config(format!("{}={}: {}", name, raw, e))),
    }
}
