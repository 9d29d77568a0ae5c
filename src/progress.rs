use crate::persist::{now_seconds, read_json_or_default, write_json_atomic};
use crate::SyncError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    #[default]
    NotStarted,
    Acquiring,
    Verifying,
    Repairing,
    Syncing,
    Done,
    Failed,
    Interrupted,
}

impl CollectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionStatus::NotStarted => "not_started",
            CollectionStatus::Acquiring => "acquiring",
            CollectionStatus::Verifying => "verifying",
            CollectionStatus::Repairing => "repairing",
            CollectionStatus::Syncing => "syncing",
            CollectionStatus::Done => "done",
            CollectionStatus::Failed => "failed",
            CollectionStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local and remote totals observed at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalSummary {
    pub local_units: usize,
    pub local_issues: usize,
    pub remote_items: usize,
    pub missing_remote: usize,
}

/// Pipeline progress of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionState {
    pub status: CollectionStatus,
    pub acquisition_complete: bool,
    pub verification_complete: bool,
    pub sync_complete: bool,
    pub retry_count: u32,
    /// Unit keys still failing, ascending.
    pub failing_units: Vec<u32>,
    pub total_units: Option<usize>,
    pub uploaded_count: usize,
    pub upload_failed_count: usize,
    pub last_run: Option<u64>,
    pub last_error: Option<String>,
    pub summary: Option<FinalSummary>,
}

impl CollectionState {
    /// Clear stage flags and counters so every stage runs again.
    pub fn reset_for_restart(&mut self) {
        *self = CollectionState {
            last_run: self.last_run,
            ..CollectionState::default()
        };
    }
}

/// Per-collection progress record, persisted as one JSON object keyed by slug.
///
/// Same write discipline as the metadata table: read, modify one entry, rewrite whole.
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// State of a collection; an unseen slug starts as `not_started`.
    pub fn get(&self, slug: &str) -> Result<CollectionState, SyncError> {
        Ok(self.all()?.remove(slug).unwrap_or_default())
    }

    pub fn all(&self) -> Result<BTreeMap<String, CollectionState>, SyncError> {
        read_json_or_default(&self.path)
    }

    /// Persist `state` for `slug`, stamping `last_run`.
    pub fn save(&self, slug: &str, state: &mut CollectionState) -> Result<(), SyncError> {
        state.last_run = Some(now_seconds());
        let mut entries = self.all()?;
        entries.insert(slug.to_string(), state.clone());
        write_json_atomic(&self.path, &entries)
    }
}
