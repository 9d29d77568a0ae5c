use crate::persist::{now_seconds, read_json_or_default, write_json_atomic};
use crate::SyncError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    NotStarted,
    Success,
    Partial,
    Failed,
}

/// Last known state of one unit of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub collection: String,
    pub unit: u32,
    pub actual_count: u32,
    pub expected_count: Option<u32>,
    pub status: UnitStatus,
    pub updated_at: u64,
    #[serde(default)]
    pub error: String,
}

impl UnitRecord {
    pub fn new(collection: &str, unit: u32) -> Self {
        Self {
            collection: collection.to_string(),
            unit,
            actual_count: 0,
            expected_count: None,
            status: UnitStatus::NotStarted,
            updated_at: 0,
            error: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Success
    }

    fn key(&self) -> (&str, u32) {
        (self.collection.as_str(), self.unit)
    }
}

/// Durable table of unit records keyed by (collection, unit).
///
/// Backed by a single JSON document. Every `upsert` re-reads the table, replaces one row
/// and rewrites the whole document through a temp file and rename, so a crash leaves the
/// previous table intact. There is no locking: one writer per table at a time.
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace the row for `record`'s key, stamping its update time.
    pub fn upsert(&self, mut record: UnitRecord) -> Result<(), SyncError> {
        let mut rows = self.load()?;
        record.updated_at = now_seconds();

        match rows.binary_search_by(|row| row.key().cmp(&record.key())) {
            Ok(idx) => rows[idx] = record,
            Err(idx) => rows.insert(idx, record),
        }

        write_json_atomic(&self.path, &rows)
    }

    /// All rows of a collection in ascending unit order.
    pub fn scan(&self, collection: &str) -> Result<Vec<UnitRecord>, SyncError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|row| row.collection == collection)
            .collect())
    }

    pub fn get(&self, collection: &str, unit: u32) -> Result<Option<UnitRecord>, SyncError> {
        Ok(self
            .load()?
            .into_iter()
            .find(|row| row.collection == collection && row.unit == unit))
    }

    fn load(&self) -> Result<Vec<UnitRecord>, SyncError> {
        let mut rows: Vec<UnitRecord> = read_json_or_default(&self.path)?;
        // Hand-edited tables may be out of order
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(rows)
    }
}
