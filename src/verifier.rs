use crate::fingerprint::{extension_of, is_item_extension, parse_item_position, parse_unit_dir, unit_dir_name};
use crate::metadata_store::MetadataStore;
use crate::SyncError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueCode {
    NoItemsFound,
    NoExpectedCount,
    CountMismatch { actual: u32, expected: u32 },
    SequenceGap,
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueCode::NoItemsFound => write!(f, "No panels found"),
            IssueCode::NoExpectedCount => write!(f, "No expected count in metadata"),
            IssueCode::CountMismatch { actual, expected } => {
                write!(f, "Panel count mismatch: expected {}, got {}", expected, actual)
            }
            IssueCode::SequenceGap => write!(f, "Panel numbering has gaps"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(IssueCode),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    pub fn issue(&self) -> Option<&IssueCode> {
        match self {
            Verdict::Pass => None,
            Verdict::Fail(issue) => Some(issue),
        }
    }
}

/// Judge a unit from its item positions and expected count. A unit is complete when
/// its positions are exactly `1..=expected`.
///
/// Checks run in a fixed order: emptiness, a usable expected count, the count itself,
/// and only then the sequence, since a gap check on the wrong count means nothing.
pub fn verify(items: &BTreeSet<u32>, expected_count: Option<u32>) -> Verdict {
    if items.is_empty() {
        return Verdict::Fail(IssueCode::NoItemsFound);
    }

    let expected = match expected_count {
        Some(n) if n > 0 => n,
        _ => return Verdict::Fail(IssueCode::NoExpectedCount),
    };

    let actual = items.len() as u32;
    if actual != expected {
        return Verdict::Fail(IssueCode::CountMismatch { actual, expected });
    }

    if !items.iter().copied().eq(1..=expected) {
        return Verdict::Fail(IssueCode::SequenceGap);
    }

    Verdict::Pass
}

/// Item files found in one unit folder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitScan {
    pub positions: BTreeSet<u32>,
    /// Number of item files, which exceeds `positions.len()` when a position is duplicated
    /// under two extensions.
    pub item_count: u32,
}

impl UnitScan {
    pub fn verify(&self, expected_count: Option<u32>) -> Verdict {
        let verdict = verify(&self.positions, expected_count);
        if verdict.is_valid() && self.item_count as usize != self.positions.len() {
            return Verdict::Fail(IssueCode::CountMismatch {
                actual: self.item_count,
                expected: expected_count.unwrap_or_default(),
            });
        }
        verdict
    }
}

/// List the item positions held in a unit folder. A missing folder holds nothing.
pub fn scan_unit(unit_dir: &Path) -> Result<UnitScan, SyncError> {
    let mut scan = UnitScan::default();
    if !unit_dir.is_dir() {
        return Ok(scan);
    }

    for entry in fs::read_dir(unit_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_item = extension_of(&path).map(|ext| is_item_extension(&ext)).unwrap_or(false);
        if !is_item {
            continue;
        }
        if let Some(position) = path.file_name().and_then(|n| n.to_str()).and_then(parse_item_position) {
            scan.positions.insert(position);
            scan.item_count += 1;
        }
    }

    Ok(scan)
}

/// Unit folders under a collection folder, keyed by unit.
pub fn local_unit_dirs(collection_dir: &Path) -> Result<BTreeMap<u32, PathBuf>, SyncError> {
    let mut units = BTreeMap::new();
    if !collection_dir.is_dir() {
        return Ok(units);
    }

    for entry in fs::read_dir(collection_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(unit) = path.file_name().and_then(|n| n.to_str()).and_then(parse_unit_dir) {
            units.insert(unit, path);
        }
    }

    Ok(units)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitVerification {
    pub unit: u32,
    pub actual_count: u32,
    pub expected_count: Option<u32>,
    pub verdict: Verdict,
}

pub fn verify_unit(collection_dir: &Path, unit: u32, expected_count: Option<u32>) -> Result<UnitVerification, SyncError> {
    let scan = scan_unit(&collection_dir.join(unit_dir_name(unit)))?;
    Ok(UnitVerification {
        unit,
        actual_count: scan.item_count,
        expected_count,
        verdict: scan.verify(expected_count),
    })
}

#[derive(Debug, Clone, Default)]
pub struct CollectionVerification {
    pub units: Vec<UnitVerification>,
}

impl CollectionVerification {
    pub fn failing(&self) -> BTreeSet<u32> {
        self.units.iter().filter(|u| !u.verdict.is_valid()).map(|u| u.unit).collect()
    }

    pub fn passed(&self) -> BTreeSet<u32> {
        self.units.iter().filter(|u| u.verdict.is_valid()).map(|u| u.unit).collect()
    }
}

/// Verify every unit of a collection: each local unit folder plus each unit the
/// metadata table knows about. Expected counts come from the metadata table.
pub fn verify_collection(base_path: &Path, store: &MetadataStore, collection: &str) -> Result<CollectionVerification, SyncError> {
    let collection_dir = base_path.join(collection);
    let expected: BTreeMap<u32, Option<u32>> = store
        .scan(collection)?
        .into_iter()
        .map(|record| (record.unit, record.expected_count))
        .collect();

    let mut unit_keys: BTreeSet<u32> = local_unit_dirs(&collection_dir)?.into_keys().collect();
    unit_keys.extend(expected.keys().copied());

    let mut report = CollectionVerification::default();
    for unit in unit_keys {
        let expected_count = expected.get(&unit).copied().flatten();
        let outcome = verify_unit(&collection_dir, unit, expected_count)?;
        match outcome.verdict.issue() {
            None => debug!(collection, unit, items = outcome.actual_count, "unit verified"),
            Some(issue) => warn!(collection, unit, %issue, "unit incomplete"),
        }
        report.units.push(outcome);
    }

    info!(
        collection,
        checked = report.units.len(),
        failing = report.failing().len(),
        "verification finished"
    );
    Ok(report)
}
