use crate::fingerprint::{extension_of, is_item_extension, item_file_name, parse_item_position};
use crate::persist::write_atomic;
use crate::verifier::local_unit_dirs;
use crate::SyncError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One entry of a collection's unit inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRef {
    pub key: u32,
    pub locator: String,
}

/// What a single acquisition attempt produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acquisition {
    pub actual_count: u32,
    /// Item count the source advertised for the unit, if it could be observed.
    pub expected_count: Option<u32>,
    pub error: Option<String>,
}

impl Acquisition {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Where units come from and how one unit lands on disk.
pub trait Source {
    /// Authoritative, ordered unit inventory of a collection.
    fn list_units(&mut self, collection: &str) -> Result<Vec<UnitRef>, SyncError>;

    /// Fetch one unit's items into `destination`. Per-item failures are reported in the
    /// returned counts and error, never as `Err`.
    fn acquire_unit(&mut self, locator: &str, destination: &Path) -> Acquisition;
}

impl<T: Source + ?Sized> Source for Box<T> {
    fn list_units(&mut self, collection: &str) -> Result<Vec<UnitRef>, SyncError> {
        (**self).list_units(collection)
    }

    fn acquire_unit(&mut self, locator: &str, destination: &Path) -> Acquisition {
        (**self).acquire_unit(locator, destination)
    }
}

/// Store one item of a unit as `panel-NNN.<ext>` inside `destination`.
pub fn write_item(destination: &Path, position: u32, ext: &str, bytes: &[u8]) -> Result<PathBuf, SyncError> {
    let path = destination.join(item_file_name(position, ext));
    write_atomic(&path, bytes)?;
    Ok(path)
}

/// Reads units from a local mirror laid out like the working tree
/// (`<root>/<collection>/chapter-NNN/panel-NNN.ext`).
pub struct MirrorSource {
    root: PathBuf,
}

impl MirrorSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn mirror_items(unit_dir: &Path) -> Result<Vec<(u32, PathBuf)>, SyncError> {
        let mut items = Vec::new();
        for entry in fs::read_dir(unit_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if !extension_of(&path).map(|ext| is_item_extension(&ext)).unwrap_or(false) {
                continue;
            }
            if let Some(position) = path.file_name().and_then(|n| n.to_str()).and_then(parse_item_position) {
                items.push((position, path));
            }
        }
        items.sort();
        Ok(items)
    }
}

impl Source for MirrorSource {
    fn list_units(&mut self, collection: &str) -> Result<Vec<UnitRef>, SyncError> {
        let collection_dir = self.root.join(collection);
        if !collection_dir.is_dir() {
            return Err(SyncError::SourceUnavailable(format!(
                "no mirror for {} at {}",
                collection,
                collection_dir.display()
            )));
        }

        let units: Vec<UnitRef> = local_unit_dirs(&collection_dir)
            .map_err(|e| SyncError::SourceUnavailable(e.to_string()))?
            .into_iter()
            .map(|(key, path)| UnitRef {
                key,
                locator: path.to_string_lossy().to_string(),
            })
            .collect();

        if units.is_empty() {
            return Err(SyncError::SourceUnavailable(format!("no units listed for {}", collection)));
        }
        Ok(units)
    }

    fn acquire_unit(&mut self, locator: &str, destination: &Path) -> Acquisition {
        let items = match Self::mirror_items(Path::new(locator)) {
            Ok(items) => items,
            Err(e) => return Acquisition::failed(e.to_string()),
        };

        let expected = items.len() as u32;
        if expected == 0 {
            return Acquisition {
                expected_count: Some(0),
                ..Acquisition::failed("No images found")
            };
        }

        let mut copied = 0u32;
        let mut last_error = None;
        for (position, path) in items {
            let ext = extension_of(&path).unwrap_or_else(|| "jpg".to_string());
            let result = fs::read(&path)
                .map_err(SyncError::from)
                .and_then(|bytes| write_item(destination, position, &ext, &bytes));
            match result {
                Ok(written) => {
                    debug!(item = %written.display(), "item copied");
                    copied += 1;
                }
                Err(e) => {
                    warn!(item = %path.display(), error = %e, "item copy failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        Acquisition {
            actual_count: copied,
            expected_count: Some(expected),
            error: if copied == expected {
                None
            } else {
                Some(last_error.unwrap_or_else(|| format!("Downloaded {}/{}", copied, expected)))
            },
        }
    }
}
