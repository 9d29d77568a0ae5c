use crate::SyncError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Replace `path` with `bytes` so that a crash leaves either the old or the new file.
///
/// The content goes to a sibling temp file first, is synced, then renamed over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = temp_sibling(path);
    // Remove temp file if it exists from a previous failed write
    if temp_path.exists() {
        fs::remove_file(&temp_path)?;
    }

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SyncError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Read a JSON document, treating a missing file as the type's default.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, SyncError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let bytes = fs::read(path)?;
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_write_atomic_replaces_content_and_leaves_no_temp() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested/table.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!temp_dir.path().join("nested/table.json.tmp").exists());
    }

    #[test]
    fn test_stale_temp_file_is_ignored() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("table.json");
        fs::write(temp_dir.path().join("table.json.tmp"), b"half-written").unwrap();

        write_atomic(&path, b"whole").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"whole");
    }

    #[test]
    fn test_missing_json_reads_as_default() {
        let temp_dir = tempfile::tempdir().unwrap();
        let value: BTreeMap<String, u32> = read_json_or_default(&temp_dir.path().join("absent.json")).unwrap();
        assert!(value.is_empty());
    }

    #[test]
    fn test_json_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("map.json");
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u32);

        write_json_atomic(&path, &map).unwrap();
        let loaded: BTreeMap<String, u32> = read_json_or_default(&path).unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_corrupt_json_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bad.json");
        fs::write(&path, b"{not json").unwrap();

        let result: Result<BTreeMap<String, u32>, SyncError> = read_json_or_default(&path);
        assert!(matches!(result, Err(SyncError::Serialization(_))));
    }
}
