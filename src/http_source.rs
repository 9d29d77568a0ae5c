use crate::fingerprint::{is_item_extension, normalize_extension};
use crate::source::{write_item, Acquisition, Source, UnitRef};
use crate::SyncError;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_ITEM_DELAY_MS: u64 = 250;
const USER_AGENT: &str = concat!("panelsync/", env!("CARGO_PKG_VERSION"));

/// Site-specific parsing of fetched documents into unit inventories and item URLs.
pub trait PageExtractor {
    /// Where the unit index of `collection` lives.
    fn index_url(&self, base_url: &str, collection: &str) -> String;

    /// Ordered unit inventory from a fetched index document.
    fn extract_units(&self, document: &str) -> Result<Vec<UnitRef>, SyncError>;

    /// Ordered item URLs from a fetched unit document.
    fn extract_items(&self, document: &str) -> Result<Vec<String>, SyncError>;
}

#[derive(Deserialize)]
struct IndexManifest {
    units: Vec<UnitRef>,
}

#[derive(Deserialize)]
struct UnitManifest {
    items: Vec<String>,
}

/// Reads JSON manifests: `<base>/<collection>/index.json` holds
/// `{"units": [{"key": 1, "locator": "<url>"}]}` and each unit locator
/// points at `{"items": ["<url>", ...]}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestExtractor;

impl PageExtractor for ManifestExtractor {
    fn index_url(&self, base_url: &str, collection: &str) -> String {
        format!("{}/{}/index.json", base_url.trim_end_matches('/'), collection)
    }

    fn extract_units(&self, document: &str) -> Result<Vec<UnitRef>, SyncError> {
        let mut units = serde_json::from_str::<IndexManifest>(document)?.units;
        units.sort_by_key(|u| u.key);
        units.dedup_by_key(|u| u.key);
        Ok(units)
    }

    fn extract_items(&self, document: &str) -> Result<Vec<String>, SyncError> {
        Ok(serde_json::from_str::<UnitManifest>(document)?.items)
    }
}

pub struct HttpSource<E: PageExtractor> {
    client: Client,
    base_url: String,
    extractor: E,
    item_delay: Duration,
}

impl<E: PageExtractor> HttpSource<E> {
    pub fn new(base_url: impl Into<String>, extractor: E) -> Result<Self, SyncError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Other(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            extractor,
            item_delay: Duration::from_millis(DEFAULT_ITEM_DELAY_MS),
        })
    }

    fn get_text(&self, url: &str) -> Result<String, SyncError> {
        self.client
            .get(url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.text())
            .map_err(|e| SyncError::Transfer(format!("GET {}: {}", url, e)))
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SyncError> {
        self.client
            .get(url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.bytes())
            .map(|bytes| bytes.to_vec())
            .map_err(|e| SyncError::Transfer(format!("GET {}: {}", url, e)))
    }
}

/// Item extension taken from the URL path, `jpg` when absent or unrecognised.
pub fn item_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
        Some((_, ext)) if is_item_extension(&ext.to_ascii_lowercase()) => {
            normalize_extension(&format!(".{}", ext.to_ascii_lowercase())).trim_start_matches('.').to_string()
        }
        _ => "jpg".to_string(),
    }
}

impl<E: PageExtractor> Source for HttpSource<E> {
    fn list_units(&mut self, collection: &str) -> Result<Vec<UnitRef>, SyncError> {
        let url = self.extractor.index_url(&self.base_url, collection);
        let document = self
            .get_text(&url)
            .map_err(|e| SyncError::SourceUnavailable(e.to_string()))?;
        let units = self
            .extractor
            .extract_units(&document)
            .map_err(|e| SyncError::SourceUnavailable(format!("{}: {}", url, e)))?;
        if units.is_empty() {
            return Err(SyncError::SourceUnavailable(format!("no units listed at {}", url)));
        }
        info!(collection, units = units.len(), "unit index fetched");
        Ok(units)
    }

    fn acquire_unit(&mut self, locator: &str, destination: &Path) -> Acquisition {
        let items = match self.get_text(locator).and_then(|doc| self.extractor.extract_items(&doc)) {
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

        let mut written = 0u32;
        let mut last_error = None;
        for (index, url) in items.iter().enumerate() {
            if index > 0 && !self.item_delay.is_zero() {
                thread::sleep(self.item_delay);
            }
            // A failed item is not written, leaving a gap the verifier reports
            let position = index as u32 + 1;
            match self
                .get_bytes(url)
                .and_then(|bytes| write_item(destination, position, &item_extension(url), &bytes))
            {
                Ok(path) => {
                    debug!(item = %path.display(), "item downloaded");
                    written += 1;
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "item download failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        Acquisition {
            actual_count: written,
            expected_count: Some(expected),
            error: if written == expected {
                None
            } else {
                Some(last_error.unwrap_or_else(|| format!("Downloaded {}/{}", written, expected)))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_extension_from_url() {
        assert_eq!(item_extension("https://cdn.example/a/001.JPEG?token=1"), "jpg");
        assert_eq!(item_extension("https://cdn.example/a/002.webp"), "webp");
        assert_eq!(item_extension("https://cdn.example/a/003"), "jpg");
        assert_eq!(item_extension("https://cdn.example/a.b/003.php"), "jpg");
    }

    #[test]
    fn test_manifest_extractor() {
        let extractor = ManifestExtractor;
        assert_eq!(extractor.index_url("https://m.example/", "solo"), "https://m.example/solo/index.json");

        let units = extractor
            .extract_units(r#"{"units":[{"key":2,"locator":"u2"},{"key":1,"locator":"u1"},{"key":2,"locator":"dup"}]}"#)
            .unwrap();
        assert_eq!(units.iter().map(|u| u.key).collect::<Vec<_>>(), vec![1, 2]);

        let items = extractor.extract_items(r#"{"items":["a.jpg","b.png"]}"#).unwrap();
        assert_eq!(items, vec!["a.jpg", "b.png"]);

        assert!(extractor.extract_items("<html>").is_err());
    }
}
