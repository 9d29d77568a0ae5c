#![allow(dead_code)]

use panelsync::cancel::CancelToken;
use panelsync::config::PipelineConfig;
use panelsync::fingerprint::{canonicalize, Fingerprint};
use panelsync::remote::{ContainerStatus, DirRemote, RemoteStore};
use panelsync::source::{write_item, Acquisition, Source, UnitRef};
use panelsync::SyncError;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

/// In-memory source. Each unit has an advertised item count; by default every
/// acquisition delivers all items, but per-unit plans can deliver fewer.
pub struct FakeSource {
    expected: BTreeMap<u32, u32>,
    plans: BTreeMap<u32, VecDeque<Vec<u32>>>,
    pub unavailable: bool,
    pub list_calls: usize,
    pub acquired: Vec<u32>,
    /// Cancel this token once this many acquisitions have happened.
    pub cancel_after: Option<(usize, CancelToken)>,
}

impl FakeSource {
    pub fn new(units: &[(u32, u32)]) -> Self {
        Self {
            expected: units.iter().copied().collect(),
            plans: BTreeMap::new(),
            unavailable: false,
            list_calls: 0,
            acquired: Vec::new(),
            cancel_after: None,
        }
    }

    /// Queue the item positions delivered by successive acquisitions of `unit`.
    pub fn plan(mut self, unit: u32, attempts: &[&[u32]]) -> Self {
        self.plans
            .insert(unit, attempts.iter().map(|positions| positions.to_vec()).collect());
        self
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new(&[])
        }
    }

    pub fn acquisitions_of(&self, unit: u32) -> usize {
        self.acquired.iter().filter(|u| **u == unit).count()
    }
}

impl Source for FakeSource {
    fn list_units(&mut self, collection: &str) -> Result<Vec<UnitRef>, SyncError> {
        self.list_calls += 1;
        if self.unavailable {
            return Err(SyncError::SourceUnavailable(format!("{} is offline", collection)));
        }
        Ok(self
            .expected
            .keys()
            .map(|key| UnitRef {
                key: *key,
                locator: key.to_string(),
            })
            .collect())
    }

    fn acquire_unit(&mut self, locator: &str, destination: &Path) -> Acquisition {
        let Ok(unit) = locator.parse::<u32>() else {
            return Acquisition::failed("bad locator");
        };
        self.acquired.push(unit);
        if let Some((after, token)) = &self.cancel_after {
            if self.acquired.len() >= *after {
                token.cancel();
            }
        }

        let expected = self.expected.get(&unit).copied().unwrap_or(0);
        let positions = self
            .plans
            .get_mut(&unit)
            .and_then(|plan| plan.pop_front())
            .unwrap_or_else(|| (1..=expected).collect());

        let mut written = 0;
        for position in &positions {
            if write_item(destination, *position, "jpg", format!("{}-{}", unit, position).as_bytes()).is_ok() {
                written += 1;
            }
        }

        Acquisition {
            actual_count: written,
            expected_count: Some(expected),
            error: (written != expected).then(|| format!("Downloaded {}/{}", written, expected)),
        }
    }
}

/// Directory remote that can be told to fail listing or specific uploads.
pub struct FlakyRemote {
    pub inner: DirRemote,
    pub fail_listing: bool,
    pub fail_keys: BTreeSet<String>,
    pub uploads: RefCell<Vec<Fingerprint>>,
    /// Cancelled after the first successful upload.
    pub cancel_on_upload: Option<CancelToken>,
}

impl FlakyRemote {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: DirRemote::new(root),
            fail_listing: false,
            fail_keys: BTreeSet::new(),
            uploads: RefCell::new(Vec::new()),
            cancel_on_upload: None,
        }
    }

    pub fn failing_upload(mut self, key: &str) -> Self {
        self.fail_keys.insert(canonicalize(key).as_str().to_string());
        self
    }
}

impl RemoteStore for FlakyRemote {
    fn list_remote_fingerprints(&self, prefix: &str) -> Result<BTreeSet<Fingerprint>, SyncError> {
        if self.fail_listing {
            return Err(SyncError::Remote("listing refused".to_string()));
        }
        self.inner.list_remote_fingerprints(prefix)
    }

    fn ensure_remote_container(&self, prefix: &str) -> Result<ContainerStatus, SyncError> {
        self.inner.ensure_remote_container(prefix)
    }

    fn upload_item(&self, local_path: &Path, key: &Fingerprint) -> Result<(), SyncError> {
        if self.fail_keys.contains(key.as_str()) {
            return Err(SyncError::Transfer(format!("{} rejected", key)));
        }
        self.inner.upload_item(local_path, key)?;
        self.uploads.borrow_mut().push(key.clone());
        if let Some(token) = &self.cancel_on_upload {
            token.cancel();
        }
        Ok(())
    }
}

pub fn test_config(base: &Path) -> PipelineConfig {
    PipelineConfig::new(base.join("local")).without_delays()
}
