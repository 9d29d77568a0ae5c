use crate::cancel::CancelToken;
use crate::fingerprint::{extension_of, is_item_extension, parse_item_position, Fingerprint};
use crate::remote::{ContainerStatus, RemoteStore};
use crate::verifier::local_unit_dirs;
use crate::SyncError;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Local items of a collection keyed by the fingerprint they should have remotely.
///
/// `units` limits discovery to the given unit keys; `None` takes every unit folder.
pub fn local_fingerprints(
    base_path: &Path,
    remote_prefix: &str,
    collection: &str,
    units: Option<&BTreeSet<u32>>,
) -> Result<BTreeMap<Fingerprint, PathBuf>, SyncError> {
    let mut items = BTreeMap::new();

    for (unit, unit_dir) in local_unit_dirs(&base_path.join(collection))? {
        if units.is_some_and(|allowed| !allowed.contains(&unit)) {
            continue;
        }
        for entry in fs::read_dir(&unit_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(ext) = extension_of(&path).filter(|ext| is_item_extension(ext)) else {
                continue;
            };
            // Only positioned items are verified, so only they have a remote identity
            let Some(position) = path.file_name().and_then(|n| n.to_str()).and_then(parse_item_position) else {
                continue;
            };
            let key = Fingerprint::for_item(remote_prefix, collection, unit, position, &ext);
            // panel-001.jpeg and panel-001.jpg are one item; the first one found wins
            items.entry(key).or_insert(path);
        }
    }

    Ok(items)
}

/// Keys present locally but absent remotely, in lexicographic order.
pub fn missing<'a>(local: impl IntoIterator<Item = &'a Fingerprint>, remote: &BTreeSet<Fingerprint>) -> Vec<Fingerprint> {
    let mut keys: Vec<Fingerprint> = local.into_iter().filter(|key| !remote.contains(*key)).cloned().collect();
    keys.sort();
    keys.dedup();
    keys
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub local_items: usize,
    pub remote_items: usize,
    pub missing: usize,
    pub containers_created: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub failed_keys: Vec<Fingerprint>,
    pub interrupted: bool,
}

/// Remote totals after a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCheck {
    pub remote_items: usize,
    pub residual_missing: usize,
}

/// Uploads whatever the verified local tree has that remote storage lacks. The work set
/// is recomputed as `local \ remote` on every pass.
pub struct Reconciler<'a, R: RemoteStore> {
    remote: &'a R,
    cancel: CancelToken,
}

impl<'a, R: RemoteStore> Reconciler<'a, R> {
    pub fn new(remote: &'a R, cancel: CancelToken) -> Self {
        Self { remote, cancel }
    }

    /// Upload every local item whose fingerprint is absent under `remote_prefix`.
    ///
    /// A listing failure aborts; container and per-item failures are counted and skipped.
    pub fn reconcile(&self, local: &BTreeMap<Fingerprint, PathBuf>, remote_prefix: &str) -> Result<SyncReport, SyncError> {
        let remote = self.remote.list_remote_fingerprints(remote_prefix)?;
        let missing_keys = missing(local.keys(), &remote);

        let mut report = SyncReport {
            local_items: local.len(),
            remote_items: remote.len(),
            missing: missing_keys.len(),
            ..SyncReport::default()
        };

        if missing_keys.is_empty() {
            info!(prefix = remote_prefix, local = local.len(), "all items already stored remotely");
            return Ok(report);
        }

        info!(prefix = remote_prefix, missing = missing_keys.len(), "uploading missing items");

        let containers: BTreeSet<&str> = missing_keys.iter().flat_map(|key| key.containers()).collect();
        for container in containers {
            match self.remote.ensure_remote_container(container) {
                Ok(ContainerStatus::Created) => {
                    debug!(container, "remote folder created");
                    report.containers_created += 1;
                }
                Ok(ContainerStatus::AlreadyExists) => {}
                Err(e) => warn!(container, error = %e, "remote folder could not be created"),
            }
        }

        let total = missing_keys.len();
        for key in missing_keys {
            if self.cancel.is_cancelled() {
                warn!(uploaded = report.uploaded, "upload interrupted");
                report.interrupted = true;
                break;
            }
            let Some(local_path) = local.get(&key) else {
                continue;
            };
            match self.remote.upload_item(local_path, &key) {
                Ok(()) => {
                    report.uploaded += 1;
                    debug!(%key, done = report.uploaded + report.failed, total, "uploaded");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(%key, error = %e, done = report.uploaded + report.failed, total, "upload failed");
                    report.failed_keys.push(key);
                }
            }
        }

        info!(uploaded = report.uploaded, failed = report.failed, "upload finished");
        Ok(report)
    }

    /// Re-list the remote prefix and count what is still missing.
    pub fn check(&self, local: &BTreeMap<Fingerprint, PathBuf>, remote_prefix: &str) -> Result<RemoteCheck, SyncError> {
        let remote = self.remote.list_remote_fingerprints(remote_prefix)?;
        Ok(RemoteCheck {
            remote_items: remote.len(),
            residual_missing: missing(local.keys(), &remote).len(),
        })
    }
}
