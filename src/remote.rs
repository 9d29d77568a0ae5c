use crate::fingerprint::{canonicalize, Fingerprint};
use crate::persist::write_atomic;
use crate::SyncError;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    AlreadyExists,
}

/// Remote storage as the reconciler sees it: list keys under a prefix, create folders,
/// upload one item under an exact key.
pub trait RemoteStore {
    /// Fingerprints of everything stored under `prefix`, canonicalized.
    fn list_remote_fingerprints(&self, prefix: &str) -> Result<BTreeSet<Fingerprint>, SyncError>;

    /// Create the folder `prefix` if it is absent.
    fn ensure_remote_container(&self, prefix: &str) -> Result<ContainerStatus, SyncError>;

    /// Upload a local file under exactly `key`, never renaming and never overwriting.
    fn upload_item(&self, local_path: &Path, key: &Fingerprint) -> Result<(), SyncError>;
}

impl<T: RemoteStore + ?Sized> RemoteStore for Box<T> {
    fn list_remote_fingerprints(&self, prefix: &str) -> Result<BTreeSet<Fingerprint>, SyncError> {
        (**self).list_remote_fingerprints(prefix)
    }

    fn ensure_remote_container(&self, prefix: &str) -> Result<ContainerStatus, SyncError> {
        (**self).ensure_remote_container(prefix)
    }

    fn upload_item(&self, local_path: &Path, key: &Fingerprint) -> Result<(), SyncError> {
        (**self).upload_item(local_path, key)
    }
}

/// Remote store backed by a directory, e.g. a mounted share or a staging area.
pub struct DirRemote {
    root: PathBuf,
}

impl DirRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RemoteStore for DirRemote {
    fn list_remote_fingerprints(&self, prefix: &str) -> Result<BTreeSet<Fingerprint>, SyncError> {
        let base = self.root.join(prefix);
        let mut fingerprints = BTreeSet::new();
        if !base.is_dir() {
            return Ok(fingerprints);
        }

        for path in walk(&base)? {
            // In-flight writes are not stored items yet
            if path.extension().is_some_and(|ext| ext == "tmp") {
                continue;
            }
            let relative = path
                .strip_prefix(&self.root)
                .map_err(|e| SyncError::Remote(format!("listing {}: {}", path.display(), e)))?;
            fingerprints.insert(canonicalize(&relative.to_string_lossy()));
        }

        Ok(fingerprints)
    }

    fn ensure_remote_container(&self, prefix: &str) -> Result<ContainerStatus, SyncError> {
        let dir = self.root.join(prefix);
        if dir.is_dir() {
            return Ok(ContainerStatus::AlreadyExists);
        }
        fs::create_dir_all(&self.root)?;
        match fs::create_dir(&dir) {
            Ok(()) => Ok(ContainerStatus::Created),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(ContainerStatus::AlreadyExists),
            Err(e) => Err(SyncError::Remote(format!("create folder {}: {}", prefix, e))),
        }
    }

    fn upload_item(&self, local_path: &Path, key: &Fingerprint) -> Result<(), SyncError> {
        let target = self.root.join(key.as_str());
        if let Some(parent) = target.parent() {
            if !parent.is_dir() {
                return Err(SyncError::Remote(format!("missing folder for {}", key)));
            }
        }
        if target.exists() {
            return Err(SyncError::Transfer(format!("{} already exists remotely", key)));
        }

        let bytes = fs::read(local_path)?;
        write_atomic(&target, &bytes).map_err(|e| SyncError::Transfer(format!("upload {}: {}", key, e)))
    }
}

/// Every file below `path`, recursively.
pub(crate) fn walk(path: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let p = entry?.path();
        if p.is_dir() {
            files.extend(walk(&p)?);
        } else {
            files.push(p);
        }
    }
    Ok(files)
}
