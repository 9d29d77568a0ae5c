mod common;

use common::FlakyRemote;
use panelsync::cancel::CancelToken;
use panelsync::fingerprint::canonicalize;
use panelsync::reconciler::{local_fingerprints, Reconciler, RemoteCheck};
use panelsync::remote::{DirRemote, RemoteStore};
use panelsync::SyncError;
use std::fs;
use std::path::Path;

fn local_unit(base: &Path, unit_dir: &str, files: &[&str]) {
    let dir = base.join("solo").join(unit_dir);
    fs::create_dir_all(&dir).unwrap();
    for file in files {
        fs::write(dir.join(file), file.as_bytes()).unwrap();
    }
}

#[test]
fn test_only_missing_item_is_uploaded() {
    let temp_dir = tempfile::tempdir().unwrap();
    let base = temp_dir.path().join("local");
    local_unit(&base, "chapter-001", &["panel-001.jpg", "panel-002.jpg"]);

    let remote = FlakyRemote::new(&temp_dir.path().join("remote"));
    fs::create_dir_all(remote.inner.root().join("m/solo/chapter-001")).unwrap();
    fs::write(remote.inner.root().join("m/solo/chapter-001/panel-001.jpg"), b"x").unwrap();

    let local = local_fingerprints(&base, "m", "solo", None).unwrap();
    let reconciler = Reconciler::new(&remote, CancelToken::new());
    let report = reconciler.reconcile(&local, "m/solo").unwrap();

    assert_eq!(report.missing, 1);
    let uploads = remote.uploads.borrow();
    assert_eq!(uploads.iter().map(|k| k.as_str()).collect::<Vec<_>>(), vec!["m/solo/chapter-001/panel-002.jpg"]);
}

#[test]
fn test_second_pass_uploads_nothing() {
    let temp_dir = tempfile::tempdir().unwrap();
    let base = temp_dir.path().join("local");
    local_unit(&base, "chapter-001", &["panel-001.jpg", "panel-002.png"]);
    local_unit(&base, "chapter-002", &["panel-001.jpeg"]);

    let remote = DirRemote::new(temp_dir.path().join("remote"));
    let local = local_fingerprints(&base, "manga", "solo", None).unwrap();
    let reconciler = Reconciler::new(&remote, CancelToken::new());

    let first = reconciler.reconcile(&local, "manga/solo").unwrap();
    assert_eq!(first.uploaded, 3);
    // manga, manga/solo and one folder per unit
    assert_eq!(first.containers_created, 4);

    let second = reconciler.reconcile(&local, "manga/solo").unwrap();
    assert_eq!(second.missing, 0);
    assert_eq!(second.uploaded, 0);
    assert_eq!(reconciler.check(&local, "manga/solo").unwrap(), RemoteCheck { remote_items: 3, residual_missing: 0 });

    // Stored under the canonical spelling
    assert!(remote.root().join("manga/solo/chapter-002/panel-001.jpg").exists());
}

#[test]
fn test_jpeg_alias_counts_as_present_remotely() {
    let temp_dir = tempfile::tempdir().unwrap();
    let base = temp_dir.path().join("local");
    local_unit(&base, "chapter-001", &["panel-001.jpeg"]);

    let remote = FlakyRemote::new(&temp_dir.path().join("remote"));
    fs::create_dir_all(remote.inner.root().join("manga/solo/chapter-001")).unwrap();
    fs::write(remote.inner.root().join("manga/solo/chapter-001/panel-001.JPG"), b"x").unwrap();

    let local = local_fingerprints(&base, "manga", "solo", None).unwrap();
    let report = Reconciler::new(&remote, CancelToken::new()).reconcile(&local, "manga/solo").unwrap();

    // Only the extension is normalized, so an upper-case JPG is a different key
    assert_eq!(report.missing, 1);

    fs::remove_file(remote.inner.root().join("manga/solo/chapter-001/panel-001.JPG")).unwrap();
    fs::write(remote.inner.root().join("manga/solo/chapter-001/panel-001.jpg"), b"x").unwrap();
    let report = Reconciler::new(&remote, CancelToken::new()).reconcile(&local, "manga/solo").unwrap();
    assert_eq!(report.missing, 0);
}

#[test]
fn test_failed_upload_is_counted_and_left_for_next_pass() {
    let temp_dir = tempfile::tempdir().unwrap();
    let base = temp_dir.path().join("local");
    local_unit(&base, "chapter-001", &["panel-001.jpg", "panel-002.jpg", "panel-003.jpg"]);
    let remote_root = temp_dir.path().join("remote");
    let local = local_fingerprints(&base, "manga", "solo", None).unwrap();

    let flaky = FlakyRemote::new(&remote_root).failing_upload("manga/solo/chapter-001/panel-002.jpg");
    let reconciler = Reconciler::new(&flaky, CancelToken::new());
    let report = reconciler.reconcile(&local, "manga/solo").unwrap();
    assert_eq!((report.uploaded, report.failed), (2, 1));
    assert_eq!(report.failed_keys, vec![canonicalize("manga/solo/chapter-001/panel-002.jpg")]);
    assert_eq!(reconciler.check(&local, "manga/solo").unwrap().residual_missing, 1);

    let healthy = FlakyRemote::new(&remote_root);
    let report = Reconciler::new(&healthy, CancelToken::new()).reconcile(&local, "manga/solo").unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(healthy.uploads.borrow().len(), 1);
}

#[test]
fn test_listing_failure_aborts_reconciliation() {
    let temp_dir = tempfile::tempdir().unwrap();
    let base = temp_dir.path().join("local");
    local_unit(&base, "chapter-001", &["panel-001.jpg"]);

    let mut remote = FlakyRemote::new(&temp_dir.path().join("remote"));
    remote.fail_listing = true;
    let local = local_fingerprints(&base, "manga", "solo", None).unwrap();

    let result = Reconciler::new(&remote, CancelToken::new()).reconcile(&local, "manga/solo");
    assert!(matches!(result, Err(SyncError::Remote(_))));
    assert!(remote.uploads.borrow().is_empty());
}

#[test]
fn test_cancelled_reconciliation_uploads_nothing_further() {
    let temp_dir = tempfile::tempdir().unwrap();
    let base = temp_dir.path().join("local");
    local_unit(&base, "chapter-001", &["panel-001.jpg", "panel-002.jpg"]);

    let remote = DirRemote::new(temp_dir.path().join("remote"));
    let local = local_fingerprints(&base, "manga", "solo", None).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = Reconciler::new(&remote, cancel).reconcile(&local, "manga/solo").unwrap();
    assert!(report.interrupted);
    assert_eq!(report.uploaded, 0);
    assert!(remote.list_remote_fingerprints("manga/solo").unwrap().is_empty());
}
