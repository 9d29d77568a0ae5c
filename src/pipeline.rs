use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::metadata_store::{MetadataStore, UnitRecord, UnitStatus};
use crate::progress::{CollectionState, CollectionStatus, FinalSummary, ProgressLog};
use crate::reconciler::{local_fingerprints, Reconciler, RemoteCheck, SyncReport};
use crate::remote::RemoteStore;
use crate::retry::{ConvergenceController, ConvergenceOutcome, RepairRound, RoundOutcome};
use crate::source::{Source, UnitRef};
use crate::verifier::{verify_collection, verify_unit, CollectionVerification, UnitVerification};
use crate::SyncError;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{info, instrument, warn};

const NOT_IN_INVENTORY: &str = "unit not found in source inventory";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Clear all stage flags and run every stage again.
    pub force_restart: bool,
    /// Inclusive lower bound on unit keys to acquire.
    pub start_unit: Option<u32>,
    /// Inclusive upper bound on unit keys to acquire.
    pub end_unit: Option<u32>,
}

impl RunOptions {
    fn in_range(&self, unit: u32) -> bool {
        self.start_unit.is_none_or(|start| unit >= start) && self.end_unit.is_none_or(|end| unit <= end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Acquire,
    Verify,
    Repair,
    Sync,
}

/// Outcome of one pipeline invocation.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub collection: String,
    pub status: CollectionStatus,
    /// Units acquired or repaired into a complete state during this run.
    pub succeeded: usize,
    /// Units still unresolved when the run ended.
    pub failed: usize,
    /// Units left alone because they were already complete.
    pub skipped: usize,
    pub unresolved_units: Vec<u32>,
    pub uploaded: usize,
    pub upload_failed: usize,
    pub residual_missing: usize,
    pub stages_run: Vec<Stage>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn is_done(&self) -> bool {
        self.status == CollectionStatus::Done
    }
}

/// One collection of a batch, with its own acquisition range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub slug: String,
    #[serde(default)]
    pub start_unit: Option<u32>,
    #[serde(default)]
    pub end_unit: Option<u32>,
}

impl BatchEntry {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            start_unit: None,
            end_unit: None,
        }
    }

    /// Read a JSON array of entries.
    pub fn load_list(path: &Path) -> Result<Vec<BatchEntry>, SyncError> {
        let bytes = fs::read(path)?;
        let entries: Vec<BatchEntry> = serde_json::from_slice(&bytes)?;
        if entries.is_empty() {
            return Err(SyncError::Config(format!("batch file {} lists no collections", path.display())));
        }
        Ok(entries)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub reports: Vec<RunReport>,
    /// Entries never started because the batch was interrupted.
    pub not_started: Vec<String>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.reports.iter().filter(|r| r.is_done()).count()
    }

    pub fn total(&self) -> usize {
        self.reports.len() + self.not_started.len()
    }

    pub fn all_done(&self) -> bool {
        self.not_started.is_empty() && self.reports.iter().all(RunReport::is_done)
    }
}

enum Flow {
    Continue,
    Halt,
}

/// Drives collections through acquire, verify, repair and sync.
///
/// Progress is persisted after every stage transition and every repair round. A rerun
/// picks up at the first stage whose completion flag is unset.
pub struct Pipeline<S: Source, R: RemoteStore> {
    config: PipelineConfig,
    source: S,
    remote: R,
    store: MetadataStore,
    progress: ProgressLog,
    cancel: CancelToken,
}

impl<S: Source, R: RemoteStore> Pipeline<S, R> {
    pub fn new(config: PipelineConfig, source: S, remote: R) -> Self {
        let store = MetadataStore::open(&config.metadata_path);
        let progress = ProgressLog::open(&config.progress_path);
        Self {
            config,
            source,
            remote,
            store,
            progress,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn progress(&self) -> &ProgressLog {
        &self.progress
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Run (or resume) the pipeline for one collection.
    ///
    /// Stage-level failures end the run in `failed` and are reported, not returned;
    /// `Err` means the persisted state itself could not be read or written.
    #[instrument(skip(self, options))]
    pub fn run(&mut self, collection: &str, options: &RunOptions) -> Result<RunReport, SyncError> {
        let mut state = self.progress.get(collection)?;
        info!(status = %state.status, "pipeline starting");

        if options.force_restart {
            info!("forced restart, clearing stage flags");
            state.reset_for_restart();
        } else if state.status == CollectionStatus::Done {
            info!("collection already fully processed, nothing to do");
            return Ok(RunReport {
                collection: collection.to_string(),
                status: state.status,
                ..RunReport::default()
            });
        } else if state.status == CollectionStatus::Failed && !state.failing_units.is_empty() {
            info!(outstanding = state.failing_units.len(), "retrying outstanding units with a fresh budget");
            state.verification_complete = false;
            state.sync_complete = false;
            state.retry_count = 0;
        }

        let run = Run {
            config: &self.config,
            source: &mut self.source,
            remote: &self.remote,
            store: &self.store,
            progress: &self.progress,
            cancel: &self.cancel,
            collection,
            options,
            state,
            report: RunReport {
                collection: collection.to_string(),
                ..RunReport::default()
            },
            inventory: None,
        };
        run.execute()
    }

    /// Run each entry in order, pausing between collections. Every collection keeps its
    /// own progress entry, so one failing never affects the others.
    #[instrument(skip_all, fields(collections = entries.len()))]
    pub fn run_batch(&mut self, entries: &[BatchEntry], force_restart: bool) -> Result<BatchReport, SyncError> {
        let mut batch = BatchReport::default();
        for (index, entry) in entries.iter().enumerate() {
            let cancelled = if index == 0 {
                self.cancel.is_cancelled()
            } else {
                info!(delay_secs = self.config.collection_delay.as_secs(), "waiting before next collection");
                self.cancel.sleep(self.config.collection_delay)
            };
            if cancelled {
                warn!(remaining = entries.len() - index, "batch interrupted");
                batch.not_started = entries[index..].iter().map(|e| e.slug.clone()).collect();
                break;
            }

            let options = RunOptions {
                force_restart,
                start_unit: entry.start_unit,
                end_unit: entry.end_unit,
            };
            let report = self.run(&entry.slug, &options)?;
            info!(collection = %entry.slug, status = %report.status, "batch entry finished");
            batch.reports.push(report);
        }
        info!(succeeded = batch.succeeded(), total = batch.total(), "batch finished");
        Ok(batch)
    }

    /// Verify a collection without acquiring, repairing or touching the progress log.
    pub fn verify_only(&self, collection: &str) -> Result<CollectionVerification, SyncError> {
        verify_collection(&self.config.base_path, &self.store, collection)
    }

    /// Reconcile a collection with remote storage outside of a full run.
    pub fn sync_only(&self, collection: &str) -> Result<(SyncReport, RemoteCheck), SyncError> {
        let units = if self.config.upload_unverified {
            None
        } else {
            Some(self.verify_only(collection)?.passed())
        };
        let local = local_fingerprints(&self.config.base_path, &self.config.remote_prefix, collection, units.as_ref())?;
        let prefix = self.config.remote_collection_prefix(collection);
        let reconciler = Reconciler::new(&self.remote, self.cancel.clone());
        let report = reconciler.reconcile(&local, &prefix)?;
        let check = reconciler.check(&local, &prefix)?;
        Ok((report, check))
    }
}

/// Record implied by a fresh verification of a unit.
fn record_for(collection: &str, outcome: &UnitVerification, error: Option<String>) -> UnitRecord {
    let (status, error) = match outcome.verdict.issue() {
        None => (UnitStatus::Success, String::new()),
        Some(issue) => {
            let status = if outcome.actual_count > 0 { UnitStatus::Partial } else { UnitStatus::Failed };
            (status, error.filter(|e| !e.is_empty()).unwrap_or_else(|| issue.to_string()))
        }
    };
    UnitRecord {
        actual_count: outcome.actual_count,
        expected_count: outcome.expected_count,
        status,
        error,
        ..UnitRecord::new(collection, outcome.unit)
    }
}

/// State of one invocation. Holds the only mutable view of the collection.
struct Run<'a, S: Source, R: RemoteStore> {
    config: &'a PipelineConfig,
    source: &'a mut S,
    remote: &'a R,
    store: &'a MetadataStore,
    progress: &'a ProgressLog,
    cancel: &'a CancelToken,
    collection: &'a str,
    options: &'a RunOptions,
    state: CollectionState,
    report: RunReport,
    /// Full unit inventory, listed at most once per run.
    inventory: Option<BTreeMap<u32, UnitRef>>,
}

impl<'a, S: Source, R: RemoteStore> Run<'a, S, R> {
    fn execute(mut self) -> Result<RunReport, SyncError> {
        if self.state.acquisition_complete {
            info!("acquisition already complete, skipping");
        } else if let Flow::Halt = self.acquire_stage()? {
            return Ok(self.into_report());
        }

        if self.state.verification_complete {
            info!("verification already complete, skipping");
        } else if let Flow::Halt = self.verify_stage()? {
            return Ok(self.into_report());
        }

        if self.state.sync_complete {
            info!("sync already complete, skipping");
        } else if let Flow::Halt = self.sync_stage()? {
            return Ok(self.into_report());
        }

        self.finish()
    }

    fn acquire_stage(&mut self) -> Result<Flow, SyncError> {
        self.enter(CollectionStatus::Acquiring, Stage::Acquire)?;

        let options = self.options;
        let listed = self
            .inventory()
            .map(|inventory| inventory.values().filter(|u| options.in_range(u.key)).cloned().collect::<Vec<_>>());
        let units = match listed {
            Ok(units) => units,
            Err(e) => return self.fail(e),
        };
        info!(units = units.len(), "acquiring units");
        self.state.total_units = Some(units.len());

        let mut failing = BTreeSet::new();
        let mut acquired_any = false;
        for unit in &units {
            if self.cancel.is_cancelled() {
                return self.interrupt();
            }
            if self.is_already_complete(unit.key)? {
                info!(unit = unit.key, "unit already complete, skipping");
                self.report.skipped += 1;
                continue;
            }
            if acquired_any && self.pause_between_units() {
                return self.interrupt();
            }
            acquired_any = true;

            if self.acquire_one(unit)? {
                self.report.succeeded += 1;
            } else {
                failing.insert(unit.key);
            }
        }

        info!(
            acquired = self.report.succeeded,
            skipped = self.report.skipped,
            failed = failing.len(),
            "acquisition finished"
        );
        self.state.failing_units = failing.into_iter().collect();
        self.state.acquisition_complete = true;
        self.save()?;
        Ok(Flow::Continue)
    }

    fn verify_stage(&mut self) -> Result<Flow, SyncError> {
        self.enter(CollectionStatus::Verifying, Stage::Verify)?;

        let verification = verify_collection(&self.config.base_path, self.store, self.collection)?;
        for outcome in &verification.units {
            self.align_row(outcome)?;
        }

        // Carried-over units stay failing unless they now verify
        let passed = verification.passed();
        let mut failing: BTreeSet<u32> =
            self.state.failing_units.iter().copied().filter(|unit| !passed.contains(unit)).collect();
        failing.extend(verification.failing());
        self.state.failing_units = failing.iter().copied().collect();
        self.save()?;

        if !failing.is_empty() {
            if let Flow::Halt = self.repair_stage(failing)? {
                return Ok(Flow::Halt);
            }
        }

        self.state.verification_complete = true;
        self.save()?;
        Ok(Flow::Continue)
    }

    fn repair_stage(&mut self, failing: BTreeSet<u32>) -> Result<Flow, SyncError> {
        self.enter(CollectionStatus::Repairing, Stage::Repair)?;
        info!(failing = failing.len(), units = %failing.iter().join(", "), "repairing failing units");

        let controller = ConvergenceController::new(self.config.retry_ceiling, self.config.settle_delay);
        let cancel = self.cancel;
        let mut retry_count = self.state.retry_count;

        let outcome = match controller.run(failing, &mut retry_count, self, cancel) {
            Ok(outcome) => outcome,
            Err(e @ SyncError::SourceUnavailable(_)) => return self.fail(e),
            Err(e) => return Err(e),
        };
        self.state.retry_count = retry_count;

        match outcome {
            ConvergenceOutcome::Converged { rounds } => {
                info!(rounds, "repair converged");
                self.state.failing_units.clear();
            }
            ConvergenceOutcome::CeilingReached { remaining, rounds } => {
                warn!(
                    rounds,
                    remaining = remaining.len(),
                    units = %remaining.iter().join(", "),
                    "reached max retry attempts"
                );
                self.state.failing_units = remaining.into_iter().collect();
            }
            ConvergenceOutcome::Interrupted { remaining } => {
                self.state.failing_units = remaining.into_iter().collect();
                return self.interrupt();
            }
        }
        Ok(Flow::Continue)
    }

    fn sync_stage(&mut self) -> Result<Flow, SyncError> {
        self.enter(CollectionStatus::Syncing, Stage::Sync)?;

        let verification = verify_collection(&self.config.base_path, self.store, self.collection)?;
        let verified = verification.passed();
        let units = if self.config.upload_unverified { None } else { Some(&verified) };
        let local = local_fingerprints(&self.config.base_path, &self.config.remote_prefix, self.collection, units)?;
        let prefix = self.config.remote_collection_prefix(self.collection);

        let reconciler = Reconciler::new(self.remote, self.cancel.clone());
        let sync = match reconciler.reconcile(&local, &prefix) {
            Ok(sync) => sync,
            Err(e) => return self.fail(e),
        };
        self.report.uploaded = sync.uploaded;
        self.report.upload_failed = sync.failed;
        self.state.uploaded_count = sync.uploaded;
        self.state.upload_failed_count = sync.failed;

        if sync.interrupted {
            return self.interrupt();
        }

        let check = match reconciler.check(&local, &prefix) {
            Ok(check) => check,
            Err(e) => return self.fail(e),
        };
        info!(
            remote_items = check.remote_items,
            residual_missing = check.residual_missing,
            "remote check finished"
        );

        self.report.residual_missing = check.residual_missing;
        self.state.sync_complete = check.residual_missing == 0;
        self.state.summary = Some(FinalSummary {
            local_units: verification.units.len(),
            local_issues: verification.failing().len(),
            remote_items: check.remote_items,
            missing_remote: check.residual_missing,
        });
        self.save()?;
        Ok(Flow::Continue)
    }

    fn finish(mut self) -> Result<RunReport, SyncError> {
        let done = self.state.failing_units.is_empty() && self.state.sync_complete;
        if done {
            self.state.status = CollectionStatus::Done;
            self.state.last_error = None;
            info!("pipeline complete");
        } else {
            self.state.status = CollectionStatus::Failed;
            self.state.last_error = Some(format!(
                "{} units unresolved, {} items missing remotely",
                self.state.failing_units.len(),
                self.report.residual_missing
            ));
            warn!(
                unresolved = self.state.failing_units.len(),
                residual_missing = self.report.residual_missing,
                "pipeline finished with errors"
            );
        }
        self.save()?;
        Ok(self.into_report())
    }

    /// Acquire one unit, verify what landed on disk and record it. True when complete.
    fn acquire_one(&mut self, unit: &UnitRef) -> Result<bool, SyncError> {
        let destination = self.config.unit_dir(self.collection, unit.key);
        info!(unit = unit.key, "acquiring unit");
        let acquisition = self.source.acquire_unit(&unit.locator, &destination);

        // A fresh observation wins; otherwise keep the last known expected count
        let expected = match acquisition.expected_count.filter(|n| *n > 0) {
            Some(n) => Some(n),
            None => self.store.get(self.collection, unit.key)?.and_then(|r| r.expected_count),
        };

        let outcome = verify_unit(&self.config.collection_dir(self.collection), unit.key, expected)?;
        let complete = outcome.verdict.is_valid();
        match outcome.verdict.issue() {
            None => info!(unit = unit.key, items = outcome.actual_count, "unit complete"),
            Some(issue) => warn!(unit = unit.key, %issue, error = ?acquisition.error, "unit incomplete"),
        }

        self.store.upsert(record_for(self.collection, &outcome, acquisition.error))?;
        Ok(complete)
    }

    fn is_already_complete(&self, unit: u32) -> Result<bool, SyncError> {
        match self.store.get(self.collection, unit)? {
            Some(record) if record.is_success() => {
                let outcome = verify_unit(&self.config.collection_dir(self.collection), unit, record.expected_count)?;
                Ok(outcome.verdict.is_valid())
            }
            _ => Ok(false),
        }
    }

    /// Bring a unit's stored row in line with its verdict, so a row reads `success`
    /// exactly when the unit verifies.
    fn align_row(&self, outcome: &UnitVerification) -> Result<(), SyncError> {
        let existing = self.store.get(self.collection, outcome.unit)?;
        let previous_error = existing.as_ref().map(|r| r.error.clone());
        let record = record_for(self.collection, outcome, previous_error);
        let unchanged = existing
            .as_ref()
            .is_some_and(|r| r.status == record.status && r.actual_count == record.actual_count);
        if !unchanged {
            self.store.upsert(record)?;
        }
        Ok(())
    }

    fn inventory(&mut self) -> Result<&BTreeMap<u32, UnitRef>, SyncError> {
        if self.inventory.is_none() {
            let units = self.source.list_units(self.collection)?;
            if units.is_empty() {
                return Err(SyncError::SourceUnavailable(format!("no units listed for {}", self.collection)));
            }
            info!(units = units.len(), "unit inventory listed");
            self.inventory = Some(units.into_iter().map(|u| (u.key, u)).collect());
        }
        self.inventory
            .as_ref()
            .ok_or_else(|| SyncError::Other("inventory missing after listing".to_string()))
    }

    /// Politeness pause between acquisitions. True when cancelled meanwhile.
    fn pause_between_units(&self) -> bool {
        if self.config.unit_delay.is_zero() {
            return self.cancel.is_cancelled();
        }
        self.cancel.sleep(self.config.unit_delay)
    }

    fn enter(&mut self, status: CollectionStatus, stage: Stage) -> Result<(), SyncError> {
        self.state.status = status;
        self.report.stages_run.push(stage);
        self.save()
    }

    fn fail(&mut self, error: SyncError) -> Result<Flow, SyncError> {
        warn!(error = %error, "stage failed, aborting run");
        self.state.status = CollectionStatus::Failed;
        self.state.last_error = Some(error.to_string());
        self.report.error = Some(error.to_string());
        self.save()?;
        Ok(Flow::Halt)
    }

    fn interrupt(&mut self) -> Result<Flow, SyncError> {
        warn!("run interrupted");
        self.state.status = CollectionStatus::Interrupted;
        self.save()?;
        Ok(Flow::Halt)
    }

    fn save(&mut self) -> Result<(), SyncError> {
        self.progress.save(self.collection, &mut self.state)
    }

    fn into_report(self) -> RunReport {
        let mut report = self.report;
        report.status = self.state.status;
        report.unresolved_units = self.state.failing_units;
        report.failed = report.unresolved_units.len();
        report
    }
}

impl<'a, S: Source, R: RemoteStore> RepairRound for Run<'a, S, R> {
    fn repair(&mut self, failing: &BTreeSet<u32>) -> Result<RoundOutcome, SyncError> {
        let inventory = self.inventory()?.clone();
        let mut still_failing = BTreeSet::new();
        let mut acquired_any = false;

        for &unit in failing {
            if self.cancel.is_cancelled() {
                return Ok(RoundOutcome::Interrupted);
            }
            let Some(unit_ref) = inventory.get(&unit) else {
                warn!(unit, "{}", NOT_IN_INVENTORY);
                let mut record = self
                    .store
                    .get(self.collection, unit)?
                    .unwrap_or_else(|| UnitRecord::new(self.collection, unit));
                record.status = if record.actual_count > 0 { UnitStatus::Partial } else { UnitStatus::Failed };
                record.error = NOT_IN_INVENTORY.to_string();
                self.store.upsert(record)?;
                still_failing.insert(unit);
                continue;
            };

            if acquired_any && self.pause_between_units() {
                return Ok(RoundOutcome::Interrupted);
            }
            acquired_any = true;

            if self.acquire_one(unit_ref)? {
                self.report.succeeded += 1;
            } else {
                still_failing.insert(unit);
            }
        }

        Ok(RoundOutcome::Finished(still_failing))
    }

    fn checkpoint(&mut self, retry_count: u32, failing: &BTreeSet<u32>) -> Result<(), SyncError> {
        self.state.retry_count = retry_count;
        self.state.failing_units = failing.iter().copied().collect();
        self.save()
    }
}
