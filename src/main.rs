use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use itertools::Itertools;
use panelsync::cancel::CancelToken;
use panelsync::config::PipelineConfig;
use panelsync::pipeline::{BatchEntry, BatchReport, Pipeline, RunOptions, RunReport};
use panelsync::progress::CollectionState;
use panelsync::remote::{DirRemote, RemoteStore};
use panelsync::source::{Acquisition, MirrorSource, Source, UnitRef};
use panelsync::SyncError;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "panelsync")]
#[command(about = "Acquire, verify, repair and mirror manga collections", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Local root holding one folder per collection
    #[arg(long, global = true)]
    base_path: Option<PathBuf>,
    /// Remote folder collections are stored under
    #[arg(long, global = true)]
    remote_prefix: Option<String>,
    /// Repair rounds without progress before giving up
    #[arg(long, global = true)]
    retry_ceiling: Option<u32>,
    /// Pause between repair rounds
    #[arg(long, global = true)]
    settle_delay_secs: Option<u64>,
    /// Read units from a local mirror directory
    #[arg(long, global = true)]
    mirror: Option<PathBuf>,
    /// Store the remote copy in a directory
    #[arg(long, global = true)]
    remote_dir: Option<PathBuf>,
    /// Fetch units over HTTP from JSON manifests under this URL (needs the distributed feature)
    #[arg(long, global = true)]
    source_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or resume the full pipeline for one or more collections
    Run {
        /// Collections to process in order
        #[arg(required_unless_present = "batch", conflicts_with = "batch")]
        slugs: Vec<String>,
        /// JSON list of {"slug", "start_unit", "end_unit"} entries
        #[arg(long)]
        batch: Option<PathBuf>,
        /// Clear stage flags and start over
        #[arg(long)]
        force: bool,
        /// First unit to acquire
        #[arg(long, conflicts_with = "batch")]
        start: Option<u32>,
        /// Last unit to acquire
        #[arg(long, conflicts_with = "batch")]
        end: Option<u32>,
        /// Pause between collections
        #[arg(long)]
        collection_delay_secs: Option<u64>,
    },
    /// Show persisted progress
    Status { slug: Option<String> },
    /// Verify the local copy of a collection
    Verify { slug: String },
    /// Upload whatever the remote copy is missing
    Sync { slug: String },
}

/// Stand-in for commands that never acquire.
struct NoSource;

impl Source for NoSource {
    fn list_units(&mut self, collection: &str) -> Result<Vec<UnitRef>, SyncError> {
        Err(SyncError::SourceUnavailable(format!(
            "no source configured for {}, pass --mirror",
            collection
        )))
    }

    fn acquire_unit(&mut self, _locator: &str, _destination: &Path) -> Acquisition {
        Acquisition::failed("no source configured")
    }
}

fn build_config(global: &GlobalArgs) -> Result<PipelineConfig, SyncError> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(base_path) = &global.base_path {
        let defaults = PipelineConfig::new(base_path);
        config.base_path = defaults.base_path;
        config.metadata_path = defaults.metadata_path;
        config.progress_path = defaults.progress_path;
    }
    if let Some(prefix) = &global.remote_prefix {
        config.remote_prefix = prefix.clone();
    }
    if let Some(ceiling) = global.retry_ceiling {
        config.retry_ceiling = ceiling;
    }
    if let Some(secs) = global.settle_delay_secs {
        config.settle_delay = Duration::from_secs(secs);
    }
    Ok(config)
}

fn build_source(global: &GlobalArgs) -> Result<Box<dyn Source>, SyncError> {
    if let Some(mirror) = &global.mirror {
        return Ok(Box::new(MirrorSource::new(mirror)));
    }
    if let Some(url) = &global.source_url {
        return http_source(url);
    }
    Ok(Box::new(NoSource))
}

#[cfg(feature = "distributed")]
fn http_source(url: &str) -> Result<Box<dyn Source>, SyncError> {
    let source = panelsync::http_source::HttpSource::new(url, panelsync::http_source::ManifestExtractor)?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "distributed"))]
fn http_source(_url: &str) -> Result<Box<dyn Source>, SyncError> {
    Err(SyncError::Config("--source-url needs the distributed feature".to_string()))
}

fn build_remote(global: &GlobalArgs) -> Result<Box<dyn RemoteStore>, SyncError> {
    if let Some(dir) = &global.remote_dir {
        return Ok(Box::new(DirRemote::new(dir)));
    }
    s3_remote()?.ok_or_else(|| {
        SyncError::Config("no remote configured, pass --remote-dir or set PANELSYNC_S3_BUCKET".to_string())
    })
}

#[cfg(feature = "distributed")]
fn s3_remote() -> Result<Option<Box<dyn RemoteStore>>, SyncError> {
    Ok(panelsync::s3_remote::S3Remote::try_from_env()?.map(|remote| Box::new(remote) as Box<dyn RemoteStore>))
}

#[cfg(not(feature = "distributed"))]
fn s3_remote() -> Result<Option<Box<dyn RemoteStore>>, SyncError> {
    Ok(None)
}

fn install_interrupt_handler(cancel: CancelToken) {
    std::thread::spawn(move || {
        let Ok(runtime) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
            return;
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, finishing current step");
                cancel.cancel();
            }
        });
    });
}

fn print_report(report: &RunReport) {
    println!("collection: {}", report.collection);
    println!("status: {}", report.status);
    println!(
        "units: {} succeeded, {} failed, {} skipped",
        report.succeeded, report.failed, report.skipped
    );
    if !report.unresolved_units.is_empty() {
        println!("unresolved: {}", report.unresolved_units.iter().join(", "));
    }
    println!(
        "upload: {} uploaded, {} failed, {} still missing",
        report.uploaded, report.upload_failed, report.residual_missing
    );
    if let Some(error) = &report.error {
        println!("error: {}", error);
    }
}

fn print_batch(batch: &BatchReport) {
    println!();
    println!("batch summary");
    println!("successful: {}/{}", batch.succeeded(), batch.total());
    println!("failed: {}/{}", batch.total() - batch.succeeded(), batch.total());
    for report in &batch.reports {
        let mark = if report.is_done() { "ok" } else { "FAILED" };
        println!("  {} {} ({})", mark, report.collection, report.status);
    }
    for slug in &batch.not_started {
        println!("  SKIPPED {} (not started)", slug);
    }
}

fn print_state(slug: &str, state: &CollectionState) {
    println!(
        "{}: {} (acquired: {}, verified: {}, synced: {}, retries: {}, last run: {})",
        slug,
        state.status,
        state.acquisition_complete,
        state.verification_complete,
        state.sync_complete,
        state.retry_count,
        state.last_run.map(|t| t.to_string()).unwrap_or_else(|| "never".to_string()),
    );
    if !state.failing_units.is_empty() {
        println!("  failing: {}", state.failing_units.iter().join(", "));
    }
    if let Some(summary) = &state.summary {
        println!(
            "  local units: {}, local issues: {}, remote items: {}, missing remotely: {}",
            summary.local_units, summary.local_issues, summary.remote_items, summary.missing_remote
        );
    }
    if let Some(error) = &state.last_error {
        println!("  last error: {}", error);
    }
}

fn run_cli(cli: Cli) -> Result<bool, SyncError> {
    let config = build_config(&cli.global)?;

    match cli.command {
        Commands::Run {
            slugs,
            batch,
            force,
            start,
            end,
            collection_delay_secs,
        } => {
            let mut config = config;
            if let Some(secs) = collection_delay_secs {
                config.collection_delay = Duration::from_secs(secs);
            }
            let cancel = CancelToken::new();
            install_interrupt_handler(cancel.clone());
            let mut pipeline =
                Pipeline::new(config, build_source(&cli.global)?, build_remote(&cli.global)?).with_cancel_token(cancel);

            let entries = match &batch {
                Some(path) => BatchEntry::load_list(path)?,
                None => slugs
                    .iter()
                    .map(|slug| BatchEntry {
                        start_unit: start,
                        end_unit: end,
                        ..BatchEntry::new(slug.as_str())
                    })
                    .collect(),
            };
            if let [entry] = entries.as_slice() {
                let options = RunOptions {
                    force_restart: force,
                    start_unit: entry.start_unit,
                    end_unit: entry.end_unit,
                };
                let report = pipeline.run(&entry.slug, &options)?;
                print_report(&report);
                return Ok(report.is_done());
            }

            let batch = pipeline.run_batch(&entries, force)?;
            for report in &batch.reports {
                println!();
                print_report(report);
            }
            print_batch(&batch);
            Ok(batch.all_done())
        }
        Commands::Status { slug } => {
            let pipeline = Pipeline::new(config, NoSource, DirRemote::new("."));
            match slug {
                Some(slug) => print_state(&slug, &pipeline.progress().get(&slug)?),
                None => {
                    let all = pipeline.progress().all()?;
                    if all.is_empty() {
                        println!("no collections recorded");
                    }
                    for (slug, state) in &all {
                        print_state(slug, state);
                    }
                }
            }
            Ok(true)
        }
        Commands::Verify { slug } => {
            let pipeline = Pipeline::new(config, NoSource, DirRemote::new("."));
            let verification = pipeline.verify_only(&slug)?;
            for unit in verification.units.iter().filter(|u| !u.verdict.is_valid()) {
                if let Some(issue) = unit.verdict.issue() {
                    println!("unit {}: {}", unit.unit, issue);
                }
            }
            let failing = verification.failing().len();
            println!("{} units checked, {} failing", verification.units.len(), failing);
            Ok(failing == 0)
        }
        Commands::Sync { slug } => {
            let pipeline = Pipeline::new(config, NoSource, build_remote(&cli.global)?);
            let (report, check) = pipeline.sync_only(&slug)?;
            println!(
                "{} local items, {} missing, {} uploaded, {} failed, {} still missing",
                report.local_items, report.missing, report.uploaded, report.failed, check.residual_missing
            );
            Ok(check.residual_missing == 0)
        }
    }
}

fn main() {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run_cli(Cli::parse()) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %e, "panelsync failed");
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    }
}
