//! High-level library API: start a run over a CSV, resume an interrupted run,
//! merge results, queue reruns for missing rows and inspect a run directory.
//! Prefer these entrypoints over driving `core::tracker` directly.
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::core::cancel::CancelToken;
use crate::core::cost::CostLedger;
use crate::core::merge::{MergeOutcome, merge};
use crate::core::params::RunParams;
use crate::core::partition::{contiguous_runs, partition_span};
use crate::core::registry::{BatchRecord, BatchRegistry, StatusCounts};
use crate::core::tracker::{DriveReport, JobTracker};
use crate::error::{Error, Result};
use crate::io::openai::{BatchApi, OpenAiBatchClient, RequestOptions};
use crate::io::rows::{WorkItem, read_rows};
use crate::io::store::RunStore;
use crate::io::table::{write_annotated, write_merged, write_missing};

/// End-of-run summary: batch counts, the missing list and the cost estimate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub completed: usize,
    pub terminal_failed: usize,
    /// Batches still pending, submitted or failed with budget left
    pub unfinished: usize,
    pub merged_rows: usize,
    pub missing: Vec<usize>,
    pub warnings: usize,
    pub estimated_cost: f64,
    pub parked: Vec<u32>,
    pub cancelled: bool,
}

impl RunReport {
    fn new(counts: &StatusCounts, outcome: &MergeOutcome, estimated_cost: f64) -> Self {
        Self {
            completed: counts.completed,
            terminal_failed: counts.terminal_failed,
            unfinished: counts.unfinished(),
            merged_rows: outcome.table.len(),
            missing: outcome.missing.clone(),
            warnings: outcome.warnings.len(),
            estimated_cost,
            parked: Vec::new(),
            cancelled: false,
        }
    }

    fn with_drive(mut self, drive: &DriveReport) -> Self {
        self.parked = drive.parked.clone();
        self.cancelled = drive.cancelled;
        self
    }
}

/// Snapshot of a run directory for status displays
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub source: PathBuf,
    pub total_items: usize,
    pub batch_size: usize,
    pub model: String,
    pub counts: StatusCounts,
    pub batches: Vec<BatchRecord>,
    pub estimated_cost: f64,
    pub billed_requests: usize,
}

/// OpenAI client configured from the environment and `params`
pub fn client_from_env(params: &RunParams) -> Result<OpenAiBatchClient> {
    OpenAiBatchClient::from_env(RequestOptions::from_params(params))
}

fn load_registry(store: &RunStore) -> Result<BatchRegistry> {
    BatchRegistry::load(&store.registry_path())?.ok_or_else(|| Error::MissingArgument {
        arg: format!("registry in {}", store.root().display()),
    })
}

fn load_rows(registry: &BatchRegistry, params: &RunParams) -> Result<Vec<WorkItem>> {
    let items = read_rows(&registry.source, &params.columns)?;
    if items.len() != registry.total_items {
        return Err(Error::DatasetMismatch {
            registry: registry.total_items,
            rows: items.len(),
        });
    }
    Ok(items)
}

/// Merge and write `merged.csv`, `missing.txt` and `annotated.csv`.
fn write_outputs(
    store: &RunStore,
    registry: &BatchRegistry,
    items: &[WorkItem],
) -> Result<MergeOutcome> {
    let outcome = merge(registry, items, store)?;
    write_merged(&store.merged_path(), &outcome.table)?;
    write_missing(&store.missing_path(), &outcome.missing)?;
    write_annotated(&registry.source, &store.annotated_path(), &outcome.table)?;
    Ok(outcome)
}

fn drive_and_merge<A: BatchApi>(mut tracker: JobTracker<A>) -> Result<RunReport> {
    let drive = tracker.drive()?;
    let outcome = write_outputs(tracker.store(), tracker.registry(), tracker.items())?;
    let report = RunReport::new(&drive.counts, &outcome, drive.estimated_cost).with_drive(&drive);
    log_report(&report);
    Ok(report)
}

fn log_report(report: &RunReport) {
    info!(
        "Run finished: {} completed, {} terminal_failed, {} unfinished, {} missing rows, estimated cost ${:.4}",
        report.completed,
        report.terminal_failed,
        report.unfinished,
        report.missing.len(),
        report.estimated_cost
    );
    if !report.parked.is_empty() {
        warn!("Batches left for a later resume: {:?}", report.parked);
    }
}

/// Start a fresh run over `source`, persisting state under `run_dir`, and
/// drive it until every batch is terminal (or `cancel` fires). Refuses a
/// directory that already holds a registry.
pub fn start_run<A: BatchApi>(
    source: &Path,
    run_dir: &Path,
    params: &RunParams,
    api: A,
    cancel: CancelToken,
) -> Result<RunReport> {
    params.validate()?;
    let store = RunStore::open(run_dir)?;
    if store.registry_path().exists() {
        return Err(Error::InvalidArgument {
            arg: "run_dir",
            value: format!("{} already holds a run; resume it instead", run_dir.display()),
        });
    }
    let items = read_rows(source, &params.columns)?;
    // later resumes may run from another working directory
    let source = std::fs::canonicalize(source)?;
    let registry = BatchRegistry::create(&source, items.len(), params.batch_size, &params.model)?;
    info!(
        "Starting run: {} rows in {} batches of up to {}",
        items.len(),
        registry.batches.len(),
        params.batch_size
    );
    let tracker = JobTracker::new(api, store, registry, items, params)?.with_cancel(cancel);
    drive_and_merge(tracker)
}

/// Resume the run persisted in `run_dir`: repair interrupted submissions,
/// poll what is in flight, retry what failed and submit what is pending.
pub fn resume_run<A: BatchApi>(
    run_dir: &Path,
    params: &RunParams,
    api: A,
    cancel: CancelToken,
) -> Result<RunReport> {
    params.validate()?;
    let store = RunStore::open(run_dir)?;
    let registry = load_registry(&store)?;
    let items = load_rows(&registry, params)?;
    let source = registry.source.clone();
    let tracker = JobTracker::resume(api, store, &source, items, params)?.with_cancel(cancel);
    drive_and_merge(tracker)
}

/// Recompute the merge from stored payloads and rewrite the output files.
/// Makes no API calls.
pub fn merge_run(run_dir: &Path, params: &RunParams) -> Result<RunReport> {
    let store = RunStore::open(run_dir)?;
    let registry = load_registry(&store)?;
    let items = load_rows(&registry, params)?;
    let outcome = write_outputs(&store, &registry, &items)?;
    let costs = CostLedger::load_or_new(&store.costs_path(), params.per_request_cost)?;
    let report = RunReport::new(&registry.counts(), &outcome, costs.total());
    log_report(&report);
    Ok(report)
}

/// Append `rerun` batches covering the rows the last merge could not fill.
/// Rows still owned by an unfinished batch are left alone. Returns the new
/// sequence numbers; a later [`resume_run`] submits them.
pub fn rerun_missing(run_dir: &Path, params: &RunParams) -> Result<Vec<u32>> {
    let store = RunStore::open(run_dir)?;
    let mut registry = load_registry(&store)?;
    let items = load_rows(&registry, params)?;
    let outcome = merge(&registry, &items, &store)?;

    let settled: Vec<usize> = outcome
        .missing
        .iter()
        .copied()
        .filter(|&index| {
            registry
                .batches
                .values()
                .filter(|b| b.range.contains(index))
                .all(|b| b.status.is_terminal())
        })
        .collect();
    if settled.len() < outcome.missing.len() {
        info!(
            "{} missing rows belong to unfinished batches and are not rerun",
            outcome.missing.len() - settled.len()
        );
    }
    if settled.is_empty() {
        info!("Nothing to rerun");
        return Ok(Vec::new());
    }

    let mut ranges = Vec::new();
    for run in contiguous_runs(&settled) {
        ranges.extend(partition_span(run.start, run.end, registry.batch_size)?);
    }
    let seqs = registry.append_reruns(&ranges)?;
    registry.save(&store.registry_path())?;
    info!(
        "Queued {} missing rows in {} rerun batches {:?}",
        settled.len(),
        seqs.len(),
        seqs
    );
    Ok(seqs)
}

/// Read-only view of a run directory.
pub fn run_status(run_dir: &Path) -> Result<RunStatus> {
    if !run_dir.is_dir() {
        return Err(Error::MissingArgument {
            arg: format!("run directory {}", run_dir.display()),
        });
    }
    let store = RunStore::open(run_dir)?;
    let registry = load_registry(&store)?;
    let costs = CostLedger::load_or_new(&store.costs_path(), RunParams::default().per_request_cost)?;
    Ok(RunStatus {
        counts: registry.counts(),
        source: registry.source.clone(),
        total_items: registry.total_items,
        batch_size: registry.batch_size,
        model: registry.model.clone(),
        batches: registry.batches.into_values().collect(),
        estimated_cost: costs.total(),
        billed_requests: costs.total_requests(),
    })
}
