//! Job tracker: single owner of the batch registry and driver of the
//! per-batch state machine.
//!
//! Every transition is persisted before the next external call is made. The
//! only window where the registry can disagree with the remote side is
//! between a successful submission call and the following checkpoint; the
//! write-ahead marker on the record lets [`JobTracker::resume`] spot it.
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::core::cancel::CancelToken;
use crate::core::cost::CostLedger;
use crate::core::params::{RetryPolicy, RunParams};
use crate::core::registry::{BatchRegistry, StatusCounts};
use crate::error::{Error, Result};
use crate::io::openai::{ApiError, BatchApi, BatchSubmission};
use crate::io::rows::WorkItem;
use crate::io::store::RunStore;
use crate::types::{BatchStatus, RemoteState};

/// What a single `poll` found
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Remote job still queued or running; nothing changed
    InFlight(RemoteState),
    /// Payload downloaded and stored at `location` (relative to the run dir)
    Completed { location: PathBuf },
    /// The API ran the batch and reported failure
    ExecutionFailed { retry_count: u32, terminal: bool },
    /// The submission id is unknown to the API; the batch is failed and may be retried
    Lost,
}

/// Summary of a `drive` call
#[derive(Debug, Clone, PartialEq)]
pub struct DriveReport {
    pub counts: StatusCounts,
    /// Batches given up on for this session after repeated transient errors
    pub parked: Vec<u32>,
    pub cancelled: bool,
    pub estimated_cost: f64,
}

pub struct JobTracker<A: BatchApi> {
    api: A,
    store: RunStore,
    registry: BatchRegistry,
    items: Vec<WorkItem>,
    policy: RetryPolicy,
    costs: CostLedger,
    cancel: CancelToken,
    transient_errors: HashMap<u32, u32>,
    parked: BTreeSet<u32>,
}

impl<A: BatchApi> JobTracker<A> {
    /// Take ownership of `registry` and persist it as the run's starting point.
    pub fn new(
        api: A,
        store: RunStore,
        mut registry: BatchRegistry,
        items: Vec<WorkItem>,
        params: &RunParams,
    ) -> Result<Self> {
        check_items(&registry, &items)?;
        registry.save(&store.registry_path())?;
        let costs = CostLedger::load_or_new(&store.costs_path(), params.per_request_cost)?;
        Ok(Self {
            api,
            store,
            registry,
            items,
            policy: params.retry.clone(),
            costs,
            cancel: CancelToken::new(),
            transient_errors: HashMap::new(),
            parked: BTreeSet::new(),
        })
    }

    /// Reload the persisted registry for `store` and repair what an
    /// interrupted run left behind. With no registry on disk this is a fresh
    /// start over `items`.
    pub fn resume(
        api: A,
        store: RunStore,
        source: &Path,
        items: Vec<WorkItem>,
        params: &RunParams,
    ) -> Result<Self> {
        let registry = match BatchRegistry::load(&store.registry_path())? {
            Some(mut registry) => {
                if registry.total_items != items.len() {
                    return Err(Error::DatasetMismatch {
                        registry: registry.total_items,
                        rows: items.len(),
                    });
                }
                if registry.batch_size != params.batch_size {
                    warn!(
                        "Registry was split into batches of {}, ignoring batch size {}",
                        registry.batch_size, params.batch_size
                    );
                }
                let repaired = registry.repair();
                let counts = registry.counts();
                info!(
                    "Resuming run: {} completed, {} submitted, {} pending, {} failed, {} terminal ({} repaired)",
                    counts.completed,
                    counts.submitted,
                    counts.pending,
                    counts.failed,
                    counts.terminal_failed,
                    repaired.len()
                );
                registry
            }
            None => {
                info!("No prior run in {:?}, starting fresh", store.root());
                BatchRegistry::create(source, items.len(), params.batch_size, &params.model)?
            }
        };
        Self::new(api, store, registry, items, params)
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &BatchRegistry {
        &self.registry
    }

    pub fn costs(&self) -> &CostLedger {
        &self.costs
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.registry.save(&self.store.registry_path())
    }

    /// Submit one batch. Allowed from `pending`, or from `failed` while retry
    /// budget remains. On API error nothing but the write-ahead marker changes.
    ///
    /// Returns `None` when the API had no submittable row in the batch; the
    /// batch is then completed with an empty payload and its rows end up missing.
    pub fn submit(&mut self, seq: u32) -> Result<Option<String>> {
        let max_retries = self.policy.max_retries;
        let record = self.registry.get(seq)?;
        match record.status {
            BatchStatus::Pending => {}
            BatchStatus::Failed if record.retries_remaining(max_retries) => {}
            status => {
                return Err(Error::WrongState {
                    seq,
                    status,
                    operation: "submit",
                });
            }
        }
        let range = record.range;
        let attempt = record.attempts + 1;

        self.registry.get_mut(seq)?.submit_started_at = Some(Utc::now());
        self.checkpoint()?;

        info!(seq, attempt, "Submitting batch {} rows {}", seq, range);
        let submission = BatchSubmission {
            seq,
            attempt,
            items: &self.items[range.indices()],
        };
        let result = self.api.submit_batch(&submission);

        let record = self.registry.get_mut(seq)?;
        record.submit_started_at = None;
        match result {
            Ok(submission_id) => {
                record.transition(BatchStatus::Submitted)?;
                record.submission_id = Some(submission_id.clone());
                record.attempts = attempt;
                record.submitted_at = Some(Utc::now());
                record.completed_at = None;
                record.result_location = None;
                self.checkpoint()?;
                info!(seq, submission_id = %submission_id, "Batch submitted");
                Ok(Some(submission_id))
            }
            Err(ApiError::NothingToSubmit) => {
                let location = self.store.write_payload(seq, "")?;
                let record = self.registry.get_mut(seq)?;
                record.transition(BatchStatus::Submitted)?;
                record.transition(BatchStatus::Completed)?;
                record.submission_id = None;
                record.attempts = attempt;
                record.result_location = Some(location);
                record.completed_at = Some(Utc::now());
                record.error_detail = Some("no row could be submitted".to_string());
                self.checkpoint()?;
                warn!(seq, "No submittable rows, batch completed empty");
                Ok(None)
            }
            Err(source) => {
                self.checkpoint()?;
                warn!(seq, "Submission failed: {}", source);
                Err(Error::Submission { seq, source })
            }
        }
    }

    /// Query the remote status of a submitted batch and apply the outcome.
    pub fn poll(&mut self, seq: u32) -> Result<PollOutcome> {
        let record = self.registry.get(seq)?;
        if record.status != BatchStatus::Submitted {
            return Err(Error::WrongState {
                seq,
                status: record.status,
                operation: "poll",
            });
        }
        let range = record.range;
        let Some(submission_id) = record.submission_id.clone() else {
            self.mark_lost(seq, "submitted without a submission id")?;
            return Ok(PollOutcome::Lost);
        };

        let report = match self.api.poll_status(&submission_id) {
            Ok(report) => report,
            Err(ApiError::NotFound(_)) => {
                self.mark_lost(seq, "submission id not found by the API")?;
                return Ok(PollOutcome::Lost);
            }
            Err(source) => return Err(Error::Poll { seq, source }),
        };
        if let Some(counts) = report.counts {
            debug!(
                seq,
                total = counts.total,
                completed = counts.completed,
                failed = counts.failed,
                "Remote progress"
            );
        }

        match report.state {
            RemoteState::Pending | RemoteState::Running => {
                debug!(seq, state = %report.state, "Batch still in flight");
                Ok(PollOutcome::InFlight(report.state))
            }
            RemoteState::Succeeded => {
                let remote_location = report.result_location.unwrap_or_else(|| submission_id.clone());
                let payload = self
                    .api
                    .fetch_result(&remote_location)
                    .map_err(|source| Error::Poll { seq, source })?;
                let location = self.store.write_payload(seq, &payload)?;

                let cost = self.costs.record(seq, range.len(), Some(submission_id));
                self.costs.save(&self.store.costs_path())?;

                let record = self.registry.get_mut(seq)?;
                record.transition(BatchStatus::Completed)?;
                record.result_location = Some(location.clone());
                record.completed_at = Some(Utc::now());
                record.error_detail = None;
                self.checkpoint()?;
                info!(seq, "Batch completed (estimated cost ${:.4})", cost);
                Ok(PollOutcome::Completed { location })
            }
            RemoteState::Failed => {
                let max_retries = self.policy.max_retries;
                let record = self.registry.get_mut(seq)?;
                record.retry_count += 1;
                let terminal = !record.retries_remaining(max_retries);
                record.transition(if terminal {
                    BatchStatus::TerminalFailed
                } else {
                    BatchStatus::Failed
                })?;
                record.error_detail = Some(
                    report
                        .error
                        .unwrap_or_else(|| "remote execution failed".to_string()),
                );
                let retry_count = record.retry_count;
                if terminal {
                    error!(seq, retry_count, "Batch failed and exhausted its retries");
                } else {
                    warn!(seq, retry_count, "Batch execution failed, will retry");
                }
                self.checkpoint()?;
                Ok(PollOutcome::ExecutionFailed {
                    retry_count,
                    terminal,
                })
            }
        }
    }

    /// Put a failed batch back in the queue.
    pub fn requeue(&mut self, seq: u32) -> Result<()> {
        let max_retries = self.policy.max_retries;
        let record = self.registry.get_mut(seq)?;
        if record.status != BatchStatus::Failed || !record.retries_remaining(max_retries) {
            return Err(Error::WrongState {
                seq,
                status: record.status,
                operation: "requeue",
            });
        }
        record.transition(BatchStatus::Pending)?;
        self.checkpoint()
    }

    fn mark_lost(&mut self, seq: u32, reason: &str) -> Result<()> {
        let record = self.registry.get_mut(seq)?;
        warn!(seq, submission_id = ?record.submission_id, "{}; marking batch failed", reason);
        record.transition(BatchStatus::Failed)?;
        record.error_detail = Some(reason.to_string());
        self.checkpoint()
    }

    fn seqs_in(&self, status: BatchStatus) -> Vec<u32> {
        self.registry
            .batches
            .values()
            .filter(|b| b.status == status && !self.parked.contains(&b.seq))
            .map(|b| b.seq)
            .collect()
    }

    /// Submitted batches, parked ones included: those still run remotely.
    fn in_flight(&self) -> usize {
        self.registry
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Submitted)
            .count()
    }

    /// Count a transient error against `seq`; park the batch once the limit is hit.
    fn note_transient(&mut self, seq: u32, err: &Error) {
        let count = self.transient_errors.entry(seq).or_insert(0);
        *count += 1;
        warn!(seq, consecutive = *count, "Transient error: {}", err);
        if *count >= self.policy.max_transient_errors {
            error!(seq, "Too many consecutive errors, leaving batch for a later resume");
            self.parked.insert(seq);
        }
    }

    /// Parked submissions hold every in-flight slot, so no pending batch can
    /// go out this session.
    fn is_stalled(&self) -> bool {
        self.in_flight() >= self.policy.max_in_flight
            && self.seqs_in(BatchStatus::Submitted).is_empty()
    }

    fn is_done(&self) -> bool {
        self.registry
            .batches
            .values()
            .all(|b| b.status.is_terminal() || self.parked.contains(&b.seq))
    }

    /// Run submit/poll/retry passes until every batch is terminal or parked,
    /// or until cancelled. Waits `poll_interval` between passes.
    pub fn drive(&mut self) -> Result<DriveReport> {
        let mut cancelled = false;
        let mut pass = 0u64;
        while !self.is_done() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            pass += 1;
            debug!(pass, "Tracker pass");

            for seq in self.seqs_in(BatchStatus::Submitted) {
                match self.poll(seq) {
                    Ok(_) => {
                        self.transient_errors.remove(&seq);
                    }
                    Err(e) if e.is_transient() => self.note_transient(seq, &e),
                    Err(e) => return Err(e),
                }
            }

            for seq in self.seqs_in(BatchStatus::Failed) {
                let record = self.registry.get(seq)?;
                if !record.retries_remaining(self.policy.max_retries) {
                    let record = self.registry.get_mut(seq)?;
                    record.transition(BatchStatus::TerminalFailed)?;
                    self.checkpoint()?;
                    continue;
                }
                let wait = self.policy.retry_delay(record.retry_count);
                let elapsed = (Utc::now() - record.updated_at).to_std().unwrap_or_default();
                if elapsed >= wait {
                    info!(seq, retry_count = record.retry_count, "Requeueing failed batch");
                    self.requeue(seq)?;
                }
            }

            for seq in self.seqs_in(BatchStatus::Pending) {
                if self.in_flight() >= self.policy.max_in_flight {
                    break;
                }
                match self.submit(seq) {
                    Ok(_) => {
                        self.transient_errors.remove(&seq);
                    }
                    Err(e) if e.is_transient() => self.note_transient(seq, &e),
                    Err(e) => return Err(e),
                }
            }

            if self.is_done() {
                break;
            }
            if self.is_stalled() {
                warn!("Parked submissions hold the in-flight limit, leaving pending batches for a later resume");
                break;
            }
            if self.cancel.wait(self.policy.poll_interval()) {
                cancelled = true;
                break;
            }
        }

        let report = self.report(cancelled);
        info!(
            "Tracker stopped: {} completed, {} terminal, {} unfinished{}",
            report.counts.completed,
            report.counts.terminal_failed,
            report.counts.unfinished(),
            if cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    pub fn report(&self, cancelled: bool) -> DriveReport {
        DriveReport {
            counts: self.registry.counts(),
            parked: self.parked.iter().copied().collect(),
            cancelled,
            estimated_cost: self.costs.total(),
        }
    }

    pub fn into_registry(self) -> BatchRegistry {
        self.registry
    }
}

fn check_items(registry: &BatchRegistry, items: &[WorkItem]) -> Result<()> {
    if registry.total_items != items.len() {
        return Err(Error::DatasetMismatch {
            registry: registry.total_items,
            rows: items.len(),
        });
    }
    if let Some((pos, item)) = items.iter().enumerate().find(|(pos, item)| item.index != *pos) {
        return Err(Error::InvalidArgument {
            arg: "work item index",
            value: format!("item at position {pos} has index {}", item.index),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::openai::StatusReport;

    struct FixedApi {
        fail_submit: bool,
        state: RemoteState,
    }

    impl BatchApi for FixedApi {
        fn submit_batch(&self, submission: &BatchSubmission<'_>) -> std::result::Result<String, ApiError> {
            if self.fail_submit {
                return Err(ApiError::Http {
                    status: 500,
                    body: "oops".to_string(),
                });
            }
            Ok(format!("sub-{}-{}", submission.seq, submission.attempt))
        }

        fn poll_status(&self, _submission_id: &str) -> std::result::Result<StatusReport, ApiError> {
            Ok(StatusReport {
                error: Some("boom".to_string()),
                ..StatusReport::new(self.state)
            })
        }

        fn fetch_result(&self, _location: &str) -> std::result::Result<String, ApiError> {
            Ok(String::new())
        }
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|index| WorkItem {
                index,
                image_path: format!("{index}.jpg"),
                prompt: "describe".to_string(),
            })
            .collect()
    }

    fn tracker(dir: &Path, api: FixedApi, max_retries: u32) -> JobTracker<FixedApi> {
        let mut params = RunParams {
            batch_size: 10,
            ..RunParams::default()
        };
        params.retry = RetryPolicy {
            max_retries,
            ..RetryPolicy::immediate()
        };
        let store = RunStore::open(dir).unwrap();
        let registry = BatchRegistry::create(Path::new("rows.csv"), 20, 10, "m").unwrap();
        JobTracker::new(api, store, registry, items(20), &params).unwrap()
    }

    #[test]
    fn submission_error_only_touches_the_marker() {
        let dir = tempfile::tempdir().unwrap();
        let api = FixedApi {
            fail_submit: true,
            state: RemoteState::Running,
        };
        let mut t = tracker(dir.path(), api, 3);
        let err = t.submit(1).unwrap_err();
        assert!(matches!(err, Error::Submission { seq: 1, .. }));
        assert!(err.is_transient());

        let persisted = BatchRegistry::load(&t.store().registry_path()).unwrap().unwrap();
        let record = persisted.get(1).unwrap();
        assert_eq!(record.status, BatchStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.attempts, 0);
        assert!(record.submit_started_at.is_none());
    }

    #[test]
    fn execution_failures_spend_budget_then_go_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let api = FixedApi {
            fail_submit: false,
            state: RemoteState::Failed,
        };
        let mut t = tracker(dir.path(), api, 1);

        assert_eq!(t.submit(1).unwrap().as_deref(), Some("sub-1-1"));
        assert_eq!(
            t.poll(1).unwrap(),
            PollOutcome::ExecutionFailed {
                retry_count: 1,
                terminal: false
            }
        );
        t.requeue(1).unwrap();
        assert_eq!(t.submit(1).unwrap().as_deref(), Some("sub-1-2"));
        assert_eq!(
            t.poll(1).unwrap(),
            PollOutcome::ExecutionFailed {
                retry_count: 2,
                terminal: true
            }
        );

        let record = t.registry().get(1).unwrap();
        assert_eq!(record.status, BatchStatus::TerminalFailed);
        assert_eq!(record.error_detail.as_deref(), Some("boom"));
        assert!(matches!(t.submit(1), Err(Error::WrongState { .. })));
        assert!(matches!(t.requeue(1), Err(Error::WrongState { .. })));
    }

    #[test]
    fn poll_requires_a_submitted_batch() {
        let dir = tempfile::tempdir().unwrap();
        let api = FixedApi {
            fail_submit: false,
            state: RemoteState::Running,
        };
        let mut t = tracker(dir.path(), api, 3);
        assert!(matches!(
            t.poll(2),
            Err(Error::WrongState {
                seq: 2,
                status: BatchStatus::Pending,
                operation: "poll"
            })
        ));
        t.submit(2).unwrap();
        assert_eq!(t.poll(2).unwrap(), PollOutcome::InFlight(RemoteState::Running));
        assert_eq!(t.registry().get(2).unwrap().status, BatchStatus::Submitted);
    }

    #[test]
    fn success_stores_payload_and_records_cost() {
        let dir = tempfile::tempdir().unwrap();
        let api = FixedApi {
            fail_submit: false,
            state: RemoteState::Succeeded,
        };
        let mut t = tracker(dir.path(), api, 3);
        t.submit(2).unwrap();
        let outcome = t.poll(2).unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Completed {
                location: PathBuf::from("results/batch_002.jsonl")
            }
        );
        assert!(dir.path().join("results/batch_002.jsonl").exists());
        assert!((t.costs().total() - 10.0 * 0.00015).abs() < 1e-12);
        assert_eq!(t.registry().get(2).unwrap().status, BatchStatus::Completed);
    }

    /// Accepts submissions, then never answers a poll
    struct UnreachableStatusApi;

    impl BatchApi for UnreachableStatusApi {
        fn submit_batch(&self, submission: &BatchSubmission<'_>) -> std::result::Result<String, ApiError> {
            Ok(format!("sub-{}", submission.seq))
        }

        fn poll_status(&self, _submission_id: &str) -> std::result::Result<StatusReport, ApiError> {
            Err(ApiError::Transport("timed out".to_string()))
        }

        fn fetch_result(&self, location: &str) -> std::result::Result<String, ApiError> {
            Err(ApiError::NotFound(location.to_string()))
        }
    }

    #[test]
    fn parked_submission_still_counts_against_in_flight_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let registry = BatchRegistry::create(Path::new("rows.csv"), 20, 10, "m").unwrap();
        let params = RunParams {
            batch_size: 10,
            retry: RetryPolicy {
                max_transient_errors: 2,
                max_in_flight: 1,
                ..RetryPolicy::immediate()
            },
            ..RunParams::default()
        };
        let mut t = JobTracker::new(UnreachableStatusApi, store, registry, items(20), &params).unwrap();

        let report = t.drive().unwrap();
        assert_eq!(report.parked, vec![1]);
        assert!(!report.cancelled);
        assert_eq!(t.registry().get(1).unwrap().status, BatchStatus::Submitted);
        // batch 2 never went out while batch 1 may still be running remotely
        assert_eq!(t.registry().get(2).unwrap().status, BatchStatus::Pending);
        assert_eq!(t.registry().get(2).unwrap().attempts, 0);
        assert_eq!(report.counts.unfinished(), 2);
    }

    struct NothingToSubmitApi;

    impl BatchApi for NothingToSubmitApi {
        fn submit_batch(&self, _submission: &BatchSubmission<'_>) -> std::result::Result<String, ApiError> {
            Err(ApiError::NothingToSubmit)
        }

        fn poll_status(&self, submission_id: &str) -> std::result::Result<StatusReport, ApiError> {
            Err(ApiError::NotFound(submission_id.to_string()))
        }

        fn fetch_result(&self, location: &str) -> std::result::Result<String, ApiError> {
            Err(ApiError::NotFound(location.to_string()))
        }
    }

    #[test]
    fn batch_without_submittable_rows_completes_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let registry = BatchRegistry::create(Path::new("rows.csv"), 20, 10, "m").unwrap();
        let params = RunParams {
            batch_size: 10,
            retry: RetryPolicy::immediate(),
            ..RunParams::default()
        };
        let mut t = JobTracker::new(NothingToSubmitApi, store, registry, items(20), &params).unwrap();

        assert_eq!(t.submit(1).unwrap(), None);
        let record = t.registry().get(1).unwrap();
        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.retry_count, 0);
        assert!(record.submission_id.is_none());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("results/batch_001.jsonl")).unwrap(),
            ""
        );

        let report = t.drive().unwrap();
        assert_eq!(report.counts.completed, 2);
        assert_eq!(report.counts.unfinished(), 0);
        assert!(report.parked.is_empty());
    }

    #[test]
    fn item_count_must_match_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let registry = BatchRegistry::create(Path::new("rows.csv"), 20, 10, "m").unwrap();
        let api = FixedApi {
            fail_submit: false,
            state: RemoteState::Running,
        };
        let err = JobTracker::new(api, store, registry, items(19), &RunParams::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::DatasetMismatch {
                registry: 20,
                rows: 19
            }
        ));
    }
}
