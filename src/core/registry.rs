//! Persisted record of every batch in a run, keyed by sequence number.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::partition::{BatchRange, check_tiling, partition};
use crate::error::{Error, Result};
use crate::io::store::{load_json, save_json};
use crate::types::{BatchOrigin, BatchStatus};

pub const REGISTRY_VERSION: u32 = 1;

/// Lifecycle record of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub seq: u32,
    pub range: BatchRange,
    #[serde(default)]
    pub origin: BatchOrigin,
    pub status: BatchStatus,
    pub submission_id: Option<String>,
    /// Execution failures counted against the retry budget
    pub retry_count: u32,
    /// Submissions accepted by the API
    #[serde(default)]
    pub attempts: u32,
    pub error_detail: Option<String>,
    /// Payload path relative to the run directory
    pub result_location: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Set right before the submission call, cleared once its outcome is recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_started_at: Option<DateTime<Utc>>,
}

impl BatchRecord {
    pub fn new(seq: u32, range: BatchRange, origin: BatchOrigin) -> Self {
        let now = Utc::now();
        Self {
            seq,
            range,
            origin,
            status: BatchStatus::Pending,
            submission_id: None,
            retry_count: 0,
            attempts: 0,
            error_detail: None,
            result_location: None,
            created_at: now,
            submitted_at: None,
            completed_at: None,
            updated_at: now,
            submit_started_at: None,
        }
    }

    pub fn name(&self) -> String {
        format!("batch_{:03}", self.seq)
    }

    /// Move to `to`, rejecting edges the state machine does not allow.
    pub fn transition(&mut self, to: BatchStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                seq: self.seq,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn retries_remaining(&self, max_retries: u32) -> bool {
        self.retry_count <= max_retries
    }
}

/// Summary counts over a registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub terminal_failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.submitted + self.completed + self.failed + self.terminal_failed
    }

    /// Batches that are neither completed nor terminally failed
    pub fn unfinished(&self) -> usize {
        self.pending + self.submitted + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRegistry {
    pub version: u32,
    pub source: PathBuf,
    pub total_items: usize,
    pub batch_size: usize,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub batches: BTreeMap<u32, BatchRecord>,
}

impl BatchRegistry {
    /// Fresh registry whose initial batches tile `[0, total_items)`.
    pub fn create(source: &Path, total_items: usize, batch_size: usize, model: &str) -> Result<Self> {
        let now = Utc::now();
        let batches = partition(total_items, batch_size)?
            .into_iter()
            .zip(1u32..)
            .map(|(range, seq)| (seq, BatchRecord::new(seq, range, BatchOrigin::Initial)))
            .collect();
        let registry = Self {
            version: REGISTRY_VERSION,
            source: source.to_path_buf(),
            total_items,
            batch_size,
            model: model.to_string(),
            created_at: now,
            updated_at: now,
            batches,
        };
        info!(
            "Created registry: {} items in {} batches of up to {}",
            total_items,
            registry.batches.len(),
            batch_size
        );
        Ok(registry)
    }

    /// Load from `path`; `Ok(None)` when no prior run exists.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let registry: Option<Self> = load_json(path).map_err(|e| match e {
            Error::Json(e) => Error::RegistryCorrupt(format!("{}: {e}", path.display())),
            other => other,
        })?;
        if let Some(registry) = &registry {
            registry.validate()?;
        }
        Ok(registry)
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Utc::now();
        save_json(path, self)
    }

    /// Check structural invariants: keys match records, initial batches tile
    /// the index space, reruns stay inside it.
    pub fn validate(&self) -> Result<()> {
        if self.version != REGISTRY_VERSION {
            return Err(Error::RegistryCorrupt(format!(
                "unsupported registry version {}",
                self.version
            )));
        }
        for (seq, record) in &self.batches {
            if *seq != record.seq {
                return Err(Error::RegistryCorrupt(format!(
                    "batch key {seq} holds record for {}",
                    record.seq
                )));
            }
            if record.range.is_empty() || record.range.end > self.total_items {
                return Err(Error::RegistryCorrupt(format!(
                    "batch {seq} range {} outside [0, {})",
                    record.range, self.total_items
                )));
            }
        }
        let initial: Vec<BatchRange> = self
            .batches
            .values()
            .filter(|b| b.origin == BatchOrigin::Initial)
            .map(|b| b.range)
            .collect();
        check_tiling(&initial, self.total_items).map_err(Error::RegistryCorrupt)
    }

    /// Fix records left inconsistent by an interrupted run. Returns the
    /// sequence numbers that were repaired; none of them consume retry budget.
    pub fn repair(&mut self) -> Vec<u32> {
        let mut repaired = Vec::new();
        for record in self.batches.values_mut() {
            let reason = match record.status {
                BatchStatus::Submitted if record.submission_id.is_none() => {
                    Some("submitted without a submission id")
                }
                BatchStatus::Pending | BatchStatus::Failed
                    if record.submit_started_at.is_some() =>
                {
                    Some("interrupted during submission")
                }
                _ => None,
            };
            let Some(reason) = reason else { continue };
            warn!(seq = record.seq, "Repairing {}: {}", record.name(), reason);
            record.submit_started_at = None;
            record.status = BatchStatus::Failed;
            record.error_detail = Some(reason.to_string());
            record.updated_at = Utc::now();
            repaired.push(record.seq);
        }
        repaired
    }

    pub fn get(&self, seq: u32) -> Result<&BatchRecord> {
        self.batches.get(&seq).ok_or(Error::UnknownBatch(seq))
    }

    pub fn get_mut(&mut self, seq: u32) -> Result<&mut BatchRecord> {
        self.batches.get_mut(&seq).ok_or(Error::UnknownBatch(seq))
    }

    pub fn seqs(&self) -> Vec<u32> {
        self.batches.keys().copied().collect()
    }

    pub fn next_seq(&self) -> u32 {
        self.batches.keys().next_back().map_or(1, |last| last + 1)
    }

    /// Append pending rerun batches covering `ranges`; returns their sequence numbers.
    pub fn append_reruns(&mut self, ranges: &[BatchRange]) -> Result<Vec<u32>> {
        let mut added = Vec::with_capacity(ranges.len());
        for range in ranges {
            if range.is_empty() || range.end > self.total_items {
                return Err(Error::InvalidArgument {
                    arg: "rerun range",
                    value: range.to_string(),
                });
            }
            let seq = self.next_seq();
            self.batches
                .insert(seq, BatchRecord::new(seq, *range, BatchOrigin::Rerun));
            added.push(seq);
        }
        Ok(added)
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.batches.values() {
            match record.status {
                BatchStatus::Pending => counts.pending += 1,
                BatchStatus::Submitted => counts.submitted += 1,
                BatchStatus::Completed => counts.completed += 1,
                BatchStatus::Failed => counts.failed += 1,
                BatchStatus::TerminalFailed => counts.terminal_failed += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(total: usize, size: usize) -> BatchRegistry {
        BatchRegistry::create(Path::new("rows.csv"), total, size, "gpt-4o-mini").unwrap()
    }

    #[test]
    fn create_numbers_batches_from_one() {
        let reg = registry(100, 20);
        assert_eq!(reg.seqs(), vec![1, 2, 3, 4, 5]);
        assert_eq!(reg.get(3).unwrap().range, BatchRange::new(40, 60));
        assert!(reg.batches.values().all(|b| b.status == BatchStatus::Pending));
    }

    #[test]
    fn save_and_load_preserve_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let mut reg = registry(30, 10);
        reg.get_mut(2).unwrap().transition(BatchStatus::Submitted).unwrap();
        reg.get_mut(2).unwrap().submission_id = Some("batch_abc".to_string());
        reg.save(&path).unwrap();

        let loaded = BatchRegistry::load(&path).unwrap().unwrap();
        assert_eq!(loaded.batches, reg.batches);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"status\": \"submitted\""));
    }

    #[test]
    fn load_rejects_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let mut reg = registry(30, 10);
        reg.batches.remove(&2);
        reg.save(&path).unwrap();
        assert!(matches!(
            BatchRegistry::load(&path),
            Err(Error::RegistryCorrupt(msg)) if msg.contains("gap")
        ));
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(BatchRegistry::load(&path), Err(Error::RegistryCorrupt(_))));
    }

    #[test]
    fn terminal_failed_rejects_every_transition() {
        let mut record = BatchRecord::new(1, BatchRange::new(0, 5), BatchOrigin::Initial);
        record.status = BatchStatus::TerminalFailed;
        for to in [
            BatchStatus::Pending,
            BatchStatus::Submitted,
            BatchStatus::Completed,
            BatchStatus::Failed,
        ] {
            assert!(record.transition(to).is_err());
        }
        assert_eq!(record.status, BatchStatus::TerminalFailed);
    }

    #[test]
    fn repair_marks_interrupted_batches_failed() {
        let mut reg = registry(30, 10);
        reg.get_mut(1).unwrap().submit_started_at = Some(Utc::now());
        reg.get_mut(2).unwrap().status = BatchStatus::Submitted;
        let repaired = reg.repair();
        assert_eq!(repaired, vec![1, 2]);
        assert_eq!(reg.get(1).unwrap().status, BatchStatus::Failed);
        assert_eq!(reg.get(2).unwrap().status, BatchStatus::Failed);
        assert_eq!(reg.get(1).unwrap().retry_count, 0);
        assert!(reg.get(1).unwrap().submit_started_at.is_none());
        assert_eq!(reg.get(3).unwrap().status, BatchStatus::Pending);
    }

    #[test]
    fn reruns_get_higher_sequence_numbers() {
        let mut reg = registry(30, 10);
        let added = reg.append_reruns(&[BatchRange::new(5, 8)]).unwrap();
        assert_eq!(added, vec![4]);
        assert_eq!(reg.get(4).unwrap().origin, BatchOrigin::Rerun);
        assert!(reg.validate().is_ok());
        assert!(reg.append_reruns(&[BatchRange::new(25, 31)]).is_err());
    }
}
