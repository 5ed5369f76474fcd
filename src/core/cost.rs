//! Approximate spend per completed batch.
use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::io::store::{load_json, save_json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub requests: usize,
    pub estimated_cost: f64,
    pub submission_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLedger {
    pub per_request_cost: f64,
    pub batches: BTreeMap<u32, CostEntry>,
}

impl CostLedger {
    pub fn new(per_request_cost: f64) -> Self {
        Self {
            per_request_cost,
            batches: BTreeMap::new(),
        }
    }

    pub fn load_or_new(path: &Path, per_request_cost: f64) -> Result<Self> {
        Ok(load_json(path)?.unwrap_or_else(|| Self::new(per_request_cost)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(path, self)
    }

    pub fn estimate(&self, requests: usize) -> f64 {
        requests as f64 * self.per_request_cost
    }

    /// Record a completed batch. Recording the same seq again replaces its entry.
    pub fn record(&mut self, seq: u32, requests: usize, submission_id: Option<String>) -> f64 {
        let estimated_cost = self.estimate(requests);
        self.batches.insert(
            seq,
            CostEntry {
                requests,
                estimated_cost,
                submission_id,
                recorded_at: Utc::now(),
            },
        );
        estimated_cost
    }

    pub fn total(&self) -> f64 {
        self.batches.values().map(|e| e.estimated_cost).sum()
    }

    pub fn total_requests(&self) -> usize {
        self.batches.values().map(|e| e.requests).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_entries() {
        let mut ledger = CostLedger::new(0.001);
        ledger.record(1, 20, None);
        ledger.record(2, 10, Some("batch_x".to_string()));
        assert_eq!(ledger.total_requests(), 30);
        assert!((ledger.total() - 0.03).abs() < 1e-12);
    }

    #[test]
    fn recording_twice_is_idempotent() {
        let mut ledger = CostLedger::new(0.5);
        ledger.record(3, 4, None);
        ledger.record(3, 4, None);
        assert_eq!(ledger.batches.len(), 1);
        assert!((ledger.total() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn ledger_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("costs.json");
        let mut ledger = CostLedger::load_or_new(&path, 0.25).unwrap();
        ledger.record(1, 8, None);
        ledger.save(&path).unwrap();
        let loaded = CostLedger::load_or_new(&path, 99.0).unwrap();
        assert_eq!(loaded, ledger);
    }
}
