//! Run parameters: item columns, retry and pacing policy, request knobs.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Column names that locate a work item inside the source CSV
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemColumns {
    pub image: String,
    pub prompt: String,
}

impl Default for ItemColumns {
    fn default() -> Self {
        Self {
            image: "Image Path".to_string(),
            prompt: "Content of P*".to_string(),
        }
    }
}

/// Retry and pacing policy for the job tracker, expressed as data.
/// All delays are in whole seconds so config files stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Execution failures tolerated per batch before it becomes terminal
    pub max_retries: u32,
    /// Wait between polling passes
    pub poll_interval_secs: u64,
    /// Base wait before resubmitting a failed batch
    pub retry_delay_secs: u64,
    pub backoff_factor: f64,
    pub max_retry_delay_secs: u64,
    /// Consecutive transient submit/poll errors before a batch is parked for the run
    pub max_transient_errors: u32,
    /// Upper bound on batches simultaneously in the `submitted` state
    pub max_in_flight: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            poll_interval_secs: 60,
            retry_delay_secs: 120,
            backoff_factor: 2.0,
            max_retry_delay_secs: 1800,
            max_transient_errors: 5,
            max_in_flight: 1,
        }
    }
}

impl RetryPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Delay before resubmitting a batch that has failed `retry_count` times.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 || self.retry_delay_secs == 0 {
            return Duration::ZERO;
        }
        let factor = self.backoff_factor.max(1.0).powi(retry_count as i32 - 1);
        let secs = (self.retry_delay_secs as f64 * factor).min(self.max_retry_delay_secs as f64);
        Duration::from_secs_f64(secs)
    }

    /// Policy with every wait set to zero, for tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            poll_interval_secs: 0,
            retry_delay_secs: 0,
            max_retry_delay_secs: 0,
            ..Self::default()
        }
    }
}

/// Run parameters suitable for config files; CLI flags override individual fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParams {
    pub batch_size: usize,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub columns: ItemColumns,
    pub retry: RetryPolicy,
    /// Estimated USD per request, used by the cost ledger
    pub per_request_cost: f64,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            batch_size: 50,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1000,
            temperature: 0.7,
            columns: ItemColumns::default(),
            retry: RetryPolicy::default(),
            per_request_cost: 0.00015,
        }
    }
}

impl RunParams {
    /// Load parameters from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let params: RunParams = serde_json::from_str(&text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::ZeroSize { size: 0 });
        }
        if self.retry.max_in_flight == 0 {
            return Err(Error::InvalidArgument {
                arg: "max_in_flight",
                value: "0".to_string(),
            });
        }
        if !(self.per_request_cost >= 0.0) {
            return Err(Error::InvalidArgument {
                arg: "per_request_cost",
                value: self.per_request_cost.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let params: RunParams =
            serde_json::from_str(r#"{"batch_size": 20, "retry": {"max_retries": 5}}"#).unwrap();
        assert_eq!(params.batch_size, 20);
        assert_eq!(params.retry.max_retries, 5);
        assert_eq!(params.retry.poll_interval_secs, 60);
        assert_eq!(params.model, "gpt-4o-mini");
        assert_eq!(params.columns, ItemColumns::default());
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            retry_delay_secs: 10,
            backoff_factor: 2.0,
            max_retry_delay_secs: 35,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.retry_delay(0), Duration::ZERO);
        assert_eq!(policy.retry_delay(1), Duration::from_secs(10));
        assert_eq!(policy.retry_delay(2), Duration::from_secs(20));
        assert_eq!(policy.retry_delay(3), Duration::from_secs(35));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let params = RunParams {
            batch_size: 0,
            ..RunParams::default()
        };
        assert!(matches!(params.validate(), Err(Error::ZeroSize { .. })));
    }
}
