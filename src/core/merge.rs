//! Result merger: reconcile completed batch payloads against the work item
//! index space.
//!
//! The merge is a pure recomputation over the registry and the stored
//! payloads. Row-level problems become warnings and missing indices; only a
//! dataset mismatch aborts.
use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::partition::BatchRange;
use crate::core::registry::{BatchRecord, BatchRegistry};
use crate::error::{Error, Result};
use crate::io::rows::WorkItem;
use crate::io::store::RunStore;
use crate::types::BatchStatus;

/// One response that survived parsing
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub index: usize,
    pub batch_seq: u32,
    pub content: String,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRow {
    pub original_index: usize,
    pub content: String,
    pub batch_seq: u32,
}

/// Merged output rows in ascending original index order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedTable {
    pub rows: Vec<MergedRow>,
}

impl MergedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MergedRow> {
        self.rows
            .binary_search_by_key(&index, |r| r.original_index)
            .ok()
            .map(|pos| &self.rows[pos])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeWarning {
    /// A single response line could not be used
    PayloadParse {
        batch_seq: u32,
        line: usize,
        index: Option<usize>,
        reason: String,
    },
    /// A completed batch's payload could not be read at all
    PayloadUnavailable { batch_seq: u32, reason: String },
    /// The same index appeared twice inside one payload; the later line won
    DuplicateInBatch { batch_seq: u32, index: usize },
}

impl std::fmt::Display for MergeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeWarning::PayloadParse {
                batch_seq,
                line,
                index: Some(index),
                reason,
            } => write!(f, "batch {batch_seq} line {line} (row {index}): {reason}"),
            MergeWarning::PayloadParse {
                batch_seq,
                line,
                index: None,
                reason,
            } => write!(f, "batch {batch_seq} line {line}: {reason}"),
            MergeWarning::PayloadUnavailable { batch_seq, reason } => {
                write!(f, "batch {batch_seq} payload unavailable: {reason}")
            }
            MergeWarning::DuplicateInBatch { batch_seq, index } => {
                write!(f, "batch {batch_seq} returned row {index} more than once")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub table: MergedTable,
    pub missing: Vec<usize>,
    pub warnings: Vec<MergeWarning>,
    /// Records dropped because a higher-sequence batch covered the same row
    pub superseded: usize,
}

/// Row index encoded in a request's `custom_id`: `row_<index>` (0-based) or
/// the older `request-<n>` (1-based).
pub fn parse_custom_id(custom_id: &str) -> Option<usize> {
    if let Some(rest) = custom_id.strip_prefix("row_") {
        return rest.parse().ok();
    }
    if let Some(rest) = custom_id.strip_prefix("request-") {
        return rest.parse::<usize>().ok()?.checked_sub(1);
    }
    None
}

fn line_content(value: &Value) -> std::result::Result<String, String> {
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(format!("request error: {message}"));
    }
    let response = value
        .get("response")
        .filter(|r| !r.is_null())
        .ok_or("no response object")?;
    if let Some(code) = response.get("status_code").and_then(Value::as_u64) {
        if code != 200 {
            return Err(format!("response status {code}"));
        }
    }
    let content = response
        .pointer("/body/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or("no message content")?;
    if content.trim().is_empty() {
        return Err("empty message content".to_string());
    }
    Ok(content.to_string())
}

/// Parse one batch payload (JSONL). Lines that cannot be attributed to a row
/// of `range` or carry no usable content become warnings.
pub fn parse_payload(
    batch_seq: u32,
    range: BatchRange,
    payload: &str,
) -> (Vec<ResultRecord>, Vec<MergeWarning>) {
    let mut records: BTreeMap<usize, ResultRecord> = BTreeMap::new();
    let mut warnings = Vec::new();

    for (line_no, line) in payload.lines().enumerate() {
        let line_no = line_no + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut warn_line = |index: Option<usize>, reason: String| {
            warnings.push(MergeWarning::PayloadParse {
                batch_seq,
                line: line_no,
                index,
                reason,
            })
        };

        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn_line(None, format!("invalid JSON: {e}"));
                continue;
            }
        };
        let Some(custom_id) = value.get("custom_id").and_then(Value::as_str) else {
            warn_line(None, "missing custom_id".to_string());
            continue;
        };
        let Some(index) = parse_custom_id(custom_id) else {
            warn_line(None, format!("unrecognised custom_id `{custom_id}`"));
            continue;
        };
        if !range.contains(index) {
            warn_line(Some(index), format!("row outside batch range {range}"));
            continue;
        }
        match line_content(&value) {
            Ok(content) => {
                let record = ResultRecord {
                    index,
                    batch_seq,
                    content,
                    raw: value,
                };
                if records.insert(index, record).is_some() {
                    warnings.push(MergeWarning::DuplicateInBatch { batch_seq, index });
                }
            }
            Err(reason) => warn_line(Some(index), reason),
        }
    }

    (records.into_values().collect(), warnings)
}

/// Merge every completed batch of `registry`, reading payloads through `load`.
pub fn merge_with<F>(registry: &BatchRegistry, row_count: usize, load: F) -> Result<MergeOutcome>
where
    F: Fn(&BatchRecord) -> std::io::Result<String>,
{
    if registry.total_items != row_count {
        return Err(Error::DatasetMismatch {
            registry: registry.total_items,
            rows: row_count,
        });
    }

    let mut winners: BTreeMap<usize, ResultRecord> = BTreeMap::new();
    let mut warnings = Vec::new();
    let mut superseded = 0;

    for record in registry
        .batches
        .values()
        .filter(|b| b.status == BatchStatus::Completed)
    {
        let payload = match load(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(seq = record.seq, "Cannot read payload: {}", e);
                warnings.push(MergeWarning::PayloadUnavailable {
                    batch_seq: record.seq,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let (records, batch_warnings) = parse_payload(record.seq, record.range, &payload);
        debug!(
            seq = record.seq,
            records = records.len(),
            warnings = batch_warnings.len(),
            "Parsed batch payload"
        );
        warnings.extend(batch_warnings);

        for result in records {
            match winners.get(&result.index) {
                Some(existing) if existing.batch_seq > result.batch_seq => superseded += 1,
                Some(_) => {
                    superseded += 1;
                    winners.insert(result.index, result);
                }
                None => {
                    winners.insert(result.index, result);
                }
            }
        }
    }

    let missing: Vec<usize> = (0..row_count).filter(|i| !winners.contains_key(i)).collect();
    let rows = winners
        .into_values()
        .map(|r| MergedRow {
            original_index: r.index,
            content: r.content,
            batch_seq: r.batch_seq,
        })
        .collect();

    for warning in &warnings {
        warn!("{}", warning);
    }
    let outcome = MergeOutcome {
        table: MergedTable { rows },
        missing,
        warnings,
        superseded,
    };
    info!(
        "Merged {} of {} rows ({} missing, {} warnings, {} superseded)",
        outcome.table.len(),
        row_count,
        outcome.missing.len(),
        outcome.warnings.len(),
        outcome.superseded
    );
    Ok(outcome)
}

/// Merge completed batches of `registry` against `items`, reading payloads from `store`.
pub fn merge(registry: &BatchRegistry, items: &[WorkItem], store: &RunStore) -> Result<MergeOutcome> {
    merge_with(registry, items.len(), |record| match &record.result_location {
        Some(location) => store.read_payload(location),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no result location recorded",
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_line(custom_id: &str, content: &str) -> String {
        serde_json::json!({
            "custom_id": custom_id,
            "response": {
                "status_code": 200,
                "body": { "choices": [ { "message": { "role": "assistant", "content": content } } ] }
            },
            "error": null
        })
        .to_string()
    }

    #[test]
    fn custom_id_formats() {
        assert_eq!(parse_custom_id("row_25"), Some(25));
        assert_eq!(parse_custom_id("request-1"), Some(0));
        assert_eq!(parse_custom_id("request-0"), None);
        assert_eq!(parse_custom_id("item-3"), None);
    }

    #[test]
    fn bad_lines_only_affect_their_row() {
        let payload = [
            ok_line("row_0", "zero"),
            "{not json".to_string(),
            serde_json::json!({"custom_id": "row_1", "response": {"status_code": 500, "body": {}}})
                .to_string(),
            serde_json::json!({"custom_id": "row_2", "response": null, "error": {"message": "boom"}})
                .to_string(),
            ok_line("row_3", "   "),
            ok_line("row_4", "four"),
            ok_line("row_9", "outside"),
        ]
        .join("\n");
        let (records, warnings) = parse_payload(1, BatchRange::new(0, 5), &payload);
        let indices: Vec<usize> = records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 4]);
        assert_eq!(warnings.len(), 5);
        assert!(warnings.iter().any(|w| matches!(
            w,
            MergeWarning::PayloadParse { index: Some(2), reason, .. } if reason.contains("boom")
        )));
    }

    #[test]
    fn later_line_in_same_payload_wins() {
        let payload = format!("{}\n{}\n", ok_line("row_0", "first"), ok_line("row_0", "second"));
        let (records, warnings) = parse_payload(1, BatchRange::new(0, 1), &payload);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "second");
        assert_eq!(
            warnings,
            vec![MergeWarning::DuplicateInBatch {
                batch_seq: 1,
                index: 0
            }]
        );
    }

    #[test]
    fn table_lookup_by_index() {
        let table = MergedTable {
            rows: vec![
                MergedRow {
                    original_index: 2,
                    content: "b".to_string(),
                    batch_seq: 1,
                },
                MergedRow {
                    original_index: 7,
                    content: "c".to_string(),
                    batch_seq: 2,
                },
            ],
        };
        assert_eq!(table.get(7).map(|r| r.content.as_str()), Some("c"));
        assert!(table.get(3).is_none());
    }
}
