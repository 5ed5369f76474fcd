//! Batch splitter: contiguous, fixed-size chunks over the work item index space.
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Half-open range `[start, end)` of work item indices
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct BatchRange {
    pub start: usize,
    pub end: usize,
}

impl BatchRange {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index < self.end
    }

    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

impl std::fmt::Display for BatchRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "[]")
        } else {
            write!(f, "[{}-{}]", self.start, self.end - 1)
        }
    }
}

/// Split `[0, total)` into consecutive ranges of at most `batch_size` items.
pub fn partition(total: usize, batch_size: usize) -> Result<Vec<BatchRange>> {
    partition_span(0, total, batch_size)
}

/// Split `[start, end)` into consecutive ranges of at most `batch_size` items.
pub fn partition_span(start: usize, end: usize, batch_size: usize) -> Result<Vec<BatchRange>> {
    if batch_size == 0 {
        return Err(Error::ZeroSize { size: batch_size });
    }
    let mut ranges = Vec::with_capacity((end.saturating_sub(start)).div_ceil(batch_size));
    let mut current = start;
    while current < end {
        let next = (current + batch_size).min(end);
        ranges.push(BatchRange::new(current, next));
        current = next;
    }
    Ok(ranges)
}

/// Group sorted, de-duplicated indices into maximal contiguous ranges.
pub fn contiguous_runs(sorted: &[usize]) -> Vec<BatchRange> {
    let mut runs: Vec<BatchRange> = Vec::new();
    for &index in sorted {
        match runs.last_mut() {
            Some(run) if run.end == index => run.end += 1,
            _ => runs.push(BatchRange::new(index, index + 1)),
        }
    }
    runs
}

/// Check that `ranges`, taken in order, tile `[0, total)` exactly.
pub fn check_tiling(ranges: &[BatchRange], total: usize) -> std::result::Result<(), String> {
    let mut expected = 0;
    for range in ranges {
        if range.is_empty() {
            return Err(format!("empty batch range at index {}", range.start));
        }
        if range.start != expected {
            return Err(if range.start > expected {
                format!("gap between {} and {}", expected, range.start)
            } else {
                format!("overlap at {}", range.start)
            });
        }
        expected = range.end;
    }
    if expected != total {
        return Err(format!("ranges cover {expected} items, expected {total}"));
    }
    Ok(())
}
