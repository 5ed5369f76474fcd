#![doc = r#"
batchmerge: resumable batch processing of CSV rows through an LLM batch API.

This crate splits the rows of a CSV (an image path and a prompt per row) into
fixed-size batches, submits them to an asynchronous batch endpoint, polls them
to completion, retries failed executions within a bounded budget and merges the
returned responses back into an ordered table. Every state transition is
persisted to a human-readable registry, so an interrupted run picks up where it
stopped. It powers the `batchmerge` CLI and can be embedded in your own tools.

Stability
---------
The public library API is experimental in initial releases and may evolve.

Add dependency
--------------
```toml
[dependencies]
batchmerge = "0.1"
```

Quick start: run a CSV through the OpenAI batch API
---------------------------------------------------
```rust,no_run
use std::path::Path;
use batchmerge::{client_from_env, start_run, CancelToken, RunParams};

fn main() -> batchmerge::Result<()> {
    let params = RunParams {
        batch_size: 20,
        ..RunParams::default()
    };
    let api = client_from_env(&params)?; // reads OPENAI_API_KEY
    let report = start_run(
        Path::new("/data/images.csv"),
        Path::new("/runs/images"),
        &params,
        api,
        CancelToken::new(),
    )?;
    println!(
        "completed={} terminal_failed={} missing={}",
        report.completed,
        report.terminal_failed,
        report.missing.len()
    );
    Ok(())
}
```

Resume, merge and rerun
-----------------------
```rust,no_run
use std::path::Path;
use batchmerge::{client_from_env, merge_run, rerun_missing, resume_run, CancelToken, RunParams};

fn main() -> batchmerge::Result<()> {
    let run_dir = Path::new("/runs/images");
    let params = RunParams::default();

    // Offline: rebuild merged.csv / missing.txt / annotated.csv from stored payloads
    let report = merge_run(run_dir, &params)?;

    if !report.missing.is_empty() {
        // Queue rerun batches for the missing rows, then drive them
        rerun_missing(run_dir, &params)?;
        resume_run(run_dir, &params, client_from_env(&params)?, CancelToken::new())?;
    }
    Ok(())
}
```

Custom batch backends
---------------------
Anything implementing [`BatchApi`] can drive a run, which is how the tests
script remote behaviour without a network.

Error handling
--------------
All public functions return `batchmerge::Result<T>`; match on `batchmerge::Error`
to handle specific cases.

```rust,no_run
use std::path::Path;
use batchmerge::{merge_run, Error, RunParams};

fn main() {
    match merge_run(Path::new("/runs/images"), &RunParams::default()) {
        Ok(report) => println!("{} rows merged", report.merged_rows),
        Err(Error::DatasetMismatch { registry, rows }) => {
            eprintln!("CSV changed since the run started ({registry} vs {rows} rows)")
        }
        Err(Error::Source(e)) => eprintln!("cannot read rows: {e}"),
        Err(other) => eprintln!("Other error: {other}"),
    }
}
```

Useful modules
--------------
- [`api`]: high-level entry points.
- [`core`]: partitioning, the batch registry and job tracker, merging, costs.
- [`io`]: CSV rows, the batch API client, run directory store and output writers.
- [`types`]: batch and remote status enums.
- [`error`]: crate-level `Error` and `Result`.
"#]

// Core modules (public)
pub mod api;
pub mod core;
pub mod error;
pub mod io;
pub mod types;

// Curated public API surface
// Types
pub use crate::core::cancel::CancelToken;
pub use crate::core::merge::{MergeOutcome, MergeWarning, MergedRow, MergedTable};
pub use crate::core::params::{ItemColumns, RetryPolicy, RunParams};
pub use crate::core::partition::BatchRange;
pub use crate::core::registry::{BatchRecord, BatchRegistry, StatusCounts};
pub use crate::core::tracker::{DriveReport, JobTracker, PollOutcome};
pub use crate::error::{Error, Result};
pub use crate::types::{BatchOrigin, BatchStatus, RemoteState};

// External seams
pub use crate::io::openai::{ApiError, BatchApi, BatchSubmission, OpenAiBatchClient, StatusReport};
pub use crate::io::rows::{SourceReadError, WorkItem, read_rows};

// High-level API re-exports
pub use crate::api::{
    RunReport, RunStatus, client_from_env, merge_run, rerun_missing, resume_run, run_status,
    start_run,
};
