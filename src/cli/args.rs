use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "batchmerge", version, about = "Resumable LLM batch runs over CSV rows")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging (otherwise RUST_LOG, default info)
    #[arg(long, global = true, default_value_t = false)]
    pub log: bool,

    /// JSON file with run parameters; flags override its fields
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Split a CSV into batches, submit them and merge the results
    Run(RunArgs),
    /// Continue an interrupted run
    Resume(ResumeArgs),
    /// Show per-batch status of a run
    Status(RunDirArgs),
    /// Rebuild merged outputs from stored payloads without calling the API
    Merge(MergeArgs),
    /// Queue rerun batches for rows missing from the last merge
    RerunMissing(MergeArgs),
    /// Show the cost ledger of a run
    Costs(RunDirArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Input CSV with one work item per row
    #[arg(short, long)]
    pub input: PathBuf,

    /// Directory holding the registry, payloads and outputs of this run
    #[arg(short, long)]
    pub run_dir: PathBuf,

    #[command(flatten)]
    pub overrides: ParamOverrides,
}

#[derive(Args)]
pub struct ResumeArgs {
    #[arg(short, long)]
    pub run_dir: PathBuf,

    #[command(flatten)]
    pub overrides: ParamOverrides,
}

#[derive(Args)]
pub struct MergeArgs {
    #[arg(short, long)]
    pub run_dir: PathBuf,

    /// Column holding the image path
    #[arg(long)]
    pub image_column: Option<String>,

    /// Column holding the prompt
    #[arg(long)]
    pub prompt_column: Option<String>,
}

#[derive(Args)]
pub struct RunDirArgs {
    #[arg(short, long)]
    pub run_dir: PathBuf,
}

/// Per-invocation overrides of `RunParams`
#[derive(Args, Default)]
pub struct ParamOverrides {
    /// Rows per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Model name sent with every request
    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Execution failures tolerated per batch
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Seconds between polling passes
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Base seconds before a failed batch is resubmitted
    #[arg(long)]
    pub retry_delay: Option<u64>,

    /// Batches allowed in flight at once
    #[arg(long)]
    pub max_in_flight: Option<usize>,

    /// Estimated USD per request
    #[arg(long)]
    pub per_request_cost: Option<f64>,

    #[arg(long)]
    pub image_column: Option<String>,

    #[arg(long)]
    pub prompt_column: Option<String>,
}
