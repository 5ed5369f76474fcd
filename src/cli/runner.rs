use std::path::Path;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use batchmerge::core::cost::CostLedger;
use batchmerge::{
    CancelToken, RunParams, RunReport, client_from_env, merge_run, rerun_missing, resume_run,
    run_status, start_run,
};

use super::args::{CliArgs, Commands, MergeArgs, ParamOverrides};
use super::errors::AppError;

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Ctrl-C handling: the first interrupt cancels `token`, so the tracker stops
/// after its current step and the run directory stays resumable. Returns
/// `true` when the run was already cancelled and the process should exit now.
fn interrupt(token: &CancelToken) -> bool {
    if token.is_cancelled() {
        return true;
    }
    warn!("Interrupted, stopping after the current step (press Ctrl-C again to exit now)");
    token.cancel();
    false
}

fn install_interrupt_handler() -> Result<CancelToken, AppError> {
    let token = CancelToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        if interrupt(&handler_token) {
            std::process::exit(130);
        }
    })?;
    Ok(token)
}

fn apply_overrides(mut params: RunParams, o: &ParamOverrides) -> Result<RunParams, AppError> {
    if let Some(size) = o.batch_size {
        if size == 0 {
            return Err(AppError::InvalidValue {
                arg: "--batch-size".to_string(),
                value: size.to_string(),
            });
        }
        params.batch_size = size;
    }
    if let Some(model) = &o.model {
        params.model = model.clone();
    }
    if let Some(max_tokens) = o.max_tokens {
        params.max_tokens = max_tokens;
    }
    if let Some(max_retries) = o.max_retries {
        params.retry.max_retries = max_retries;
    }
    if let Some(secs) = o.poll_interval {
        params.retry.poll_interval_secs = secs;
    }
    if let Some(secs) = o.retry_delay {
        params.retry.retry_delay_secs = secs;
    }
    if let Some(n) = o.max_in_flight {
        params.retry.max_in_flight = n;
    }
    if let Some(cost) = o.per_request_cost {
        params.per_request_cost = cost;
    }
    apply_columns(&mut params, o.image_column.as_deref(), o.prompt_column.as_deref());
    params.validate()?;
    Ok(params)
}

fn apply_columns(params: &mut RunParams, image: Option<&str>, prompt: Option<&str>) {
    if let Some(image) = image {
        params.columns.image = image.to_string();
    }
    if let Some(prompt) = prompt {
        params.columns.prompt = prompt.to_string();
    }
}

fn print_report(run_dir: &Path, report: &RunReport) {
    println!(
        "batches: {} completed, {} terminal_failed, {} unfinished",
        report.completed, report.terminal_failed, report.unfinished
    );
    println!(
        "rows: {} merged, {} missing ({} warnings)",
        report.merged_rows,
        report.missing.len(),
        report.warnings
    );
    if !report.missing.is_empty() {
        let preview: Vec<String> = report.missing.iter().take(20).map(|i| i.to_string()).collect();
        let more = if report.missing.len() > 20 { ", ..." } else { "" };
        println!("missing: {}{}", preview.join(", "), more);
    }
    println!("estimated cost: ${:.4}", report.estimated_cost);
    println!("outputs in {}", run_dir.display());
}

fn finish(report: &RunReport) -> Result<(), AppError> {
    if report.cancelled || !report.parked.is_empty() {
        warn!("Run stopped early; state is saved");
    }
    if report.unfinished > 0 {
        return Err(AppError::Unfinished {
            count: report.unfinished,
        });
    }
    Ok(())
}

fn merge_params(base: RunParams, args: &MergeArgs) -> RunParams {
    let mut params = base;
    apply_columns(&mut params, args.image_column.as_deref(), args.prompt_column.as_deref());
    params
}

fn show_status(run_dir: &Path) -> Result<(), AppError> {
    let status = run_status(run_dir)?;
    println!("source: {}", status.source.display());
    println!(
        "rows: {}  batch size: {}  model: {}",
        status.total_items, status.batch_size, status.model
    );
    println!(
        "{:>5}  {:<13} {:<8} {:<16} {:>7} {:>8}  {}",
        "seq", "rows", "origin", "status", "retries", "attempts", "submission"
    );
    for b in &status.batches {
        println!(
            "{:>5}  {:<13} {:<8} {:<16} {:>7} {:>8}  {}",
            b.seq,
            b.range.to_string(),
            b.origin.to_string(),
            b.status.to_string(),
            b.retry_count,
            b.attempts,
            b.submission_id.as_deref().unwrap_or("-")
        );
        if let Some(detail) = &b.error_detail {
            println!("       error: {detail}");
        }
    }
    let c = status.counts;
    println!(
        "pending {} / submitted {} / completed {} / failed {} / terminal_failed {}",
        c.pending, c.submitted, c.completed, c.failed, c.terminal_failed
    );
    println!(
        "estimated cost so far: ${:.4} ({} requests)",
        status.estimated_cost, status.billed_requests
    );
    Ok(())
}

fn show_costs(run_dir: &Path, per_request_cost: f64) -> Result<(), AppError> {
    let store = batchmerge::io::RunStore::open(run_dir)?;
    let ledger = CostLedger::load_or_new(&store.costs_path(), per_request_cost)?;
    if ledger.batches.is_empty() {
        println!("no completed batches recorded");
        return Ok(());
    }
    println!("{:>5}  {:>8}  {:>10}  {}", "seq", "requests", "cost", "recorded");
    for (seq, entry) in &ledger.batches {
        println!(
            "{:>5}  {:>8}  {:>10.4}  {}",
            seq,
            entry.requests,
            entry.estimated_cost,
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!(
        "total: {} requests, ${:.4}",
        ledger.total_requests(),
        ledger.total()
    );
    Ok(())
}

pub fn run(args: CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(args.log);

    let base = match &args.config {
        Some(path) => {
            info!("Loading run parameters from {:?}", path);
            RunParams::from_file(path)?
        }
        None => RunParams::default(),
    };

    match args.command {
        Commands::Run(run) => {
            let params = apply_overrides(base, &run.overrides)?;
            let api = client_from_env(&params)?;
            let cancel = install_interrupt_handler()?;
            let report = start_run(&run.input, &run.run_dir, &params, api, cancel)?;
            print_report(&run.run_dir, &report);
            finish(&report)?;
        }
        Commands::Resume(resume) => {
            let params = apply_overrides(base, &resume.overrides)?;
            let api = client_from_env(&params)?;
            let cancel = install_interrupt_handler()?;
            let report = resume_run(&resume.run_dir, &params, api, cancel)?;
            print_report(&resume.run_dir, &report);
            finish(&report)?;
        }
        Commands::Status(dir) => show_status(&dir.run_dir)?,
        Commands::Merge(merge) => {
            let params = merge_params(base, &merge);
            let report = merge_run(&merge.run_dir, &params)?;
            print_report(&merge.run_dir, &report);
        }
        Commands::RerunMissing(merge) => {
            let params = merge_params(base, &merge);
            let seqs = rerun_missing(&merge.run_dir, &params)?;
            if seqs.is_empty() {
                println!("no settled rows are missing; nothing queued");
            } else {
                println!(
                    "queued rerun batches {:?}; continue with `batchmerge resume --run-dir {}`",
                    seqs,
                    merge.run_dir.display()
                );
            }
        }
        Commands::Costs(dir) => show_costs(&dir.run_dir, base.per_request_cost)?,
    }

    Ok(())
}
