//! Command Line Interface (CLI) layer for batchmerge.
//!
//! This module defines argument parsing (`args`), error types (`errors`),
//! and the dispatch logic (`runner`) for the `run`, `resume`, `status`,
//! `merge`, `rerun-missing` and `costs` subcommands. It wires user-provided
//! options to the library functionality exposed via `batchmerge::api`.
//!
//! If you are embedding batchmerge into another application, prefer the
//! high-level `batchmerge::api` module instead of calling the CLI code.
pub mod args;
pub mod errors;
pub mod runner;

pub use args::CliArgs;
pub use runner::run;
