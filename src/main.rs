//! batchmerge CLI entrypoint.
//!
//! Thin wrapper over the `cli` module: load `.env`, parse args, dispatch to a
//! subcommand, and exit with an appropriate status.
//! For programmatic use, prefer the library API (`batchmerge::api`).

use clap::Parser;

mod cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = cli::CliArgs::parse();
    cli::run(args)
}
