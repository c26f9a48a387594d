//! ccbench CLI — benchmark-execution harness for the context-collapse study.
//!
//! Runs the fixed sites × questions × models × conditions matrix against a
//! local inference endpoint, producing a durable, resumable result dataset.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
