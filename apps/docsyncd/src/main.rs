//! docsyncd — multi-tenant documentation sync daemon.
//!
//! Keeps each configured tenant's documentation corpus in sync with its
//! upstream source on a cron schedule, through a resumable crawl/fetch
//! pipeline backed by per-tenant SQLite state.

mod commands;
mod extractor;

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
