//! pricewatch CLI: resolve retail prices for an item list across several
//! sources concurrently, with live progress and pause/resume.

mod commands;
mod observer;

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
