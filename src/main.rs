//! # PeerBox CLI Application
//!
//! Entry point for the `peerbox` binary: sets up logging, parses the command
//! line and hands off to [`peerbox::cli`].

use anyhow::Result;
use clap::Parser;
use colored::*;
use peerbox::cli::{self, Cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerbox=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli::run(cli.command).await {
        eprintln!(
            "{} {}\n{}",
            "Error:".red().bold(),
            format!("{:#}", e).red(),
            "Tip: Run with --help for usage information.".yellow()
        );
        std::process::exit(1);
    }
    Ok(())
}
