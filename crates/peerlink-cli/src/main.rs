//! PeerLink CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;

use peerlink_cli::{cli::Cli, commands::CommandDispatcher, config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let mut config = config::load(cli.config.as_deref()).context("loading configuration")?;
    config
        .apply_overrides(cli.max_attempts, cli.connect_timeout_ms)
        .context("applying command-line overrides")?;

    CommandDispatcher::execute(cli, config)
        .await
        .context("command failed")?;

    info!("PeerLink CLI exited successfully");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
