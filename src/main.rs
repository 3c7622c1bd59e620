//! saxotrader - automated momentum bot for Saxo's OpenAPI.
//!
//! Watches a broad stock universe over the streaming API, enters on EMA
//! crossovers, and exits via a trailing stop gated by an audit of
//! commissions, FX friction, and slippage. Runs as a single process until
//! SIGINT/SIGTERM.
//!
//! # Usage
//! ```sh
//! cargo run                    # env-driven, DRY_RUN=true by default
//! cargo run -- --kill-switch   # cancel all orders, flatten, exit
//! ```

use anyhow::Result;
use clap::Parser;
use saxotrader::application::system::Trader;
use saxotrader::config::Config;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(version, about = "Automated momentum trader for Saxo OpenAPI")]
struct Cli {
    /// Force simulation mode regardless of the DRY_RUN environment setting.
    #[arg(long)]
    dry_run: bool,

    /// Cancel all open orders, close all positions at market, and exit.
    #[arg(long)]
    kill_switch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if cli.dry_run {
        config.dry_run = true;
    }

    info!("Starting saxotrader {}...", env!("CARGO_PKG_VERSION"));
    info!(
        "Mode: {}",
        if config.dry_run { "SIMULATION" } else { "REAL MONEY" }
    );

    // Authentication failure here propagates and exits nonzero.
    let trader = Trader::build(config).await?;

    if cli.kill_switch {
        trader.kill_switch().await;
        return Ok(());
    }

    trader.run().await
}
