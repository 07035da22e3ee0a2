//! paywatch daemon entry point.

mod cli;

use clap::Parser;
use cli::Cli;
use paywatch::{NodeBuilder, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.into_config()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("paywatch {} starting", env!("CARGO_PKG_VERSION"));

    let node = NodeBuilder::new(config).build()?;
    node.run().await
}
