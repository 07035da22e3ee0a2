//! Command-line interface.

use clap::Parser;
use paywatch::{NodeConfig, Result};
use std::path::PathBuf;

/// On-chain stablecoin payment watcher for subscription billing.
#[derive(Debug, Parser)]
#[command(name = "paywatch", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "PAYWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Receiver wallet address, overriding the configuration file.
    #[arg(long, env = "PAYWATCH_RECEIVER")]
    pub receiver: Option<String>,

    /// Default chain id, overriding the configuration file.
    #[arg(long, env = "PAYWATCH_CHAIN_ID")]
    pub chain_id: Option<u64>,

    /// Log filter, e.g. "info" or "paywatch=debug".
    #[arg(long, env = "PAYWATCH_LOG")]
    pub log_level: Option<String>,

    /// Disable the live transfer listener.
    #[arg(long)]
    pub no_listener: bool,

    /// Disable the reconciliation crawler.
    #[arg(long)]
    pub no_crawler: bool,
}

impl Cli {
    /// Resolve the effective configuration: file (or defaults) plus
    /// command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read or parsed.
    pub fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)?,
            None => NodeConfig::default(),
        };

        if let Some(receiver) = self.receiver {
            config.receiver_address = receiver;
        }
        if let Some(chain_id) = self.chain_id {
            config.default_chain_id = chain_id;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if self.no_listener {
            config.listener.enabled = false;
        }
        if self.no_crawler {
            config.crawler.enabled = false;
        }

        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply() {
        let cli = Cli::parse_from([
            "paywatch",
            "--receiver",
            "0x742d35Cc6634C0532925a3b844Bc9e7595916Da2",
            "--chain-id",
            "8453",
            "--no-listener",
        ]);
        let config = cli.into_config().expect("config");
        assert_eq!(
            config.receiver_address,
            "0x742d35Cc6634C0532925a3b844Bc9e7595916Da2"
        );
        assert_eq!(config.default_chain_id, 8453);
        assert!(!config.listener.enabled);
        assert!(config.crawler.enabled);
    }

    #[test]
    fn test_defaults_without_file() {
        let cli = Cli::parse_from(["paywatch"]);
        let config = cli.into_config().expect("config");
        assert_eq!(config.default_chain_id, 137);
    }
}
