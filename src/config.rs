//! Configuration for paywatch.

use serde::{Deserialize, Serialize};

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// The wallet address that must appear as `to` in a valid payment
    /// transfer (e.g. "0x...").
    #[serde(default)]
    pub receiver_address: String,

    /// Chain used when a caller does not specify one.
    #[serde(default = "default_chain_id")]
    pub default_chain_id: u64,

    /// Chains enabled for verification. Each entry needs at least an RPC
    /// endpoint; token contract and decimals fall back to the built-in
    /// presets for well-known chains.
    #[serde(default)]
    pub chains: Vec<ChainConfig>,

    /// Transfer event listener configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Reconciliation crawler configuration.
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Payment intent time-to-live in seconds.
    #[serde(default = "default_intent_ttl")]
    pub intent_ttl_secs: u64,

    /// Request timeout for chain RPC calls in seconds.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Per-chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// EIP-155 chain identifier.
    pub chain_id: u64,

    /// Human-readable chain name. Defaults to the preset name.
    #[serde(default)]
    pub name: Option<String>,

    /// JSON-RPC endpoint for this chain.
    pub rpc_url: String,

    /// Stablecoin contract address watched for transfers. Defaults to the
    /// USDC preset for well-known chains; required for anything else.
    #[serde(default)]
    pub token_contract: Option<String>,

    /// Token decimal precision. Defaults to 6 (USDC/USDT).
    #[serde(default)]
    pub decimals: Option<u8>,
}

/// Transfer event listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Enable the live transfer listener.
    #[serde(default = "default_listener_enabled")]
    pub enabled: bool,

    /// Chain the listener watches. Defaults to `default_chain_id`.
    #[serde(default)]
    pub chain_id: Option<u64>,

    /// Poll interval for new blocks, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Upper bound for the exponential retry backoff, in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Maximum block span fetched per log query.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: default_listener_enabled(),
            chain_id: None,
            poll_interval_secs: default_poll_interval(),
            max_backoff_secs: default_max_backoff(),
            max_block_range: default_max_block_range(),
        }
    }
}

/// Reconciliation crawler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Enable the periodic crawler.
    #[serde(default = "default_crawler_enabled")]
    pub enabled: bool,

    /// Crawl interval in seconds.
    #[serde(default = "default_crawl_interval")]
    pub interval_secs: u64,

    /// How many recent pending payments each crawl examines.
    #[serde(default = "default_crawl_batch")]
    pub batch_size: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            enabled: default_crawler_enabled(),
            interval_secs: default_crawl_interval(),
            batch_size: default_crawl_batch(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            receiver_address: String::new(),
            default_chain_id: default_chain_id(),
            chains: Vec::new(),
            listener: ListenerConfig::default(),
            crawler: CrawlerConfig::default(),
            intent_ttl_secs: default_intent_ttl(),
            rpc_timeout_secs: default_rpc_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Chain id the listener should watch.
    #[must_use]
    pub fn listener_chain_id(&self) -> u64 {
        self.listener.chain_id.unwrap_or(self.default_chain_id)
    }
}

const fn default_chain_id() -> u64 {
    137 // Polygon
}

const fn default_intent_ttl() -> u64 {
    30 * 60
}

const fn default_rpc_timeout() -> u64 {
    30
}

const fn default_listener_enabled() -> bool {
    true
}

const fn default_poll_interval() -> u64 {
    12
}

const fn default_max_backoff() -> u64 {
    300
}

const fn default_max_block_range() -> u64 {
    1000
}

const fn default_crawler_enabled() -> bool {
    true
}

const fn default_crawl_interval() -> u64 {
    2 * 60
}

const fn default_crawl_batch() -> usize {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.default_chain_id, 137);
        assert_eq!(config.intent_ttl_secs, 30 * 60);
        assert_eq!(config.crawler.interval_secs, 120);
        assert_eq!(config.crawler.batch_size, 50);
        assert!(config.listener.enabled);
    }

    #[test]
    fn test_listener_chain_falls_back_to_default() {
        let mut config = NodeConfig {
            default_chain_id: 8453,
            ..Default::default()
        };
        assert_eq!(config.listener_chain_id(), 8453);

        config.listener.chain_id = Some(137);
        assert_eq!(config.listener_chain_id(), 137);
    }

    #[test]
    fn test_roundtrip_toml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("paywatch.toml");

        let config = NodeConfig {
            receiver_address: "0x742d35Cc6634C0532925a3b844Bc9e7595916Da2".to_string(),
            chains: vec![ChainConfig {
                chain_id: 137,
                name: None,
                rpc_url: "https://polygon-rpc.com".to_string(),
                token_contract: None,
                decimals: None,
            }],
            ..Default::default()
        };

        config.to_file(&path).expect("write config");
        let loaded = NodeConfig::from_file(&path).expect("read config");
        assert_eq!(loaded.receiver_address, config.receiver_address);
        assert_eq!(loaded.chains.len(), 1);
        assert_eq!(loaded.chains[0].chain_id, 137);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let toml_str = r#"
            receiver_address = "0x742d35Cc6634C0532925a3b844Bc9e7595916Da2"

            [[chains]]
            chain_id = 137
            rpc_url = "https://polygon-rpc.com"
        "#;
        let config: NodeConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.crawler.batch_size, 50);
        assert!(config.chains[0].token_contract.is_none());
    }
}
