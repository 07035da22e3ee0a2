//! Node wiring and lifecycle.

use crate::chain::{parse_address, ChainClient, ChainRegistry, RpcClient};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::payment::{
    CrawlStats, IntentRegistry, ListenerStatus, PaymentService, ReconciliationCrawler,
    TransactionVerifier, TransferListener,
};
use crate::payment::store::MemoryPaymentStore;
use crate::subscription::MemorySubscriptionStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Builds a [`RunningNode`] from configuration.
pub struct NodeBuilder {
    config: NodeConfig,
}

impl NodeBuilder {
    /// Start building a node.
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Wire up every component. No network traffic happens here; the
    /// listener and crawler only touch providers once the node starts.
    ///
    /// # Errors
    ///
    /// Returns `Config` when the receiver address is missing, no chains
    /// are configured, or the listener points at an unconfigured chain.
    pub fn build(self) -> Result<RunningNode> {
        let config = self.config;

        if config.receiver_address.is_empty() {
            return Err(Error::Config("receiver_address is required".to_string()));
        }
        let receiver = parse_address(&config.receiver_address)
            .map_err(|e| Error::Config(format!("bad receiver address: {e}")))?;

        let registry = ChainRegistry::from_config(&config.chains)?;
        if registry.is_empty() {
            return Err(Error::Config("at least one chain is required".to_string()));
        }

        let rpc_timeout = Duration::from_secs(config.rpc_timeout_secs);
        let mut clients: HashMap<u64, Arc<dyn ChainClient>> = HashMap::new();
        for spec in registry.iter() {
            clients.insert(
                spec.chain_id,
                Arc::new(RpcClient::new(&spec.rpc_url, rpc_timeout)),
            );
        }

        let verifier = TransactionVerifier::new(clients.clone(), registry.clone(), receiver);
        let service = Arc::new(PaymentService::new(
            IntentRegistry::new(config.intent_ttl_secs),
            Arc::new(MemoryPaymentStore::new()),
            Arc::new(MemorySubscriptionStore::new()),
            verifier,
            registry.clone(),
            config.default_chain_id,
        ));

        let listener = if config.listener.enabled {
            let chain_id = config.listener_chain_id();
            let spec = registry.get(chain_id).map_err(|_| {
                Error::Config(format!("listener chain {chain_id} is not configured"))
            })?;
            let client = clients
                .get(&chain_id)
                .cloned()
                .ok_or_else(|| Error::Config(format!("no client for chain {chain_id}")))?;
            Some(TransferListener::new(
                Arc::clone(&service),
                client,
                spec,
                receiver,
                Duration::from_secs(config.listener.poll_interval_secs),
                Duration::from_secs(config.listener.max_backoff_secs),
                config.listener.max_block_range,
            ))
        } else {
            None
        };

        let crawler = Arc::new(ReconciliationCrawler::new(
            Arc::clone(&service),
            Duration::from_secs(config.crawler.interval_secs),
            config.crawler.batch_size,
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(RunningNode {
            config,
            service,
            listener,
            crawler,
            shutdown_tx,
        })
    }
}

/// A fully wired node.
pub struct RunningNode {
    config: NodeConfig,
    service: Arc<PaymentService>,
    listener: Option<TransferListener>,
    crawler: Arc<ReconciliationCrawler>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for RunningNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningNode")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RunningNode {
    /// Start the background workers.
    pub async fn start(&self) {
        if let Some(listener) = &self.listener {
            listener.start().await;
        }
        if self.config.crawler.enabled {
            let crawler = Arc::clone(&self.crawler);
            let rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                crawler.run(rx).await;
            });
        }
        info!(
            "node started: receiver {}, {} chain(s)",
            self.config.receiver_address.to_lowercase(),
            self.config.chains.len()
        );
    }

    /// Start the workers and block until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed.
    pub async fn run(self) -> Result<()> {
        self.start().await;
        wait_for_signal().await?;
        self.shutdown();
        Ok(())
    }

    /// The payment service driving this node.
    #[must_use]
    pub fn service(&self) -> Arc<PaymentService> {
        Arc::clone(&self.service)
    }

    /// Listener state, when a listener is configured.
    #[must_use]
    pub fn listener_status(&self) -> Option<ListenerStatus> {
        self.listener.as_ref().map(TransferListener::status)
    }

    /// Trigger one reconciliation pass outside the schedule.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the crawl.
    pub async fn crawl_pending_payments(&self) -> Result<CrawlStats> {
        self.crawler.crawl_once().await
    }

    /// Stop the workers. Safe to call repeatedly.
    pub fn shutdown(&self) {
        info!("node shutting down");
        if let Some(listener) = &self.listener {
            listener.stop();
        }
        if self.shutdown_tx.send(true).is_err() {
            warn!("no background workers were listening for shutdown");
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| Error::Config(format!("cannot install SIGTERM handler: {e}")))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| Error::Config(format!("cannot install SIGINT handler: {e}")))?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Config(format!("cannot install ctrl-c handler: {e}")))?;
    info!("received ctrl-c");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;

    fn config() -> NodeConfig {
        NodeConfig {
            receiver_address: "0x742d35Cc6634C0532925a3b844Bc9e7595916Da2".to_string(),
            chains: vec![ChainConfig {
                chain_id: 137,
                name: None,
                rpc_url: "http://localhost:8545".to_string(),
                token_contract: None,
                decimals: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_build_requires_receiver() {
        let mut cfg = config();
        cfg.receiver_address = String::new();
        assert!(matches!(
            NodeBuilder::new(cfg).build().unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn test_build_requires_chains() {
        let mut cfg = config();
        cfg.chains.clear();
        assert!(matches!(
            NodeBuilder::new(cfg).build().unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn test_build_rejects_listener_on_unconfigured_chain() {
        let mut cfg = config();
        cfg.listener.chain_id = Some(8453);
        assert!(matches!(
            NodeBuilder::new(cfg).build().unwrap_err(),
            Error::Config(_)
        ));
    }

    #[tokio::test]
    async fn test_build_wires_listener_and_crawler() {
        let node = NodeBuilder::new(config()).build().expect("node");
        let status = node.listener_status().expect("listener");
        assert_eq!(status.chain_id, 137);
        assert!(!status.listening);

        let stats = node.crawl_pending_payments().await.expect("crawl");
        assert_eq!(stats.examined, 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_safe_without_start() {
        let node = NodeBuilder::new(config()).build().expect("node");
        node.shutdown();
        node.shutdown();
    }
}
