//! Live transfer listener.
//!
//! Polls one chain for stablecoin transfers addressed to the receiver
//! wallet and feeds each one into the payment service. Provider faults put
//! the listener into a degraded state: it keeps the node alive, backs off
//! exponentially up to a cap, and resumes from its block cursor once the
//! provider recovers. A degraded listener never blocks startup; the
//! crawler covers settlements missed while degraded.

use crate::chain::{
    address_topic, decode_transfer, ChainClient, ChainSpec, LogFilter, TRANSFER_EVENT_TOPIC,
};
use crate::error::Result;
use crate::payment::service::PaymentService;
use alloy_primitives::Address;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Observable listener state.
#[derive(Debug, Clone)]
pub struct ListenerStatus {
    /// Whether the last poll succeeded.
    pub listening: bool,
    /// Chain being watched.
    pub chain_id: u64,
    /// Last block the listener finished scanning.
    pub last_block: Option<u64>,
}

struct ListenerInner {
    service: Arc<PaymentService>,
    client: Arc<dyn ChainClient>,
    chain_id: u64,
    token_contract: Address,
    receiver: Address,
    poll_interval: Duration,
    max_backoff: Duration,
    max_block_range: u64,
    listening: AtomicBool,
    // 0 means "no block scanned yet".
    last_block: AtomicU64,
}

/// Polling listener for stablecoin transfers to the receiver wallet.
pub struct TransferListener {
    inner: Arc<ListenerInner>,
    stop_tx: RwLock<Option<watch::Sender<bool>>>,
}

impl TransferListener {
    /// Create a listener for one chain.
    #[must_use]
    pub fn new(
        service: Arc<PaymentService>,
        client: Arc<dyn ChainClient>,
        spec: &ChainSpec,
        receiver: Address,
        poll_interval: Duration,
        max_backoff: Duration,
        max_block_range: u64,
    ) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                service,
                client,
                chain_id: spec.chain_id,
                token_contract: spec.token_contract,
                receiver,
                poll_interval,
                max_backoff,
                max_block_range: max_block_range.max(1),
                listening: AtomicBool::new(false),
                last_block: AtomicU64::new(0),
            }),
            stop_tx: RwLock::new(None),
        }
    }

    /// Start the polling loop. Calling again while running is a no-op.
    ///
    /// A provider that is down at start leaves the listener degraded, not
    /// the node dead: the loop starts anyway and self-heals via backoff.
    pub async fn start(&self) {
        if self.stop_tx.read().is_some() {
            debug!("transfer listener already running");
            return;
        }

        match self.inner.client.block_number().await {
            Ok(head) => {
                self.inner.last_block.store(head, Ordering::SeqCst);
                self.inner.listening.store(true, Ordering::SeqCst);
                info!(
                    "transfer listener watching chain {} from block {head}",
                    self.inner.chain_id
                );
            }
            Err(e) => {
                self.inner.listening.store(false, Ordering::SeqCst);
                warn!(
                    "transfer listener starting degraded on chain {}: {e}",
                    self.inner.chain_id
                );
            }
        }

        let (tx, rx) = watch::channel(false);
        {
            let mut stop_slot = self.stop_tx.write();
            if stop_slot.is_some() {
                return;
            }
            *stop_slot = Some(tx);
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_loop(inner, rx).await;
        });
    }

    /// Stop the polling loop. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.write().take() {
            let _ = tx.send(true);
            info!("transfer listener stopped");
        }
        self.inner.listening.store(false, Ordering::SeqCst);
    }

    /// Whether the last poll succeeded.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// Snapshot of the listener state.
    #[must_use]
    pub fn status(&self) -> ListenerStatus {
        let last = self.inner.last_block.load(Ordering::SeqCst);
        ListenerStatus {
            listening: self.is_listening(),
            chain_id: self.inner.chain_id,
            last_block: (last > 0).then_some(last),
        }
    }

    #[cfg(test)]
    async fn poll_once(&self) -> Result<()> {
        poll_once(&self.inner).await
    }
}

async fn run_loop(inner: Arc<ListenerInner>, mut stop_rx: watch::Receiver<bool>) {
    let mut delay = inner.poll_interval;
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                debug!("transfer listener loop exiting");
                return;
            }
            () = tokio::time::sleep(delay) => {
                match poll_once(&inner).await {
                    Ok(()) => {
                        if !inner.listening.swap(true, Ordering::SeqCst) {
                            info!("transfer listener recovered on chain {}", inner.chain_id);
                        }
                        delay = inner.poll_interval;
                    }
                    Err(e) => {
                        inner.listening.store(false, Ordering::SeqCst);
                        delay = next_backoff(delay, inner.max_backoff);
                        warn!(
                            "transfer listener poll failed on chain {}, retrying in {:?}: {e}",
                            inner.chain_id, delay
                        );
                    }
                }
            }
        }
    }
}

/// Scan the next block window for transfers to the receiver and hand each
/// one to the payment service.
async fn poll_once(inner: &ListenerInner) -> Result<()> {
    let head = inner.client.block_number().await?;
    let cursor = inner.last_block.load(Ordering::SeqCst);

    if cursor == 0 {
        // First successful poll after a degraded start: begin at the head,
        // history is the crawler's job.
        inner.last_block.store(head, Ordering::SeqCst);
        return Ok(());
    }
    if head <= cursor {
        return Ok(());
    }

    let from = cursor + 1;
    let to = head.min(cursor + inner.max_block_range);

    let filter = LogFilter {
        from_block: from,
        to_block: to,
        address: inner.token_contract,
        topic0: TRANSFER_EVENT_TOPIC,
        topic2: Some(address_topic(inner.receiver)),
    };
    let logs = inner.client.logs(&filter).await?;

    for log in &logs {
        let Some(transfer) = decode_transfer(log) else {
            continue;
        };
        if transfer.to != inner.receiver {
            continue;
        }
        debug!(
            "observed transfer {} in block window {from}..={to}",
            transfer.transaction_hash
        );
        let service = Arc::clone(&inner.service);
        let chain_id = inner.chain_id;
        tokio::spawn(async move {
            if let Err(e) = service.process_transfer(transfer, chain_id).await {
                warn!("failed to process observed transfer: {e}");
            }
        });
    }

    inner.last_block.store(to, Ordering::SeqCst);
    Ok(())
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
