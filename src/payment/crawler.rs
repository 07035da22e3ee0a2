//! Reconciliation crawler.
//!
//! Periodic sweep over recent pending payments that re-attempts on-chain
//! verification. Covers settlements the live listener missed: transfers
//! mined while the listener was degraded, or callers that broadcast a
//! transaction and never came back to confirm it.

use crate::error::Error;
use crate::payment::service::{PaymentService, VerifyOutcome};
use crate::payment::store::{Payment, PaymentStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Counters from one crawl pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlStats {
    /// Pending payments looked at.
    pub examined: usize,
    /// Payments whose transaction was re-verified.
    pub attempted: usize,
    /// Attempts that settled the payment.
    pub verified: usize,
    /// Attempts conclusively rejected.
    pub failed: usize,
    /// Payments skipped as expired or not yet verifiable.
    pub skipped: usize,
}

/// Periodic re-verification of pending payments.
pub struct ReconciliationCrawler {
    service: Arc<PaymentService>,
    interval: Duration,
    batch_size: usize,
}

impl ReconciliationCrawler {
    /// Create a crawler over the payment service.
    #[must_use]
    pub fn new(service: Arc<PaymentService>, interval: Duration, batch_size: usize) -> Self {
        Self {
            service,
            interval,
            batch_size,
        }
    }

    /// Run the crawl loop until shutdown is signalled. Crawls once
    /// immediately, then on every interval tick.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            "reconciliation crawler running every {:?}, batch size {}",
            self.interval, self.batch_size
        );
        self.crawl_and_log().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!("reconciliation crawler exiting");
                    return;
                }
                _ = ticker.tick() => {
                    self.crawl_and_log().await;
                }
            }
        }
    }

    async fn crawl_and_log(&self) {
        match self.crawl_once().await {
            Ok(stats) if stats.examined > 0 => {
                info!(
                    "crawl pass: {} examined, {} attempted, {} verified, {} failed, {} skipped",
                    stats.examined, stats.attempted, stats.verified, stats.failed, stats.skipped
                );
            }
            Ok(_) => debug!("crawl pass: nothing pending"),
            Err(e) => warn!("crawl pass failed: {e}"),
        }
    }

    /// Sweep the most recent pending payments once.
    ///
    /// # Errors
    ///
    /// Returns storage errors. Per-payment verification outcomes are
    /// absorbed into the stats instead.
    pub async fn crawl_once(&self) -> crate::Result<CrawlStats> {
        let pending = self
            .service
            .payments()
            .recent_pending(self.batch_size)
            .await?;

        let mut stats = CrawlStats::default();
        for payment in pending {
            stats.examined += 1;

            if is_expired(&payment) {
                debug!("skipping expired payment {}", payment.id);
                stats.skipped += 1;
                continue;
            }
            if payment.transaction_hash.is_none() {
                // Nothing on-chain to check yet.
                stats.skipped += 1;
                continue;
            }
            if payment.metadata_str("signature").is_none() {
                // The intent was never bound to a wallet.
                stats.skipped += 1;
                continue;
            }

            stats.attempted += 1;
            match self
                .service
                .verify_payment_transaction(&payment.id, None, payment.chain_id)
                .await
            {
                Ok(VerifyOutcome::Activated { .. }) => stats.verified += 1,
                Ok(VerifyOutcome::AlreadyProcessed) => stats.skipped += 1,
                Err(Error::Verification(failure)) => {
                    debug!("payment {} rejected during crawl: {failure}", payment.id);
                    stats.failed += 1;
                }
                Err(e) => {
                    // Transient fault, the payment stays pending for the
                    // next pass.
                    warn!("crawl attempt for payment {} errored: {e}", payment.id);
                }
            }
        }

        self.service.purge_expired_intents();
        Ok(stats)
    }
}

fn is_expired(payment: &Payment) -> bool {
    payment
        .metadata_str("expires_at")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .is_some_and(|expires| expires < Utc::now())
}
