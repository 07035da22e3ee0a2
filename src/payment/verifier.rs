//! On-chain verification of settlement transactions.

use crate::chain::{
    decode_transfer, units_to_usd, ChainClient, ChainRegistry, TransferEvent,
    TRANSFER_EVENT_TOPIC,
};
use crate::error::{Error, Result, VerificationFailure};
use alloy_primitives::Address;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fraction of the expected amount a settlement may deviate by, in either
/// direction, and still be accepted. Covers rounding at the wallet and
/// fee-on-transfer quirks.
pub const AMOUNT_TOLERANCE: f64 = 0.01;

/// Outcome of a successful on-chain verification.
#[derive(Debug, Clone)]
pub struct PaymentVerification {
    /// Verified transaction hash (lowercase).
    pub transaction_hash: String,
    /// Paying wallet (lowercase).
    pub from: String,
    /// Receiving wallet (lowercase).
    pub to: String,
    /// Amount observed on-chain, in USD.
    pub amount_usd: f64,
    /// Chain the transfer was observed on.
    pub chain_id: u64,
    /// Block the transfer was mined in.
    pub block_number: Option<u64>,
    /// Block timestamp, when the provider returned one.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Verifies that a transaction settles an expected payment: mined and
/// successful, a stablecoin transfer at the configured contract, addressed
/// to the receiver wallet, for an amount within tolerance.
pub struct TransactionVerifier {
    clients: HashMap<u64, Arc<dyn ChainClient>>,
    registry: ChainRegistry,
    receiver: Address,
}

impl TransactionVerifier {
    /// Create a verifier over one client per configured chain.
    #[must_use]
    pub fn new(
        clients: HashMap<u64, Arc<dyn ChainClient>>,
        registry: ChainRegistry,
        receiver: Address,
    ) -> Self {
        Self {
            clients,
            registry,
            receiver,
        }
    }

    /// The receiver wallet all settlements must be addressed to.
    #[must_use]
    pub fn receiver(&self) -> Address {
        self.receiver
    }

    fn client(&self, chain_id: u64) -> Result<&Arc<dyn ChainClient>> {
        self.clients
            .get(&chain_id)
            .ok_or_else(|| Error::InvalidRequest(format!("unsupported chain id: {chain_id}")))
    }

    /// Verify a settlement transaction against an expected USD amount.
    ///
    /// # Errors
    ///
    /// Returns `Verification` for a conclusive rejection (the payment should
    /// be failed), `Provider` for transient transport faults (the payment
    /// stays pending), and `InvalidRequest` for an unsupported chain.
    pub async fn verify(
        &self,
        tx_hash: &str,
        expected_usd: f64,
        chain_id: u64,
    ) -> Result<PaymentVerification> {
        let spec = self.registry.get(chain_id)?;
        let client = self.client(chain_id)?;

        let receipt = client
            .transaction_receipt(tx_hash)
            .await?
            .ok_or(VerificationFailure::NotConfirmed)?;

        if !receipt.is_success() {
            return Err(VerificationFailure::TransactionFailed.into());
        }

        let transfers: Vec<TransferEvent> = receipt
            .logs
            .iter()
            .filter(|log| {
                Address::from_str(&log.address)
                    .map(|addr| addr == spec.token_contract)
                    .unwrap_or(false)
            })
            .filter_map(decode_transfer)
            .collect();

        if transfers.is_empty() {
            return Err(VerificationFailure::NoTransferLog.into());
        }

        let Some(transfer) = transfers.iter().find(|t| t.to == self.receiver) else {
            let observed = transfers[0].to;
            return Err(VerificationFailure::WrongRecipient {
                expected: format!("{:#x}", self.receiver),
                observed: format!("{observed:#x}"),
            }
            .into());
        };

        let observed_usd = units_to_usd(transfer.value, spec.decimals);
        if (observed_usd - expected_usd).abs() > expected_usd * AMOUNT_TOLERANCE {
            return Err(VerificationFailure::AmountMismatch {
                expected: expected_usd,
                observed: observed_usd,
            }
            .into());
        }

        let block_number = receipt.block_number_u64();
        let timestamp = match block_number {
            Some(number) => match client.block_by_number(number).await {
                Ok(block) => block
                    .and_then(|b| b.timestamp_u64())
                    .and_then(|secs| Utc.timestamp_opt(i64::try_from(secs).ok()?, 0).single()),
                Err(e) => {
                    // Timestamp is informational only.
                    warn!("failed to fetch block {number} on chain {chain_id}: {e}");
                    None
                }
            },
            None => None,
        };

        debug!(
            "verified {tx_hash} on {}: {observed_usd} USD from {:#x}",
            spec.name, transfer.from
        );

        Ok(PaymentVerification {
            transaction_hash: tx_hash.to_lowercase(),
            from: format!("{:#x}", transfer.from),
            to: format!("{:#x}", transfer.to),
            amount_usd: observed_usd,
            chain_id,
            block_number,
            timestamp,
        })
    }

    /// Whether a log's topic0 marks it as a token transfer.
    #[must_use]
    pub fn is_transfer_topic(topic: &str) -> bool {
        alloy_primitives::B256::from_str(topic)
            .map(|t| t == TRANSFER_EVENT_TOPIC)
            .unwrap_or(false)
    }
}
