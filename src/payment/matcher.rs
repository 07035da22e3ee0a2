//! Matching observed transfers back to payment records.
//!
//! Resolution order for an incoming transfer:
//!
//! 1. a payment already holding the transaction hash (settled ones are
//!    reported as already processed),
//! 2. the most recent pending payment bound to the sender wallet,
//! 3. the most recent pending payment with no bound sender, which the
//!    match then binds. The amount is not consulted here; verification is
//!    the amount gate.
//!
//! Anything else is unmatched and dropped by the caller.

use crate::chain::TransferEvent;
use crate::error::Result;
use crate::payment::store::{Payment, PaymentStatus, PaymentStore};
use tracing::debug;

/// How an observed transfer relates to the payment records.
#[derive(Debug)]
pub enum MatchOutcome {
    /// The transaction already settled a payment. Nothing left to do.
    AlreadyProcessed {
        /// Id of the settled payment.
        payment_id: String,
    },
    /// A pending payment claims this transfer.
    Matched {
        /// The claiming payment.
        payment: Payment,
        /// Whether the match itself bound the sender wallet (unbound
        /// fallback).
        bound_sender: bool,
    },
    /// No payment claims this transfer.
    Unmatched,
}

/// Resolve a transfer to a payment record.
///
/// # Errors
///
/// Returns an error only for storage faults.
pub async fn match_transfer(
    store: &dyn PaymentStore,
    transfer: &TransferEvent,
) -> Result<MatchOutcome> {
    let tx_hash = transfer.transaction_hash.to_lowercase();
    let sender = format!("{:#x}", transfer.from);

    if let Some(payment) = store.find_by_transaction_hash(&tx_hash).await? {
        if payment.status != PaymentStatus::Pending {
            debug!("transfer {tx_hash} already settled payment {}", payment.id);
            return Ok(MatchOutcome::AlreadyProcessed {
                payment_id: payment.id,
            });
        }
        return Ok(MatchOutcome::Matched {
            payment,
            bound_sender: false,
        });
    }

    if let Some(payment) = store.latest_pending_from(&sender).await? {
        store.set_transaction_hash(&payment.id, &tx_hash).await?;
        return Ok(MatchOutcome::Matched {
            payment,
            bound_sender: false,
        });
    }

    if let Some(payment) = store.latest_pending_unbound().await? {
        store.bind_sender(&payment.id, &sender).await?;
        store.set_transaction_hash(&payment.id, &tx_hash).await?;
        debug!(
            "bound sender {sender} to unbound pending payment {}",
            payment.id
        );
        return Ok(MatchOutcome::Matched {
            payment,
            bound_sender: true,
        });
    }

    Ok(MatchOutcome::Unmatched)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::chain::parse_address;
    use crate::payment::store::{MemoryPaymentStore, SettlementUpdate};
    use alloy_primitives::U256;

    const SENDER: &str = "0x00000000000000000000000000000000000000aa";

    fn transfer(tx_hash: &str) -> TransferEvent {
        TransferEvent {
            from: parse_address(SENDER).unwrap(),
            to: parse_address("0x00000000000000000000000000000000000000fe").unwrap(),
            value: U256::from(29_000_000u64),
            transaction_hash: tx_hash.to_string(),
        }
    }

    #[tokio::test]
    async fn test_settled_hash_is_already_processed() {
        let store = MemoryPaymentStore::new();
        let payment = Payment::new("sub-1", 29.0);
        let id = payment.id.clone();
        store.insert(payment).await.unwrap();
        store
            .mark_succeeded_if_pending(
                &id,
                SettlementUpdate {
                    transaction_hash: "0xabc".to_string(),
                    from_address: SENDER.to_string(),
                    to_address: "0x00000000000000000000000000000000000000fe".to_string(),
                    chain_id: 137,
                    block_number: Some(100),
                    amount_usd: 29.0,
                },
            )
            .await
            .unwrap();

        let outcome = match_transfer(&store, &transfer("0xABC")).await.unwrap();
        assert!(matches!(
            outcome,
            MatchOutcome::AlreadyProcessed { payment_id } if payment_id == id
        ));
    }

    #[tokio::test]
    async fn test_matches_bound_sender() {
        let store = MemoryPaymentStore::new();
        let payment = Payment::new("sub-1", 29.0);
        let id = payment.id.clone();
        store.insert(payment).await.unwrap();
        store.bind_sender(&id, SENDER).await.unwrap();

        let outcome = match_transfer(&store, &transfer("0xabc")).await.unwrap();
        match outcome {
            MatchOutcome::Matched {
                payment,
                bound_sender,
            } => {
                assert_eq!(payment.id, id);
                assert!(!bound_sender);
            }
            other => panic!("expected match, got {other:?}"),
        }

        // The hash was attached so a second observation short-circuits.
        let stored = store.get(&id).await.unwrap().expect("payment");
        assert_eq!(stored.transaction_hash.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn test_unbound_fallback_binds_sender() {
        let store = MemoryPaymentStore::new();
        let payment = Payment::new("sub-1", 29.0);
        let id = payment.id.clone();
        store.insert(payment).await.unwrap();

        let outcome = match_transfer(&store, &transfer("0xabc")).await.unwrap();
        assert!(matches!(
            outcome,
            MatchOutcome::Matched { bound_sender: true, .. }
        ));

        let stored = store.get(&id).await.unwrap().expect("payment");
        assert_eq!(stored.from_address.as_deref(), Some(SENDER));
    }

    #[tokio::test]
    async fn test_unbound_fallback_ignores_amount() {
        let store = MemoryPaymentStore::new();
        // The transfer carries 29 units worth; the payment expects 99.
        // Matching still claims it; verification is the amount gate.
        let payment = Payment::new("sub-1", 99.0);
        let id = payment.id.clone();
        store.insert(payment).await.unwrap();

        let outcome = match_transfer(&store, &transfer("0xabc")).await.unwrap();
        assert!(matches!(
            outcome,
            MatchOutcome::Matched { bound_sender: true, .. }
        ));

        let stored = store.get(&id).await.unwrap().expect("payment");
        assert_eq!(stored.transaction_hash.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn test_transfer_from_stranger_is_unmatched() {
        let store = MemoryPaymentStore::new();
        let payment = Payment::new("sub-1", 29.0);
        let id = payment.id.clone();
        store.insert(payment).await.unwrap();
        // The only pending payment is bound to a different wallet.
        store
            .bind_sender(&id, "0x00000000000000000000000000000000000000cc")
            .await
            .unwrap();

        let outcome = match_transfer(&store, &transfer("0xabc")).await.unwrap();
        assert!(matches!(outcome, MatchOutcome::Unmatched));
    }
}
