//! Payment records and their storage seam.
//!
//! Every state transition out of `Pending` goes through the conditional
//! `mark_*_if_pending` operations, so concurrent settlement paths (listener,
//! crawler, interactive verification) cannot double-apply an outcome. A
//! `false` return means another path already settled the payment and the
//! caller must treat its own work as a no-op.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle of a payment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Created, awaiting an on-chain transfer.
    Pending,
    /// Settled by a verified transfer.
    Succeeded,
    /// Verification conclusively rejected the transaction.
    Failed,
    /// Refunded after settlement.
    Refunded,
}

/// One payment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    /// Unique payment id.
    pub id: String,
    /// Subscription this payment funds.
    pub subscription_id: String,
    /// Expected amount in USD.
    pub amount: f64,
    /// Settlement currency.
    pub currency: String,
    /// Current lifecycle state.
    pub status: PaymentStatus,
    /// On-chain transaction hash, once known (lowercase).
    pub transaction_hash: Option<String>,
    /// Paying wallet, once bound (lowercase).
    pub from_address: Option<String>,
    /// Receiving wallet (lowercase).
    pub to_address: Option<String>,
    /// Chain the settlement happened on.
    pub chain_id: Option<u64>,
    /// Block the settlement was mined in.
    pub block_number: Option<u64>,
    /// Free-form settlement context (salt, signature, expiry, errors).
    pub metadata: Map<String, Value>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

impl Payment {
    /// Create a new pending payment for a subscription.
    #[must_use]
    pub fn new(subscription_id: &str, amount: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subscription_id: subscription_id.to_string(),
            amount,
            currency: "USDC".to_string(),
            status: PaymentStatus::Pending,
            transaction_hash: None,
            from_address: None,
            to_address: None,
            chain_id: None,
            block_number: None,
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    /// String metadata value, if present.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Settlement details recorded when a payment succeeds.
#[derive(Debug, Clone)]
pub struct SettlementUpdate {
    /// Hash of the settling transaction (lowercase).
    pub transaction_hash: String,
    /// Paying wallet (lowercase).
    pub from_address: String,
    /// Receiving wallet (lowercase).
    pub to_address: String,
    /// Chain the transfer was observed on.
    pub chain_id: u64,
    /// Block the transfer was mined in.
    pub block_number: Option<u64>,
    /// Amount observed on-chain, in USD.
    pub amount_usd: f64,
}

/// Storage seam for payment records.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Persist a new payment.
    async fn insert(&self, payment: Payment) -> Result<()>;

    /// Fetch a payment by id.
    async fn get(&self, payment_id: &str) -> Result<Option<Payment>>;

    /// Find the payment already holding a transaction hash.
    async fn find_by_transaction_hash(&self, tx_hash: &str) -> Result<Option<Payment>>;

    /// Most recent pending payment bound to a sender wallet.
    async fn latest_pending_from(&self, from_address: &str) -> Result<Option<Payment>>;

    /// Most recent pending payment with no bound sender.
    async fn latest_pending_unbound(&self) -> Result<Option<Payment>>;

    /// Most recent pending payments, newest first, capped at `limit`.
    async fn recent_pending(&self, limit: usize) -> Result<Vec<Payment>>;

    /// All payments for a subscription, newest first.
    async fn by_subscription(&self, subscription_id: &str) -> Result<Vec<Payment>>;

    /// Attach a transaction hash if the payment does not already have one.
    async fn set_transaction_hash(&self, payment_id: &str, tx_hash: &str) -> Result<()>;

    /// Bind the paying wallet to a payment.
    async fn bind_sender(&self, payment_id: &str, from_address: &str) -> Result<()>;

    /// Merge entries into a payment's metadata, overwriting duplicate keys.
    async fn merge_metadata(&self, payment_id: &str, entries: Map<String, Value>) -> Result<()>;

    /// Settle a payment, only if it is still pending. Returns whether the
    /// transition was applied.
    async fn mark_succeeded_if_pending(
        &self,
        payment_id: &str,
        update: SettlementUpdate,
    ) -> Result<bool>;

    /// Fail a payment, only if it is still pending. Returns whether the
    /// transition was applied.
    async fn mark_failed_if_pending(&self, payment_id: &str, reason: &str) -> Result<bool>;
}

/// In-memory [`PaymentStore`].
#[derive(Default)]
pub struct MemoryPaymentStore {
    payments: RwLock<Vec<Payment>>,
}

impl MemoryPaymentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F, T>(&self, payment_id: &str, apply: F) -> Result<T>
    where
        F: FnOnce(&mut Payment) -> T,
    {
        let mut payments = self.payments.write();
        let payment = payments
            .iter_mut()
            .find(|p| p.id == payment_id)
            .ok_or_else(|| Error::NotFound(format!("payment not found: {payment_id}")))?;
        Ok(apply(payment))
    }
}

#[async_trait]
impl PaymentStore for MemoryPaymentStore {
    async fn insert(&self, payment: Payment) -> Result<()> {
        self.payments.write().push(payment);
        Ok(())
    }

    async fn get(&self, payment_id: &str) -> Result<Option<Payment>> {
        Ok(self
            .payments
            .read()
            .iter()
            .find(|p| p.id == payment_id)
            .cloned())
    }

    async fn find_by_transaction_hash(&self, tx_hash: &str) -> Result<Option<Payment>> {
        let needle = tx_hash.to_lowercase();
        Ok(self
            .payments
            .read()
            .iter()
            .find(|p| p.transaction_hash.as_deref() == Some(needle.as_str()))
            .cloned())
    }

    async fn latest_pending_from(&self, from_address: &str) -> Result<Option<Payment>> {
        let needle = from_address.to_lowercase();
        Ok(self
            .payments
            .read()
            .iter()
            .filter(|p| {
                p.status == PaymentStatus::Pending
                    && p.from_address.as_deref() == Some(needle.as_str())
            })
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn latest_pending_unbound(&self) -> Result<Option<Payment>> {
        Ok(self
            .payments
            .read()
            .iter()
            .filter(|p| p.status == PaymentStatus::Pending && p.from_address.is_none())
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn recent_pending(&self, limit: usize) -> Result<Vec<Payment>> {
        let mut pending: Vec<Payment> = self
            .payments
            .read()
            .iter()
            .filter(|p| p.status == PaymentStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn by_subscription(&self, subscription_id: &str) -> Result<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .payments
            .read()
            .iter()
            .filter(|p| p.subscription_id == subscription_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    async fn set_transaction_hash(&self, payment_id: &str, tx_hash: &str) -> Result<()> {
        let hash = tx_hash.to_lowercase();
        self.update(payment_id, |payment| {
            if payment.transaction_hash.is_none() {
                payment.transaction_hash = Some(hash);
            }
        })
    }

    async fn bind_sender(&self, payment_id: &str, from_address: &str) -> Result<()> {
        let address = from_address.to_lowercase();
        self.update(payment_id, |payment| {
            payment.from_address = Some(address);
        })
    }

    async fn merge_metadata(&self, payment_id: &str, entries: Map<String, Value>) -> Result<()> {
        self.update(payment_id, |payment| {
            payment.metadata.extend(entries);
        })
    }

    async fn mark_succeeded_if_pending(
        &self,
        payment_id: &str,
        update: SettlementUpdate,
    ) -> Result<bool> {
        self.update(payment_id, |payment| {
            if payment.status != PaymentStatus::Pending {
                return false;
            }
            payment.status = PaymentStatus::Succeeded;
            payment.transaction_hash = Some(update.transaction_hash.to_lowercase());
            payment.from_address = Some(update.from_address.to_lowercase());
            payment.to_address = Some(update.to_address.to_lowercase());
            payment.chain_id = Some(update.chain_id);
            payment.block_number = update.block_number;
            payment.metadata.insert(
                "settled_amount_usd".to_string(),
                Value::from(update.amount_usd),
            );
            true
        })
    }

    async fn mark_failed_if_pending(&self, payment_id: &str, reason: &str) -> Result<bool> {
        self.update(payment_id, |payment| {
            if payment.status != PaymentStatus::Pending {
                return false;
            }
            payment.status = PaymentStatus::Failed;
            payment
                .metadata
                .insert("error".to_string(), Value::from(reason));
            true
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn settlement(tx_hash: &str) -> SettlementUpdate {
        SettlementUpdate {
            transaction_hash: tx_hash.to_string(),
            from_address: "0xAAAA000000000000000000000000000000000001".to_string(),
            to_address: "0xBBBB000000000000000000000000000000000002".to_string(),
            chain_id: 137,
            block_number: Some(100),
            amount_usd: 29.05,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryPaymentStore::new();
        let payment = Payment::new("sub-1", 29.0);
        let id = payment.id.clone();
        store.insert(payment).await.unwrap();

        let found = store.get(&id).await.unwrap().expect("payment");
        assert_eq!(found.status, PaymentStatus::Pending);
        assert_eq!(found.currency, "USDC");
    }

    #[tokio::test]
    async fn test_mark_succeeded_only_once() {
        let store = MemoryPaymentStore::new();
        let payment = Payment::new("sub-1", 29.0);
        let id = payment.id.clone();
        store.insert(payment).await.unwrap();

        assert!(store
            .mark_succeeded_if_pending(&id, settlement("0xABC"))
            .await
            .unwrap());
        assert!(!store
            .mark_succeeded_if_pending(&id, settlement("0xDEF"))
            .await
            .unwrap());

        let found = store.get(&id).await.unwrap().expect("payment");
        assert_eq!(found.status, PaymentStatus::Succeeded);
        assert_eq!(found.transaction_hash.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn test_mark_failed_skips_settled_payment() {
        let store = MemoryPaymentStore::new();
        let payment = Payment::new("sub-1", 29.0);
        let id = payment.id.clone();
        store.insert(payment).await.unwrap();

        assert!(store
            .mark_succeeded_if_pending(&id, settlement("0xABC"))
            .await
            .unwrap());
        assert!(!store.mark_failed_if_pending(&id, "late failure").await.unwrap());

        let found = store.get(&id).await.unwrap().expect("payment");
        assert_eq!(found.status, PaymentStatus::Succeeded);
        assert!(found.metadata.get("error").is_none());
    }

    #[tokio::test]
    async fn test_set_transaction_hash_never_overwrites() {
        let store = MemoryPaymentStore::new();
        let payment = Payment::new("sub-1", 29.0);
        let id = payment.id.clone();
        store.insert(payment).await.unwrap();

        store.set_transaction_hash(&id, "0xAAA").await.unwrap();
        store.set_transaction_hash(&id, "0xBBB").await.unwrap();

        let found = store.get(&id).await.unwrap().expect("payment");
        assert_eq!(found.transaction_hash.as_deref(), Some("0xaaa"));
    }

    #[tokio::test]
    async fn test_lookup_by_transaction_hash_is_case_insensitive() {
        let store = MemoryPaymentStore::new();
        let payment = Payment::new("sub-1", 29.0);
        let id = payment.id.clone();
        store.insert(payment).await.unwrap();
        store.set_transaction_hash(&id, "0xAbCd").await.unwrap();

        let found = store
            .find_by_transaction_hash("0xABCD")
            .await
            .unwrap()
            .expect("payment");
        assert_eq!(found.id, id);
    }

    #[tokio::test]
    async fn test_latest_pending_queries() {
        let store = MemoryPaymentStore::new();

        let mut older = Payment::new("sub-1", 29.0);
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        let older_id = older.id.clone();
        store.insert(older).await.unwrap();

        // A different amount does not disqualify the unbound candidate.
        let newer = Payment::new("sub-2", 99.0);
        let newer_id = newer.id.clone();
        store.insert(newer).await.unwrap();

        let unbound = store
            .latest_pending_unbound()
            .await
            .unwrap()
            .expect("payment");
        assert_eq!(unbound.id, newer_id);

        store
            .bind_sender(&older_id, "0xAAAA000000000000000000000000000000000001")
            .await
            .unwrap();
        let bound = store
            .latest_pending_from("0xaaaa000000000000000000000000000000000001")
            .await
            .unwrap()
            .expect("payment");
        assert_eq!(bound.id, older_id);
    }

    #[tokio::test]
    async fn test_recent_pending_respects_limit() {
        let store = MemoryPaymentStore::new();
        for i in 0..10 {
            let mut payment = Payment::new("sub-1", 29.0);
            payment.created_at = Utc::now() - chrono::Duration::seconds(i);
            store.insert(payment).await.unwrap();
        }
        let pending = store.recent_pending(5).await.unwrap();
        assert_eq!(pending.len(), 5);
        assert!(pending.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }
}
