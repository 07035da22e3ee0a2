//! Payment orchestration.
//!
//! `PaymentService` is the single entry point for every settlement path:
//! interactive verification, the live transfer listener, and the
//! reconciliation crawler all converge on [`PaymentService::settle`], whose
//! conditional store transition guarantees a payment activates its
//! subscription exactly once.

use crate::chain::{units_to_usd, ChainRegistry, TransferEvent};
use crate::error::{Error, Result};
use crate::payment::intent::{IntentRegistry, PaymentIntent};
use crate::payment::matcher::{match_transfer, MatchOutcome};
use crate::payment::store::{Payment, PaymentStatus, PaymentStore, SettlementUpdate};
use crate::payment::verifier::{PaymentVerification, TransactionVerifier};
use crate::subscription::{Plan, Subscription, SubscriptionStore};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a caller needs to complete a payment: the canonical message to
/// sign and the salt that ties everything back together.
#[derive(Debug, Clone)]
pub struct PaymentIntentResponse {
    /// Payment record created for this intent.
    pub payment_id: String,
    /// Subscription being paid.
    pub subscription_id: String,
    /// Amount due, in USD.
    pub amount: f64,
    /// One-time salt identifying the intent.
    pub salt: String,
    /// Message the wallet must sign.
    pub message: String,
    /// Instant after which the intent is no longer honored.
    pub expires_at: DateTime<Utc>,
}

/// Outcome of verifying a settlement transaction.
#[derive(Debug)]
pub enum VerifyOutcome {
    /// Another path already settled this payment. Nothing was changed.
    AlreadyProcessed,
    /// The payment settled and its subscription is now active.
    Activated {
        /// On-chain details of the settlement.
        verification: PaymentVerification,
    },
}

/// Orchestrates the payment lifecycle from intent to activation.
pub struct PaymentService {
    intents: IntentRegistry,
    payments: Arc<dyn PaymentStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    verifier: TransactionVerifier,
    registry: ChainRegistry,
    default_chain_id: u64,
}

impl PaymentService {
    /// Wire up the service.
    #[must_use]
    pub fn new(
        intents: IntentRegistry,
        payments: Arc<dyn PaymentStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        verifier: TransactionVerifier,
        registry: ChainRegistry,
        default_chain_id: u64,
    ) -> Self {
        Self {
            intents,
            payments,
            subscriptions,
            verifier,
            registry,
            default_chain_id,
        }
    }

    /// The payment store behind this service.
    #[must_use]
    pub fn payments(&self) -> &Arc<dyn PaymentStore> {
        &self.payments
    }

    /// The subscription store behind this service.
    #[must_use]
    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionStore> {
        &self.subscriptions
    }

    /// Create a payment intent for a subscription.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for a non-positive amount and `NotFound`
    /// for an unknown subscription.
    pub async fn create_payment_intent(
        &self,
        subscription_id: &str,
        user_id: &str,
        amount: f64,
    ) -> Result<PaymentIntentResponse> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(Error::InvalidRequest(format!(
                "payment amount must be positive, got {amount}"
            )));
        }
        let subscription = self.subscription(subscription_id).await?;

        let payment = Payment::new(&subscription.id, amount);
        let payment_id = payment.id.clone();
        self.payments.insert(payment).await?;

        let intent = self
            .intents
            .create(amount, user_id, &subscription.id, &payment_id);

        let mut metadata = Map::new();
        metadata.insert("salt".to_string(), Value::from(intent.salt.clone()));
        metadata.insert("user_id".to_string(), Value::from(user_id));
        metadata.insert(
            "expires_at".to_string(),
            Value::from(intent.expires_at.to_rfc3339()),
        );
        self.payments.merge_metadata(&payment_id, metadata).await?;

        info!(
            "created payment intent for subscription {subscription_id}: {amount} USD, payment {payment_id}"
        );

        Ok(PaymentIntentResponse {
            payment_id,
            subscription_id: subscription.id,
            amount,
            message: intent.message(),
            salt: intent.salt,
            expires_at: intent.expires_at,
        })
    }

    /// Bind a wallet to a payment by verifying its signature over the
    /// intent message.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or expired salts, `InvalidRequest`
    /// for malformed input, and `InvalidSignature` on a signer mismatch.
    pub async fn submit_signature(
        &self,
        salt: &str,
        wallet_address: &str,
        signature: &str,
    ) -> Result<PaymentIntent> {
        let intent = self
            .intents
            .verify_signature(salt, wallet_address, signature)?;

        self.payments
            .bind_sender(&intent.payment_id, wallet_address)
            .await?;

        let mut metadata = Map::new();
        metadata.insert("signature".to_string(), Value::from(signature));
        metadata.insert(
            "wallet_address".to_string(),
            Value::from(wallet_address.to_lowercase()),
        );
        self.payments
            .merge_metadata(&intent.payment_id, metadata)
            .await?;

        info!(
            "wallet {} bound to payment {}",
            wallet_address.to_lowercase(),
            intent.payment_id
        );
        Ok(intent)
    }

    /// Verify a payment's settlement transaction and activate its
    /// subscription.
    ///
    /// Uses the transaction hash already attached to the payment when
    /// present; `tx_hash` fills in otherwise. A payment that already
    /// settled is a no-op.
    ///
    /// # Errors
    ///
    /// `Verification` failures mark the payment failed before propagating.
    /// `Provider` faults leave the payment pending for a later retry.
    pub async fn verify_payment_transaction(
        &self,
        payment_id: &str,
        tx_hash: Option<&str>,
        chain_id: Option<u64>,
    ) -> Result<VerifyOutcome> {
        let payment = self
            .payments
            .get(payment_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("payment not found: {payment_id}")))?;

        if payment.status == PaymentStatus::Succeeded {
            return Ok(VerifyOutcome::AlreadyProcessed);
        }

        let hash = payment
            .transaction_hash
            .clone()
            .or_else(|| tx_hash.map(str::to_lowercase))
            .ok_or_else(|| {
                Error::InvalidRequest(format!("payment {payment_id} has no transaction hash"))
            })?;
        let chain_id = chain_id
            .or(payment.chain_id)
            .unwrap_or(self.default_chain_id);

        match self.verifier.verify(&hash, payment.amount, chain_id).await {
            Ok(verification) => self.settle(&payment, verification).await,
            Err(Error::Verification(failure)) => {
                let applied = self
                    .payments
                    .mark_failed_if_pending(payment_id, &failure.to_string())
                    .await?;
                if applied {
                    warn!("payment {payment_id} failed verification: {failure}");
                    // Only a failed plan-change payment cancels the queued
                    // upgrade.
                    if payment.metadata.contains_key("plan") {
                        self.drop_pending_plan(&payment.subscription_id).await?;
                    }
                } else {
                    debug!("payment {payment_id} settled elsewhere before failure applied");
                }
                Err(Error::Verification(failure))
            }
            Err(e) => Err(e),
        }
    }

    /// Apply a verified settlement: flip the payment to succeeded, consume
    /// its intent, and activate the subscription.
    async fn settle(
        &self,
        payment: &Payment,
        verification: PaymentVerification,
    ) -> Result<VerifyOutcome> {
        let update = SettlementUpdate {
            transaction_hash: verification.transaction_hash.clone(),
            from_address: verification.from.clone(),
            to_address: verification.to.clone(),
            chain_id: verification.chain_id,
            block_number: verification.block_number,
            amount_usd: verification.amount_usd,
        };

        let applied = self
            .payments
            .mark_succeeded_if_pending(&payment.id, update)
            .await?;
        if !applied {
            debug!("payment {} already settled, skipping", payment.id);
            return Ok(VerifyOutcome::AlreadyProcessed);
        }

        if let Some(salt) = payment.metadata_str("salt") {
            self.intents.consume(salt);
        }

        let mut subscription = self.subscription(&payment.subscription_id).await?;
        subscription.activate(Some(&verification.from));
        let plan = subscription.plan;
        self.subscriptions.update(subscription).await?;

        info!(
            "payment {} settled by {}: subscription {} active on plan {plan}",
            payment.id, verification.transaction_hash, payment.subscription_id
        );

        Ok(VerifyOutcome::Activated { verification })
    }

    /// Handle a transfer observed on-chain by the listener.
    ///
    /// Unmatched transfers are logged and dropped; already-settled ones
    /// are no-ops.
    ///
    /// # Errors
    ///
    /// Returns storage and verification errors from the settlement path.
    pub async fn process_transfer(&self, transfer: TransferEvent, chain_id: u64) -> Result<()> {
        let decimals = self.registry.get(chain_id)?.decimals;
        let amount_usd = units_to_usd(transfer.value, decimals);

        match match_transfer(self.payments.as_ref(), &transfer).await? {
            MatchOutcome::AlreadyProcessed { payment_id } => {
                debug!(
                    "transfer {} already settled payment {payment_id}",
                    transfer.transaction_hash
                );
                Ok(())
            }
            MatchOutcome::Matched { payment, .. } => {
                match self
                    .verify_payment_transaction(
                        &payment.id,
                        Some(&transfer.transaction_hash),
                        Some(chain_id),
                    )
                    .await
                {
                    Ok(_) | Err(Error::Verification(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            MatchOutcome::Unmatched => {
                debug!(
                    "no payment claims transfer {} for {amount_usd} USD",
                    transfer.transaction_hash
                );
                Ok(())
            }
        }
    }

    /// Queue a plan change and create the payment intent that, once
    /// settled, promotes it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` when the target is the free plan or the
    /// plan already in force, and `NotFound` for an unknown subscription.
    pub async fn request_plan_change(
        &self,
        subscription_id: &str,
        new_plan: Plan,
    ) -> Result<PaymentIntentResponse> {
        if new_plan == Plan::Free {
            return Err(Error::InvalidRequest(
                "cannot change to the free plan through a payment".to_string(),
            ));
        }

        let mut subscription = self.subscription(subscription_id).await?;
        if subscription.plan == new_plan {
            return Err(Error::InvalidRequest(format!(
                "subscription is already on plan {new_plan}"
            )));
        }

        subscription.pending_plan = Some(new_plan);
        let amount = new_plan.price_for(subscription.billing_cycle);
        let owner_id = subscription.owner.id().to_string();
        self.subscriptions.update(subscription).await?;

        let response = self
            .create_payment_intent(subscription_id, &owner_id, amount)
            .await?;

        let mut metadata = Map::new();
        metadata.insert("plan".to_string(), Value::from(new_plan.to_string()));
        self.payments
            .merge_metadata(&response.payment_id, metadata)
            .await?;

        info!("subscription {subscription_id} queued plan change to {new_plan}");
        Ok(response)
    }

    /// All payments for a subscription, newest first.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn payment_history(&self, subscription_id: &str) -> Result<Vec<Payment>> {
        self.payments.by_subscription(subscription_id).await
    }

    /// Drop expired intents, returning how many were removed.
    pub fn purge_expired_intents(&self) -> usize {
        self.intents.purge_expired()
    }

    async fn subscription(&self, subscription_id: &str) -> Result<Subscription> {
        self.subscriptions
            .get(subscription_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("subscription not found: {subscription_id}")))
    }

    async fn drop_pending_plan(&self, subscription_id: &str) -> Result<()> {
        if let Some(mut subscription) = self.subscriptions.get(subscription_id).await? {
            if subscription.pending_plan.is_some() {
                subscription.clear_pending_plan();
                self.subscriptions.update(subscription).await?;
                debug!("cleared pending plan on subscription {subscription_id}");
            }
        }
        Ok(())
    }
}
