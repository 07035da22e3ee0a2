//! Payment intents and wallet-signature binding.
//!
//! An intent freezes the amount, target subscription, and a one-time salt
//! before any transaction is broadcast. The wallet proves control of its
//! address by signing the intent's canonical message; a later on-chain
//! transfer is then matched back to the intent through the payment record.

use crate::chain::parse_address;
use crate::error::{Error, Result};
use alloy_primitives::{Address, Signature};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;

/// A pending payment intent awaiting signature and settlement.
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    /// One-time random salt identifying this intent.
    pub salt: String,
    /// Amount the payer committed to, in USD.
    pub amount: f64,
    /// Account the payment is for.
    pub user_id: String,
    /// Subscription being paid.
    pub subscription_id: String,
    /// Payment record created alongside this intent.
    pub payment_id: String,
    /// Instant after which the intent is no longer honored.
    pub expires_at: DateTime<Utc>,
}

impl PaymentIntent {
    /// The canonical message the wallet must sign for this intent.
    #[must_use]
    pub fn message(&self) -> String {
        build_message(self.amount, &self.subscription_id, &self.user_id, &self.salt)
    }

    /// Whether the intent has passed its expiry instant.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// In-memory registry of open payment intents, keyed by salt.
///
/// Expired entries are evicted lazily on lookup and in bulk by
/// [`IntentRegistry::purge_expired`].
pub struct IntentRegistry {
    intents: RwLock<HashMap<String, PaymentIntent>>,
    ttl: Duration,
}

impl IntentRegistry {
    /// Create a registry whose intents live for `ttl_secs` seconds.
    #[must_use]
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            intents: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(30 * 60)),
        }
    }

    /// Register a new intent and return it (salt and message included).
    pub fn create(
        &self,
        amount: f64,
        user_id: &str,
        subscription_id: &str,
        payment_id: &str,
    ) -> PaymentIntent {
        let intent = PaymentIntent {
            salt: generate_salt(),
            amount,
            user_id: user_id.to_string(),
            subscription_id: subscription_id.to_string(),
            payment_id: payment_id.to_string(),
            expires_at: Utc::now() + self.ttl,
        };
        self.intents
            .write()
            .insert(intent.salt.clone(), intent.clone());
        intent
    }

    /// Look up a live intent by salt, evicting it if expired.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or expired salts.
    pub fn get(&self, salt: &str) -> Result<PaymentIntent> {
        let intents = self.intents.read();
        match intents.get(salt) {
            Some(intent) if !intent.is_expired() => Ok(intent.clone()),
            Some(_) => {
                drop(intents);
                self.intents.write().remove(salt);
                Err(Error::NotFound(format!("payment intent expired: {salt}")))
            }
            None => Err(Error::NotFound(format!("unknown payment intent: {salt}"))),
        }
    }

    /// Verify a wallet's EIP-191 signature over the intent's canonical
    /// message. The intent stays registered; settlement consumes it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or expired salts, `InvalidRequest`
    /// for a malformed address or signature encoding, and
    /// `InvalidSignature` when the recovered signer differs from the
    /// claimed wallet.
    pub fn verify_signature(
        &self,
        salt: &str,
        wallet_address: &str,
        signature: &str,
    ) -> Result<PaymentIntent> {
        let intent = self.get(salt)?;
        let claimed = parse_address(wallet_address)?;
        let recovered = recover_signer(&intent.message(), signature)?;

        if recovered != claimed {
            return Err(Error::InvalidSignature(format!(
                "signature was produced by {recovered}, not {claimed}"
            )));
        }

        Ok(intent)
    }

    /// Remove an intent once its payment has settled.
    pub fn consume(&self, salt: &str) -> Option<PaymentIntent> {
        self.intents.write().remove(salt)
    }

    /// Drop all expired intents, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut intents = self.intents.write();
        let before = intents.len();
        intents.retain(|_, intent| intent.expires_at > now);
        before - intents.len()
    }

    /// Number of live and not-yet-purged intents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.intents.read().len()
    }

    /// Whether the registry holds no intents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intents.read().is_empty()
    }
}

/// Build the canonical intent message. Every field that parameterizes the
/// payment appears in the signed text, so a signature cannot be replayed
/// for a different amount or subscription.
#[must_use]
pub fn build_message(amount: f64, subscription_id: &str, user_id: &str, salt: &str) -> String {
    format!(
        "Pay {amount:.2} USDC for subscription {subscription_id}\nUser: {user_id}\nSalt: {salt}"
    )
}

/// Recover the EIP-191 signer of `message` from a 65-byte hex signature.
///
/// # Errors
///
/// Returns `InvalidRequest` for malformed hex and `InvalidSignature` when
/// recovery itself fails.
pub fn recover_signer(message: &str, signature: &str) -> Result<Address> {
    let bytes = hex::decode(signature.trim_start_matches("0x"))
        .map_err(|e| Error::InvalidRequest(format!("signature is not valid hex: {e}")))?;

    let signature = Signature::from_raw(&bytes)
        .map_err(|e| Error::InvalidRequest(format!("malformed signature: {e}")))?;

    signature
        .recover_address_from_msg(message)
        .map_err(|e| Error::InvalidSignature(format!("signature recovery failed: {e}")))
}

fn generate_salt() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
