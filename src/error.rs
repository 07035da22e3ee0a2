//! Error types for paywatch.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in paywatch.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed caller input: bad wallet address, unsupported chain,
    /// non-positive amount. Surfaced immediately, never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown or expired salt, missing payment or subscription.
    #[error("not found: {0}")]
    NotFound(String),

    /// Recovered signer does not match the claimed wallet address.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// On-chain verification rejected the transaction. The sub-case is
    /// recorded on the payment and surfaced to interactive callers; the
    /// crawler swallows and counts it.
    #[error("verification failed: {0}")]
    Verification(#[from] VerificationFailure),

    /// Chain RPC transport or decode failure. Transient; does not fail the
    /// payment.
    #[error("provider error: {0}")]
    Provider(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The distinguishable ways on-chain verification can reject a transaction.
///
/// Each variant carries enough structured detail to be stored verbatim in
/// `Payment.metadata["error"]`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerificationFailure {
    /// Transaction not found or not yet confirmed on-chain.
    #[error("transaction not found or not yet confirmed")]
    NotConfirmed,

    /// The transaction was mined but reverted.
    #[error("transaction failed on-chain")]
    TransactionFailed,

    /// No transfer event log was found at the configured token contract.
    #[error("no token transfer found in transaction")]
    NoTransferLog,

    /// The transfer recipient is not the configured receiver wallet.
    #[error("payment sent to wrong address: expected {expected}, got {observed}")]
    WrongRecipient {
        /// The configured receiver address (lowercase hex).
        expected: String,
        /// The recipient observed in the transfer log (lowercase hex).
        observed: String,
    },

    /// The transferred amount is outside the accepted tolerance band.
    #[error("amount mismatch: expected {expected} USD, received {observed} USD")]
    AmountMismatch {
        /// The amount the payment intent was created for.
        expected: f64,
        /// The amount observed in the transfer log, in USD.
        observed: f64,
    },
}
