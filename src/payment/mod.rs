//! Payment pipeline: intents, storage, verification, matching, and the
//! background workers that settle payments observed on-chain.

pub mod crawler;
pub mod intent;
pub mod listener;
pub mod matcher;
pub mod service;
pub mod store;
pub mod verifier;

pub use crawler::{CrawlStats, ReconciliationCrawler};
pub use intent::{IntentRegistry, PaymentIntent};
pub use listener::{ListenerStatus, TransferListener};
pub use matcher::{match_transfer, MatchOutcome};
pub use service::{PaymentIntentResponse, PaymentService, VerifyOutcome};
pub use store::{
    MemoryPaymentStore, Payment, PaymentStatus, PaymentStore, SettlementUpdate,
};
pub use verifier::{PaymentVerification, TransactionVerifier, AMOUNT_TOLERANCE};
