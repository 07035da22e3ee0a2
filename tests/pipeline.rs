//! End-to-end pipeline tests: intent, signature, on-chain settlement,
//! subscription activation, and reconciliation.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use alloy_primitives::U256;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use chrono::Months;
use parking_lot::RwLock;
use paywatch::chain::rpc::{
    ChainClient, LogEntry, LogFilter, RpcBlock, RpcTransaction, TransactionReceipt,
};
use paywatch::chain::{
    address_topic, parse_address, usd_to_units, ChainRegistry, TransferEvent,
    TRANSFER_EVENT_TOPIC,
};
use paywatch::config::ChainConfig;
use paywatch::payment::store::{MemoryPaymentStore, PaymentStore};
use paywatch::payment::{
    IntentRegistry, PaymentService, ReconciliationCrawler, TransactionVerifier, TransferListener,
    VerifyOutcome,
};
use paywatch::subscription::{
    BillingCycle, MemorySubscriptionStore, Owner, Subscription, SubscriptionStore,
};
use paywatch::{Error, PaymentStatus, SubscriptionStatus, VerificationFailure};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const RECEIVER: &str = "0x00000000000000000000000000000000000000fe";
const POLYGON_USDC: &str = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174";

/// Scripted chain backend shared by all settlement paths.
#[derive(Default)]
struct MockChain {
    head: RwLock<u64>,
    logs: RwLock<Vec<LogEntry>>,
    receipts: RwLock<HashMap<String, TransactionReceipt>>,
    down: AtomicBool,
}

impl MockChain {
    fn seed_transfer(&self, from: &str, amount_usd: f64, tx_hash: &str) {
        let log = transfer_log(from, RECEIVER, amount_usd, tx_hash);
        self.receipts.write().insert(
            tx_hash.to_lowercase(),
            TransactionReceipt {
                transaction_hash: tx_hash.to_string(),
                status: Some("0x1".to_string()),
                block_number: Some("0x64".to_string()),
                logs: vec![log.clone()],
            },
        );
        self.logs.write().push(log);
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> paywatch::Result<u64> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Provider("provider down".to_string()));
        }
        Ok(*self.head.read())
    }

    async fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> paywatch::Result<Option<TransactionReceipt>> {
        Ok(self.receipts.read().get(&tx_hash.to_lowercase()).cloned())
    }

    async fn transaction_by_hash(&self, _tx_hash: &str) -> paywatch::Result<Option<RpcTransaction>> {
        Ok(None)
    }

    async fn block_by_number(&self, _number: u64) -> paywatch::Result<Option<RpcBlock>> {
        Ok(Some(RpcBlock {
            number: Some("0x64".to_string()),
            timestamp: Some("0x65a1c2b0".to_string()),
        }))
    }

    async fn logs(&self, _filter: &LogFilter) -> paywatch::Result<Vec<LogEntry>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Provider("provider down".to_string()));
        }
        Ok(self.logs.read().clone())
    }
}

fn transfer_log(from: &str, to: &str, amount_usd: f64, tx_hash: &str) -> LogEntry {
    let from = parse_address(from).unwrap();
    let to = parse_address(to).unwrap();
    LogEntry {
        address: POLYGON_USDC.to_string(),
        topics: vec![
            format!("{TRANSFER_EVENT_TOPIC}"),
            format!("{}", address_topic(from)),
            format!("{}", address_topic(to)),
        ],
        data: format!("0x{:064x}", usd_to_units(amount_usd, 6)),
        transaction_hash: Some(tx_hash.to_string()),
        block_number: Some("0x64".to_string()),
    }
}

struct Pipeline {
    service: Arc<PaymentService>,
    chain: Arc<MockChain>,
    payments: Arc<MemoryPaymentStore>,
    subscriptions: Arc<MemorySubscriptionStore>,
    registry: ChainRegistry,
    subscription_id: String,
}

async fn pipeline() -> Pipeline {
    let chain = Arc::new(MockChain::default());
    let registry = ChainRegistry::from_config(&[ChainConfig {
        chain_id: 137,
        name: None,
        rpc_url: "http://localhost:8545".to_string(),
        token_contract: None,
        decimals: None,
    }])
    .unwrap();

    let mut clients: HashMap<u64, Arc<dyn ChainClient>> = HashMap::new();
    clients.insert(137, chain.clone());
    let verifier = TransactionVerifier::new(
        clients,
        registry.clone(),
        parse_address(RECEIVER).unwrap(),
    );

    let payments = Arc::new(MemoryPaymentStore::new());
    let subscriptions = Arc::new(MemorySubscriptionStore::new());
    let subscription = Subscription::new(Owner::User("user-1".to_string()), BillingCycle::Monthly);
    let subscription_id = subscription.id.clone();
    subscriptions.insert(subscription).await.unwrap();

    let service = Arc::new(PaymentService::new(
        IntentRegistry::new(30 * 60),
        payments.clone(),
        subscriptions.clone(),
        verifier,
        registry.clone(),
        137,
    ));

    Pipeline {
        service,
        chain,
        payments,
        subscriptions,
        registry,
        subscription_id,
    }
}

fn listener_for(p: &Pipeline) -> TransferListener {
    let spec = p.registry.get(137).unwrap().clone();
    TransferListener::new(
        Arc::clone(&p.service),
        p.chain.clone(),
        &spec,
        parse_address(RECEIVER).unwrap(),
        Duration::from_millis(10),
        Duration::from_millis(100),
        1000,
    )
}

#[tokio::test]
async fn intent_signature_and_listener_settlement() {
    let p = pipeline().await;
    let wallet = PrivateKeySigner::random();
    let wallet_address = format!("{}", wallet.address());

    // Intent for the starter plan price.
    let intent = p
        .service
        .create_payment_intent(&p.subscription_id, "user-1", 29.0)
        .await
        .unwrap();
    assert!(intent.message.contains("29.00 USDC"));

    // The wallet proves itself by signing the intent message.
    let signature = wallet.sign_message_sync(intent.message.as_bytes()).unwrap();
    p.service
        .submit_signature(&intent.salt, &wallet_address, &hex::encode(signature.as_bytes()))
        .await
        .unwrap();

    // A slightly overpaid transfer lands on chain and the listener sees it.
    *p.chain.head.write() = 100;
    let listener = listener_for(&p);
    listener.start().await;
    assert!(listener.is_listening());

    p.chain.seed_transfer(&wallet_address, 29.05, "0xcafe");
    *p.chain.head.write() = 101;
    tokio::time::sleep(Duration::from_millis(200)).await;
    listener.stop();

    let payment = p.payments.get(&intent.payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    assert_eq!(payment.transaction_hash.as_deref(), Some("0xcafe"));
    assert_eq!(payment.chain_id, Some(137));
    assert_eq!(
        payment.from_address.as_deref(),
        Some(wallet_address.to_lowercase().as_str())
    );

    let subscription = p
        .subscriptions
        .get(&p.subscription_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(
        subscription.wallet_address.as_deref(),
        Some(wallet_address.to_lowercase().as_str())
    );
    let start = subscription.current_period_start.unwrap();
    let end = subscription.current_period_end.unwrap();
    assert_eq!(end, start.checked_add_months(Months::new(1)).unwrap());
}

#[tokio::test]
async fn settlement_is_idempotent_across_paths() {
    let p = pipeline().await;
    let wallet = PrivateKeySigner::random();
    let wallet_address = format!("{}", wallet.address());

    let intent = p
        .service
        .create_payment_intent(&p.subscription_id, "user-1", 29.0)
        .await
        .unwrap();
    p.chain.seed_transfer(&wallet_address, 29.0, "0xcafe");

    // Interactive verification settles first.
    let outcome = p
        .service
        .verify_payment_transaction(&intent.payment_id, Some("0xcafe"), Some(137))
        .await
        .unwrap();
    assert!(matches!(outcome, VerifyOutcome::Activated { .. }));

    // A second interactive attempt is a no-op.
    let outcome = p
        .service
        .verify_payment_transaction(&intent.payment_id, Some("0xcafe"), Some(137))
        .await
        .unwrap();
    assert!(matches!(outcome, VerifyOutcome::AlreadyProcessed));

    // The listener path observing the same transfer is also a no-op.
    let transfer = TransferEvent {
        from: wallet.address(),
        to: parse_address(RECEIVER).unwrap(),
        value: U256::from(29_000_000u64),
        transaction_hash: "0xcafe".to_string(),
    };
    p.service.process_transfer(transfer, 137).await.unwrap();

    let history = p.service.payment_history(&p.subscription_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PaymentStatus::Succeeded);
}

#[tokio::test]
async fn tolerance_boundary_on_interactive_verification() {
    let p = pipeline().await;
    let wallet = PrivateKeySigner::random();
    let wallet_address = format!("{}", wallet.address());

    // 99.00 against an expected 100.00 sits exactly on the 1% line.
    let intent = p
        .service
        .create_payment_intent(&p.subscription_id, "user-1", 100.0)
        .await
        .unwrap();
    p.chain.seed_transfer(&wallet_address, 99.0, "0xaaa1");
    let outcome = p
        .service
        .verify_payment_transaction(&intent.payment_id, Some("0xaaa1"), Some(137))
        .await
        .unwrap();
    assert!(matches!(outcome, VerifyOutcome::Activated { .. }));

    // 98.99 is under it and conclusively fails the payment.
    let intent = p
        .service
        .create_payment_intent(&p.subscription_id, "user-1", 100.0)
        .await
        .unwrap();
    p.chain.seed_transfer(&wallet_address, 98.99, "0xaaa2");
    let err = p
        .service
        .verify_payment_transaction(&intent.payment_id, Some("0xaaa2"), Some(137))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Verification(VerificationFailure::AmountMismatch { .. })
    ));

    let payment = p.payments.get(&intent.payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert!(payment.metadata.get("error").is_some());

    // Overpaying past the band is rejected the same way.
    let intent = p
        .service
        .create_payment_intent(&p.subscription_id, "user-1", 100.0)
        .await
        .unwrap();
    p.chain.seed_transfer(&wallet_address, 105.0, "0xaaa3");
    let err = p
        .service
        .verify_payment_transaction(&intent.payment_id, Some("0xaaa3"), Some(137))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Verification(VerificationFailure::AmountMismatch { .. })
    ));
}

fn signature_metadata() -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert(
        "signature".to_string(),
        Value::from(format!("0x{}", "11".repeat(65))),
    );
    metadata
}

#[tokio::test]
async fn crawler_examines_at_most_batch_size() {
    let p = pipeline().await;
    for i in 0..10 {
        let intent = p
            .service
            .create_payment_intent(&p.subscription_id, "user-1", 29.0)
            .await
            .unwrap();
        p.payments
            .set_transaction_hash(&intent.payment_id, &format!("0xdead{i:02x}"))
            .await
            .unwrap();
        p.payments
            .merge_metadata(&intent.payment_id, signature_metadata())
            .await
            .unwrap();
    }

    let crawler = ReconciliationCrawler::new(Arc::clone(&p.service), Duration::from_secs(120), 5);
    let stats = crawler.crawl_once().await.unwrap();
    assert_eq!(stats.examined, 5);
    assert_eq!(stats.attempted, 5);
}

#[tokio::test]
async fn crawler_settles_what_the_listener_missed() {
    let p = pipeline().await;
    let wallet = PrivateKeySigner::random();
    let wallet_address = format!("{}", wallet.address());

    let intent = p
        .service
        .create_payment_intent(&p.subscription_id, "user-1", 29.0)
        .await
        .unwrap();
    p.payments
        .set_transaction_hash(&intent.payment_id, "0xcafe")
        .await
        .unwrap();
    p.payments
        .merge_metadata(&intent.payment_id, signature_metadata())
        .await
        .unwrap();
    p.chain.seed_transfer(&wallet_address, 29.0, "0xcafe");

    let crawler = ReconciliationCrawler::new(Arc::clone(&p.service), Duration::from_secs(120), 50);
    let stats = crawler.crawl_once().await.unwrap();
    assert_eq!(stats.verified, 1);

    let subscription = p
        .subscriptions
        .get(&p.subscription_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn listener_starts_degraded_and_recovers() {
    let p = pipeline().await;
    p.chain.down.store(true, Ordering::SeqCst);

    let listener = listener_for(&p);
    listener.start().await;
    assert!(!listener.is_listening());

    p.chain.down.store(false, Ordering::SeqCst);
    *p.chain.head.write() = 50;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(listener.is_listening());

    listener.stop();
    listener.stop();
}

#[tokio::test]
async fn signature_from_wrong_wallet_is_rejected() {
    let p = pipeline().await;
    let wallet = PrivateKeySigner::random();
    let impostor = PrivateKeySigner::random();

    let intent = p
        .service
        .create_payment_intent(&p.subscription_id, "user-1", 29.0)
        .await
        .unwrap();
    let signature = impostor.sign_message_sync(intent.message.as_bytes()).unwrap();

    let err = p
        .service
        .submit_signature(
            &intent.salt,
            &format!("{}", wallet.address()),
            &hex::encode(signature.as_bytes()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSignature(_)));

    // The payment stays pending and unbound.
    let payment = p.payments.get(&intent.payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(payment.from_address.is_none());
}
