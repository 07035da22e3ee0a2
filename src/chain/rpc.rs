//! JSON-RPC client for chain providers.
//!
//! A thin JSON-RPC 2.0 client over HTTP covering the five calls the payment
//! pipeline needs: `eth_blockNumber`, `eth_getTransactionReceipt`,
//! `eth_getTransactionByHash`, `eth_getBlockByNumber`, and `eth_getLogs`.
//! The chain's wire format is treated as an external, versionless contract:
//! quantities are decoded defensively and unknown shapes surface as
//! `Provider` errors or skipped entries, never panics.

use crate::error::{Error, Result};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// An ERC-20 style log entry as returned by `eth_getLogs` /
/// `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Emitting contract address.
    pub address: String,
    /// Indexed topics, topic0 first.
    #[serde(default)]
    pub topics: Vec<String>,
    /// ABI-encoded unindexed data.
    #[serde(default)]
    pub data: String,
    /// Hash of the containing transaction.
    pub transaction_hash: Option<String>,
    /// Number of the containing block (hex quantity).
    pub block_number: Option<String>,
}

/// A transaction receipt.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    /// Transaction hash.
    pub transaction_hash: String,
    /// Execution status: `0x1` success, `0x0` reverted.
    pub status: Option<String>,
    /// Containing block number (hex quantity).
    pub block_number: Option<String>,
    /// Logs emitted by the transaction.
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl TransactionReceipt {
    /// Whether the transaction executed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some("0x1")
    }

    /// Containing block number, if decodable.
    #[must_use]
    pub fn block_number_u64(&self) -> Option<u64> {
        self.block_number.as_deref().and_then(parse_quantity)
    }
}

/// Minimal view of a transaction (existence and sender are all the pipeline
/// needs).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    /// Transaction hash.
    pub hash: String,
    /// Sender address.
    pub from: Option<String>,
    /// Recipient address (contract for token transfers).
    pub to: Option<String>,
}

/// Minimal view of a block.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    /// Block number (hex quantity).
    pub number: Option<String>,
    /// Block timestamp in seconds (hex quantity).
    pub timestamp: Option<String>,
}

impl RpcBlock {
    /// Block timestamp as a unix second count, if decodable.
    #[must_use]
    pub fn timestamp_u64(&self) -> Option<u64> {
        self.timestamp.as_deref().and_then(parse_quantity)
    }
}

/// Log query parameters for `eth_getLogs`.
#[derive(Debug, Clone)]
pub struct LogFilter {
    /// First block of the range (inclusive).
    pub from_block: u64,
    /// Last block of the range (inclusive).
    pub to_block: u64,
    /// Emitting contract.
    pub address: Address,
    /// Required topic0 (event signature).
    pub topic0: B256,
    /// Optional topic2 constraint (transfer recipient).
    pub topic2: Option<B256>,
}

/// Seam between the payment pipeline and the chain transport, so tests can
/// run against a scripted provider.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block number.
    async fn block_number(&self) -> Result<u64>;

    /// Receipt for a transaction, or `None` if unknown/unconfirmed.
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>>;

    /// Transaction details, or `None` if unknown.
    async fn transaction_by_hash(&self, tx_hash: &str) -> Result<Option<RpcTransaction>>;

    /// Block by number, or `None` if unknown.
    async fn block_by_number(&self, number: u64) -> Result<Option<RpcBlock>>;

    /// Logs matching a filter.
    async fn logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>>;
}

/// HTTP JSON-RPC implementation of [`ChainClient`].
pub struct RpcClient {
    url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

impl RpcClient {
    /// Create a client for one RPC endpoint with a bounded request timeout.
    #[must_use]
    pub fn new(url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("paywatch/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            url: url.to_string(),
            client,
        }
    }

    /// Issue one JSON-RPC call, decoding the result into `T`.
    ///
    /// A JSON `null` result maps to `None` (the chain's way of saying
    /// "not found / not yet confirmed").
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("{method} request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "{method} returned HTTP status {}",
                response.status()
            )));
        }

        let rpc: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("{method} response parse failed: {e}")))?;

        if let Some(err) = rpc.error {
            return Err(Error::Provider(format!(
                "{method} failed: {} (code {})",
                err.message, err.code
            )));
        }

        match rpc.result {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Error::Provider(format!("{method} result decode failed: {e}"))),
        }
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn block_number(&self) -> Result<u64> {
        let hex: Option<String> = self.call("eth_blockNumber", json!([])).await?;
        hex.as_deref()
            .and_then(parse_quantity)
            .ok_or_else(|| Error::Provider("eth_blockNumber returned no quantity".to_string()))
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>> {
        self.call("eth_getTransactionReceipt", json!([tx_hash]))
            .await
    }

    async fn transaction_by_hash(&self, tx_hash: &str) -> Result<Option<RpcTransaction>> {
        self.call("eth_getTransactionByHash", json!([tx_hash]))
            .await
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<RpcBlock>> {
        self.call(
            "eth_getBlockByNumber",
            json!([format!("0x{number:x}"), false]),
        )
        .await
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let topics = match filter.topic2 {
            Some(topic2) => json!([
                format!("{}", filter.topic0),
                Value::Null,
                format!("{topic2}"),
            ]),
            None => json!([format!("{}", filter.topic0)]),
        };

        let params = json!([{
            "fromBlock": format!("0x{:x}", filter.from_block),
            "toBlock": format!("0x{:x}", filter.to_block),
            "address": format!("{}", filter.address),
            "topics": topics,
        }]);

        let logs: Option<Vec<LogEntry>> = self.call("eth_getLogs", params).await?;
        Ok(logs.unwrap_or_default())
    }
}

/// Decode a hex quantity (`0x`-prefixed) into a `u64`.
#[must_use]
pub fn parse_quantity(hex: &str) -> Option<u64> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok()
}
