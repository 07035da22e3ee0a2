//! Chain registry and token transfer primitives.
//!
//! One configuration-driven registry maps an EIP-155 chain id to the RPC
//! endpoint, stablecoin contract, and decimal precision used for payment
//! verification on that chain. Well-known chains carry USDC presets so a
//! config entry only needs an RPC endpoint; anything else must spell out its
//! token contract.

pub mod rpc;

use crate::config::ChainConfig;
use crate::error::{Error, Result};
use alloy_primitives::{b256, Address, B256, U256};
use std::collections::BTreeMap;
use std::str::FromStr;

pub use rpc::{ChainClient, LogEntry, LogFilter, RpcClient};

/// `keccak256("Transfer(address,address,uint256)")` — topic0 of an ERC-20
/// transfer log.
pub const TRANSFER_EVENT_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// Decimal precision shared by the supported stablecoins (USDC/USDT).
pub const STABLECOIN_DECIMALS: u8 = 6;

/// USDC contract presets for well-known chains: `(chain_id, name, contract)`.
const USDC_PRESETS: &[(u64, &str, &str)] = &[
    (1, "Ethereum", "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
    (
        11_155_111,
        "Ethereum Sepolia",
        "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238",
    ),
    (137, "Polygon", "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174"),
    (
        80_001,
        "Polygon Mumbai",
        "0x9999f7Fea5938fD3b1E26A12c3f2fb024e194f97",
    ),
    (
        42_161,
        "Arbitrum",
        "0xaf88d065e77c8cC2239327C5EDb3A432268e5831",
    ),
    (
        421_614,
        "Arbitrum Sepolia",
        "0x75faf114eafb1BDbe2F0316DF893fd58CE46AA4d",
    ),
    (8453, "Base", "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
    (
        84_532,
        "Base Sepolia",
        "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
    ),
];

/// Everything needed to verify payments on one chain.
#[derive(Debug, Clone)]
pub struct ChainSpec {
    /// EIP-155 chain identifier.
    pub chain_id: u64,
    /// Human-readable chain name.
    pub name: String,
    /// JSON-RPC endpoint.
    pub rpc_url: String,
    /// Stablecoin contract watched for transfers.
    pub token_contract: Address,
    /// Token decimal precision.
    pub decimals: u8,
}

/// Registry of chains enabled for payment verification, selected at call
/// time by chain id.
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: BTreeMap<u64, ChainSpec>,
}

impl ChainRegistry {
    /// Build the registry from configuration, filling token contract and
    /// decimals from the USDC presets where omitted.
    ///
    /// # Errors
    ///
    /// Returns an error if a chain has no token contract and no preset, or
    /// if an address fails to parse.
    pub fn from_config(chains: &[ChainConfig]) -> Result<Self> {
        let mut registry = Self::default();
        for chain in chains {
            let preset = USDC_PRESETS.iter().find(|(id, _, _)| *id == chain.chain_id);

            let contract = match (&chain.token_contract, preset) {
                (Some(addr), _) => parse_address(addr)?,
                (None, Some((_, _, addr))) => parse_address(addr)?,
                (None, None) => {
                    return Err(Error::Config(format!(
                        "chain {} has no token contract and no preset",
                        chain.chain_id
                    )))
                }
            };

            let name = chain
                .name
                .clone()
                .or_else(|| preset.map(|(_, name, _)| (*name).to_string()))
                .unwrap_or_else(|| format!("Chain {}", chain.chain_id));

            registry.chains.insert(
                chain.chain_id,
                ChainSpec {
                    chain_id: chain.chain_id,
                    name,
                    rpc_url: chain.rpc_url.clone(),
                    token_contract: contract,
                    decimals: chain.decimals.unwrap_or(STABLECOIN_DECIMALS),
                },
            );
        }
        Ok(registry)
    }

    /// Look up a chain, failing with `InvalidRequest` for unsupported ids.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the chain id is not configured.
    pub fn get(&self, chain_id: u64) -> Result<&ChainSpec> {
        self.chains
            .get(&chain_id)
            .ok_or_else(|| Error::InvalidRequest(format!("unsupported chain id: {chain_id}")))
    }

    /// Whether a chain id is configured.
    #[must_use]
    pub fn supports(&self, chain_id: u64) -> bool {
        self.chains.contains_key(&chain_id)
    }

    /// Iterate over configured chains in chain-id order.
    pub fn iter(&self) -> impl Iterator<Item = &ChainSpec> {
        self.chains.values()
    }

    /// Number of configured chains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// One decoded token transfer.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    /// Sender address.
    pub from: Address,
    /// Recipient address.
    pub to: Address,
    /// Raw token amount in minor units.
    pub value: U256,
    /// Hash of the containing transaction.
    pub transaction_hash: String,
}

/// Parse an EVM address string, validating the `0x` + 40-hex-chars shape
/// before handing it to the typed parser.
///
/// # Errors
///
/// Returns `InvalidRequest` if the address format is invalid.
pub fn parse_address(address: &str) -> Result<Address> {
    if !address.starts_with("0x") && !address.starts_with("0X") {
        return Err(Error::InvalidRequest(format!(
            "invalid wallet address: must start with '0x', got: {address}"
        )));
    }

    if address.len() != 42 {
        return Err(Error::InvalidRequest(format!(
            "invalid wallet address length: expected 42 characters, got {}",
            address.len()
        )));
    }

    Address::from_str(address)
        .map_err(|e| Error::InvalidRequest(format!("invalid wallet address {address}: {e}")))
}

/// Whether an EVM address string is properly formatted.
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    parse_address(address).is_ok()
}

/// Left-pad an address into a 32-byte log topic.
#[must_use]
pub fn address_topic(address: Address) -> B256 {
    let mut topic = [0u8; 32];
    topic[12..].copy_from_slice(address.as_slice());
    B256::from(topic)
}

/// Extract the address packed into the low 20 bytes of a log topic.
#[must_use]
pub fn topic_address(topic: B256) -> Address {
    Address::from_slice(&topic.as_slice()[12..])
}

/// Decode a log entry into a transfer event.
///
/// Returns `None` for anything that is not a well-formed ERC-20 Transfer
/// log — unknown log shapes are skipped, not fatal (the chain's log format
/// is an external, versionless contract).
#[must_use]
pub fn decode_transfer(log: &LogEntry) -> Option<TransferEvent> {
    if log.topics.len() != 3 {
        return None;
    }
    let topic0 = B256::from_str(&log.topics[0]).ok()?;
    if topic0 != TRANSFER_EVENT_TOPIC {
        return None;
    }

    let from = topic_address(B256::from_str(&log.topics[1]).ok()?);
    let to = topic_address(B256::from_str(&log.topics[2]).ok()?);
    let value = U256::from_str_radix(log.data.trim_start_matches("0x"), 16).ok()?;

    Some(TransferEvent {
        from,
        to,
        value,
        transaction_hash: log.transaction_hash.clone()?,
    })
}

/// Convert a raw on-chain token amount to USD through the token's declared
/// decimal precision.
///
/// Amounts beyond `u128` are out of any sane tolerance band and map to
/// `f64::MAX`.
#[must_use]
pub fn units_to_usd(value: U256, decimals: u8) -> f64 {
    let raw: u128 = match value.try_into() {
        Ok(v) => v,
        Err(_) => return f64::MAX,
    };
    #[allow(clippy::cast_precision_loss)]
    let raw = raw as f64;
    raw / 10f64.powi(i32::from(decimals))
}

/// Convert a USD amount to raw token units at the given decimal precision.
#[must_use]
pub fn usd_to_units(amount: f64, decimals: u8) -> U256 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let units = (amount * 10f64.powi(i32::from(decimals))).round() as u128;
    U256::from(units)
}
