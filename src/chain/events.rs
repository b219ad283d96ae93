//! Vault contract events and their mapping to ledger balance deltas

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::abi::{self, Word};
use super::error::ChainError;
use super::rpc::parse_quantity;
use crate::core_types::{Asset, Mode, TraderId};
use crate::models::{BalanceDelta, BalanceKey};

pub const DEPOSITED_SIG: &str = "Deposited(address,uint256)";
pub const WITHDRAWN_SIG: &str = "Withdrawn(address,uint256,bool)";
pub const SYNTH_MINTED_SIG: &str = "SynthMinted(address,address,uint256)";
pub const SYNTH_BURNED_SIG: &str = "SynthBurned(address,address,uint256)";

/// Log entry as returned by `eth_getLogs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    pub fn block(&self) -> Result<u64, ChainError> {
        self.block_number
            .as_deref()
            .map(parse_quantity)
            .transpose()?
            .ok_or_else(|| ChainError::Decode("log without block number".into()))
    }

    pub fn index(&self) -> Result<u64, ChainError> {
        self.log_index
            .as_deref()
            .map(parse_quantity)
            .transpose()
            .map(Option::unwrap_or_default)
    }
}

/// Topic hashes of the vault events, computed once per listener
#[derive(Debug, Clone)]
pub struct VaultTopics {
    pub deposited: String,
    pub withdrawn: String,
    pub synth_minted: String,
    pub synth_burned: String,
}

impl Default for VaultTopics {
    fn default() -> Self {
        Self::new()
    }
}

impl VaultTopics {
    pub fn new() -> Self {
        Self {
            deposited: abi::event_topic(DEPOSITED_SIG),
            withdrawn: abi::event_topic(WITHDRAWN_SIG),
            synth_minted: abi::event_topic(SYNTH_MINTED_SIG),
            synth_burned: abi::event_topic(SYNTH_BURNED_SIG),
        }
    }

    pub fn all(&self) -> Vec<String> {
        vec![
            self.deposited.clone(),
            self.withdrawn.clone(),
            self.synth_minted.clone(),
            self.synth_burned.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum VaultEvent {
    Deposited {
        trader: String,
        amount: Decimal,
    },
    Withdrawn {
        trader: String,
        amount: Decimal,
        as_cxpt: bool,
    },
    SynthMinted {
        synth: String,
        to: String,
        amount: Decimal,
    },
    SynthBurned {
        synth: String,
        from: String,
        amount: Decimal,
    },
}

/// A decoded event together with its position on chain
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedEvent {
    pub event: VaultEvent,
    pub tx_hash: String,
    pub block_number: u64,
    pub log_index: u64,
}

/// Assets credited by vault events
#[derive(Debug, Clone)]
pub struct EventAssets {
    pub quote_asset: Asset,
    pub platform_asset: Asset,
    /// synth contract address (lowercase) -> asset symbol
    pub synths: HashMap<String, Asset>,
}

impl EventAssets {
    pub fn synth_asset(&self, synth: &str) -> Asset {
        let address = abi::normalize_address(synth);
        self.synths.get(&address).cloned().unwrap_or(address)
    }
}

/// Idempotency key shared by the optimistic API write and the chain event
pub fn deposit_key(tx_hash: &str) -> String {
    format!("{}:deposit", tx_hash.to_ascii_lowercase())
}

pub fn withdraw_key(tx_hash: &str) -> String {
    format!("{}:withdraw", tx_hash.to_ascii_lowercase())
}

fn word(words: &[Word], i: usize) -> Result<&Word, ChainError> {
    words
        .get(i)
        .ok_or_else(|| ChainError::Decode(format!("missing data word {}", i)))
}

fn topic(log: &RawLog, i: usize) -> Result<String, ChainError> {
    let raw = log
        .topics
        .get(i)
        .ok_or_else(|| ChainError::Decode(format!("missing topic {}", i)))?;
    abi::decode_address_topic(raw)
}

/// Decode a vault log. `Ok(None)` for logs with an unknown signature.
pub fn decode_log(log: &RawLog, topics: &VaultTopics) -> Result<Option<LoggedEvent>, ChainError> {
    let Some(signature) = log.topics.first().map(|t| t.to_ascii_lowercase()) else {
        return Ok(None);
    };
    let words = abi::data_words(&log.data)?;

    let event = if signature == topics.deposited {
        VaultEvent::Deposited {
            trader: topic(log, 1)?,
            amount: abi::decode_amount(word(&words, 0)?)?,
        }
    } else if signature == topics.withdrawn {
        VaultEvent::Withdrawn {
            trader: topic(log, 1)?,
            amount: abi::decode_amount(word(&words, 0)?)?,
            as_cxpt: abi::decode_bool(word(&words, 1)?)?,
        }
    } else if signature == topics.synth_minted {
        VaultEvent::SynthMinted {
            synth: topic(log, 1)?,
            to: topic(log, 2)?,
            amount: abi::decode_amount(word(&words, 0)?)?,
        }
    } else if signature == topics.synth_burned {
        VaultEvent::SynthBurned {
            synth: topic(log, 1)?,
            from: topic(log, 2)?,
            amount: abi::decode_amount(word(&words, 0)?)?,
        }
    } else {
        return Ok(None);
    };

    let tx_hash = log
        .transaction_hash
        .clone()
        .ok_or_else(|| ChainError::Decode("log without transaction hash".into()))?;

    Ok(Some(LoggedEvent {
        event,
        tx_hash,
        block_number: log.block()?,
        log_index: log.index()?,
    }))
}

impl LoggedEvent {
    /// The single additive balance delta this event implies (REAL mode)
    pub fn to_delta(&self, assets: &EventAssets) -> BalanceDelta {
        let (trader, asset, amount, key): (TraderId, Asset, Decimal, String) = match &self.event
        {
            VaultEvent::Deposited { trader, amount } => (
                abi::normalize_address(trader),
                assets.quote_asset.clone(),
                *amount,
                deposit_key(&self.tx_hash),
            ),
            VaultEvent::Withdrawn {
                trader,
                amount,
                as_cxpt,
            } => {
                let asset = if *as_cxpt {
                    assets.platform_asset.clone()
                } else {
                    assets.quote_asset.clone()
                };
                (
                    abi::normalize_address(trader),
                    asset,
                    -*amount,
                    withdraw_key(&self.tx_hash),
                )
            }
            VaultEvent::SynthMinted { synth, to, amount } => (
                abi::normalize_address(to),
                assets.synth_asset(synth),
                *amount,
                self.log_key(),
            ),
            VaultEvent::SynthBurned {
                synth,
                from,
                amount,
            } => (
                abi::normalize_address(from),
                assets.synth_asset(synth),
                -*amount,
                self.log_key(),
            ),
        };
        BalanceDelta::new(BalanceKey::new(trader, asset, Mode::Real), amount)
            .with_idempotency_key(key)
    }

    fn log_key(&self) -> String {
        format!("{}:{}", self.tx_hash.to_ascii_lowercase(), self.log_index)
    }
}

/// Build a log for an event. Used by the in-process vault and tests.
pub fn encode_log(
    event: &VaultEvent,
    topics: &VaultTopics,
    vault: &str,
    tx_hash: &str,
    block_number: u64,
    log_index: u64,
) -> Result<RawLog, ChainError> {
    let address_topic = |addr: &str| -> Result<String, ChainError> {
        Ok(format!("0x{}", hex::encode(abi::encode_address(addr)?)))
    };
    let (topic_list, words): (Vec<String>, Vec<Word>) = match event {
        VaultEvent::Deposited { trader, amount } => (
            vec![topics.deposited.clone(), address_topic(trader)?],
            vec![abi::encode_amount(*amount)?],
        ),
        VaultEvent::Withdrawn {
            trader,
            amount,
            as_cxpt,
        } => (
            vec![topics.withdrawn.clone(), address_topic(trader)?],
            vec![abi::encode_amount(*amount)?, abi::encode_bool(*as_cxpt)],
        ),
        VaultEvent::SynthMinted { synth, to, amount } => (
            vec![
                topics.synth_minted.clone(),
                address_topic(synth)?,
                address_topic(to)?,
            ],
            vec![abi::encode_amount(*amount)?],
        ),
        VaultEvent::SynthBurned {
            synth,
            from,
            amount,
        } => (
            vec![
                topics.synth_burned.clone(),
                address_topic(synth)?,
                address_topic(from)?,
            ],
            vec![abi::encode_amount(*amount)?],
        ),
    };
    let data: String = words.iter().map(hex::encode).collect();
    Ok(RawLog {
        address: abi::normalize_address(vault),
        topics: topic_list,
        data: format!("0x{}", data),
        block_number: Some(super::rpc::to_quantity(block_number)),
        transaction_hash: Some(tx_hash.to_string()),
        log_index: Some(super::rpc::to_quantity(log_index)),
        removed: false,
    })
}
