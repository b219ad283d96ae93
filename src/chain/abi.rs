//! Just enough Solidity ABI for the vault contract: 32-byte words,
//! 18-decimal amounts, addresses, bools, selectors and event topics.

use alloy_primitives::keccak256;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use super::error::ChainError;

pub type Word = [u8; 32];

/// Fixed-point decimals of on-chain amounts
pub const AMOUNT_DECIMALS: u32 = 18;

/// Topic hash of an event signature, `0x`-prefixed lowercase hex
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes()).0))
}

/// First four bytes of keccak256(signature)
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes()).0;
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Calldata for `signature` with pre-encoded static arguments
pub fn encode_call(signature: &str, args: &[Word]) -> String {
    let mut out = String::with_capacity(10 + args.len() * 64);
    out.push_str("0x");
    out.push_str(&hex::encode(selector(signature)));
    for word in args {
        out.push_str(&hex::encode(word));
    }
    out
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, ChainError> {
    hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| ChainError::Decode(format!("invalid hex: {}", e)))
}

/// Lowercase `0x` address; trader ids derived from chain events use this form
pub fn normalize_address(address: &str) -> String {
    format!("0x{}", address.trim_start_matches("0x").to_ascii_lowercase())
}

pub fn encode_address(address: &str) -> Result<Word, ChainError> {
    let bytes = decode_hex(address)?;
    if bytes.len() != 20 {
        return Err(ChainError::Decode(format!(
            "address must be 20 bytes, got {}",
            bytes.len()
        )));
    }
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(&bytes);
    Ok(word)
}

pub fn encode_bool(value: bool) -> Word {
    let mut word = [0u8; 32];
    word[31] = value as u8;
    word
}

/// Decimal amount -> uint256 with 18 decimals
pub fn encode_amount(amount: Decimal) -> Result<Word, ChainError> {
    if amount.is_sign_negative() {
        return Err(ChainError::Decode(format!("negative amount {}", amount)));
    }
    let scaled = amount
        .checked_mul(Decimal::from(10u64.pow(AMOUNT_DECIMALS)))
        .ok_or_else(|| ChainError::Decode(format!("amount {} overflows", amount)))?;
    if !scaled.fract().is_zero() {
        return Err(ChainError::Decode(format!(
            "amount {} has more than {} decimals",
            amount, AMOUNT_DECIMALS
        )));
    }
    let wei = scaled
        .to_u128()
        .ok_or_else(|| ChainError::Decode(format!("amount {} out of range", amount)))?;
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&wei.to_be_bytes());
    Ok(word)
}

/// uint256 with 18 decimals -> Decimal
pub fn decode_amount(word: &Word) -> Result<Decimal, ChainError> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("amount exceeds 128 bits".into()));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    let wei = i128::try_from(u128::from_be_bytes(low))
        .map_err(|_| ChainError::Decode("amount exceeds i128".into()))?;
    Decimal::try_from_i128_with_scale(wei, AMOUNT_DECIMALS)
        .map(|d| d.normalize())
        .map_err(|e| ChainError::Decode(format!("amount not representable: {}", e)))
}

pub fn decode_bool(word: &Word) -> Result<bool, ChainError> {
    if word[..31].iter().any(|b| *b != 0) || word[31] > 1 {
        return Err(ChainError::Decode("invalid bool word".into()));
    }
    Ok(word[31] == 1)
}

/// Address held in an indexed topic (right-aligned in 32 bytes)
pub fn decode_address_topic(topic: &str) -> Result<String, ChainError> {
    let bytes = decode_hex(topic)?;
    if bytes.len() != 32 {
        return Err(ChainError::Decode(format!(
            "topic must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(format!("0x{}", hex::encode(&bytes[12..])))
}

/// Split non-indexed log data into 32-byte words
pub fn data_words(data: &str) -> Result<Vec<Word>, ChainError> {
    let bytes = decode_hex(data)?;
    if bytes.len() % 32 != 0 {
        return Err(ChainError::Decode(format!(
            "log data length {} is not a multiple of 32",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(32)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word.copy_from_slice(chunk);
            word
        })
        .collect())
}
