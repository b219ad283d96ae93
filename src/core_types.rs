//! Core types used throughout the ledger
//!
//! Identifiers are strings because they originate outside this crate
//! (wallet addresses, market symbols, oracle tickers).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trader ID - the account identity issued by the auth service.
///
/// Chain events identify traders by wallet address; addresses are
/// normalised to lowercase hex before they are used as a trader id.
pub type TraderId = String;

/// Asset symbol, e.g. "USDC", "CXPT", "sBTC"
pub type Asset = String;

/// Market symbol, e.g. "BTC-PERP"
pub type MarketSymbol = String;

/// Trade ID - unique within a market partition
pub type TradeId = String;

/// Order ID - unique within a market partition
pub type OrderId = String;

/// Unix timestamp in milliseconds
pub type TimestampMs = i64;

/// Partition key used for aggregate rows that are not tied to a market
pub const GLOBAL_KEY: &str = "GLOBAL";

/// Funds scope of an account: real collateral or simulated funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Real,
    Paper,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Real, Mode::Paper];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Real => "REAL",
            Mode::Paper => "PAPER",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REAL" => Ok(Mode::Real),
            "PAPER" => Ok(Mode::Paper),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// Current wall-clock time in unix milliseconds
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

/// Composite partition key for per-market tables: `<market>#<mode>`
pub fn market_partition(market: &str, mode: Mode) -> String {
    format!("{}#{}", market, mode)
}

/// Split a `<market>#<mode>` partition key back into its parts
pub fn split_market_partition(pk: &str) -> Option<(MarketSymbol, Mode)> {
    let (market, mode) = pk.rsplit_once('#')?;
    if market.is_empty() {
        return None;
    }
    Some((market.to_string(), mode.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_roundtrip_names() {
        assert_eq!(Mode::Real.to_string(), "REAL");
        assert_eq!("paper".parse::<Mode>().unwrap(), Mode::Paper);
        assert!("demo".parse::<Mode>().is_err());
    }

    #[test]
    fn test_market_partition_split() {
        let pk = market_partition("BTC-PERP", Mode::Paper);
        assert_eq!(pk, "BTC-PERP#PAPER");
        assert_eq!(
            split_market_partition(&pk),
            Some(("BTC-PERP".to_string(), Mode::Paper))
        );
        assert_eq!(split_market_partition("BTC-PERP"), None);
        assert_eq!(split_market_partition("#REAL"), None);
    }
}
