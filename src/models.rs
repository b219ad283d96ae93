// models.rs - Ledger records: balances, positions, orders, trades, markets, prices, stats

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_types::{
    Asset, GLOBAL_KEY, MarketSymbol, Mode, OrderId, TimestampMs, TradeId, TraderId,
};

/// Order / trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for BUY, -1 for SELL
    pub fn direction(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Option,
    Future,
    Perp,
}

impl OrderType {
    /// Orders of these types carry an expiry and are cash-settled by the sweep
    pub fn is_expiring(&self) -> bool {
        matches!(self, OrderType::Option | OrderType::Future)
    }
}

/// Order status. EXPIRED and FILLED are terminal; only OPEN orders move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Open,
    Filled,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionKind {
    Call,
    Put,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketType {
    Spot,
    Perp,
    Future,
    Option,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketStatus {
    Active,
    Paused,
    Delisted,
}

macro_rules! display_as_serde_name {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    let name = serde_json::to_value(self)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default();
                    f.write_str(&name)
                }
            }
        )*
    };
}

display_as_serde_name!(Side, OrderType, OrderStatus, OptionKind, MarketType, MarketStatus);

// ============================================================
// BALANCES
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub trader_id: TraderId,
    pub asset: Asset,
    pub mode: Mode,
}

impl BalanceKey {
    pub fn new(trader_id: impl Into<TraderId>, asset: impl Into<Asset>, mode: Mode) -> Self {
        Self {
            trader_id: trader_id.into(),
            asset: asset.into(),
            mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub trader_id: TraderId,
    pub asset: Asset,
    pub mode: Mode,
    pub balance: Decimal,
    pub pending: Decimal,
    pub updated_at: TimestampMs,
}

impl Balance {
    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.trader_id.clone(), self.asset.clone(), self.mode)
    }
}

/// Additive balance change. Balances are never overwritten.
///
/// `idempotency_key` identifies the logical change (e.g. `<tx_hash>:deposit`);
/// the store applies a given key at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub key: BalanceKey,
    pub amount: Decimal,
    pub idempotency_key: Option<String>,
}

impl BalanceDelta {
    pub fn new(key: BalanceKey, amount: Decimal) -> Self {
        Self {
            key,
            amount,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Result of an additive balance update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Delta applied; carries the balance after the update
    Applied { balance: Decimal },
    /// The idempotency key was already applied; nothing changed
    Duplicate,
}

impl DeltaOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, DeltaOutcome::Applied { .. })
    }
}

// ============================================================
// POSITIONS
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub trader_id: TraderId,
    pub market: MarketSymbol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub trader_id: TraderId,
    pub market: MarketSymbol,
    pub mode: Mode,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    /// Day number (since unix epoch) of the last daily PnL realization
    pub last_settled_epoch: Option<i64>,
    pub updated_at: TimestampMs,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey {
            trader_id: self.trader_id.clone(),
            market: self.market.clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.size.is_zero()
    }
}

/// Outcome of a conditional daily settlement write
#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Settled { credited: Decimal },
    /// Position already realized for this (or a later) epoch
    AlreadySettled,
    /// Nothing to realize
    NothingToSettle,
    NotFound,
}

// ============================================================
// ORDERS
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub market: MarketSymbol,
    pub mode: Mode,
    pub order_id: OrderId,
    pub trader_id: TraderId,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub side: Side,
    /// Limit price, or strike for options / contract price for futures
    pub price: Decimal,
    pub qty: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_kind: Option<OptionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_ts: Option<TimestampMs>,
    /// Set together with the payoff credit; guards against double payoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<TimestampMs>,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub market: MarketSymbol,
    pub mode: Mode,
    pub order_id: OrderId,
}

impl Order {
    pub fn key(&self) -> OrderKey {
        OrderKey {
            market: self.market.clone(),
            mode: self.mode,
            order_id: self.order_id.clone(),
        }
    }

    pub fn is_expired_at(&self, now: TimestampMs) -> bool {
        self.expiry_ts.is_some_and(|ts| ts < now)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpireOutcome {
    Expired { payoff: Decimal },
    /// Order was no longer OPEN or already carried a settlement marker
    AlreadyFinal,
    NotFound,
}

// ============================================================
// TRADES
// ============================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_rate: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_price: Option<Decimal>,
}

/// Immutable trade record. Trades are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub market: MarketSymbol,
    pub mode: Mode,
    pub trade_id: TradeId,
    /// None for synthetic (system) trades such as funding records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trader_id: Option<TraderId>,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    pub timestamp: TimestampMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<TradeMeta>,
}

impl Trade {
    pub fn is_funding(&self) -> bool {
        self.meta
            .as_ref()
            .is_some_and(|m| m.funding_rate.is_some())
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.qty
    }
}

// ============================================================
// MARKETS
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub symbol: MarketSymbol,
    pub mode: Mode,
    pub market_type: MarketType,
    pub status: MarketStatus,
    /// Oracle asset the market tracks (e.g. "BTC" for "BTC-PERP")
    pub underlying: Asset,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_interval_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_ts: Option<TimestampMs>,
}

// ============================================================
// PRICES
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub asset: Asset,
    pub price: Decimal,
    pub timestamp: TimestampMs,
    pub source: String,
    /// Retention marker; rows past this instant are purged
    pub expires_at: TimestampMs,
}

// ============================================================
// STATS
// ============================================================

/// Minute-bucketed counters for a market (or GLOBAL)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntradayStat {
    pub key: String,
    pub bucket: TimestampMs,
    pub volume: Decimal,
    pub fees: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_rate: Option<Decimal>,
    pub open_interest: Decimal,
    pub trade_count: u64,
}

/// Upsert payload for an intraday row: counters are added, gauges replaced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntradayUpdate {
    pub key: String,
    pub bucket: TimestampMs,
    pub volume: Decimal,
    pub fees: Decimal,
    pub trade_count: u64,
    pub funding_rate: Option<Decimal>,
    pub open_interest: Option<Decimal>,
}

impl IntradayUpdate {
    pub fn for_key(key: impl Into<String>, ts: TimestampMs) -> Self {
        Self {
            key: key.into(),
            bucket: minute_bucket(ts),
            ..Default::default()
        }
    }

    pub fn global(ts: TimestampMs) -> Self {
        Self::for_key(GLOBAL_KEY, ts)
    }

    pub fn for_market(market: &str, mode: Mode, ts: TimestampMs) -> Self {
        Self::for_key(stats_key(market, mode), ts)
    }
}

/// Stats row key of a market: the bare symbol for REAL, `<symbol>#PAPER`
/// for paper trading so simulated volume never mixes with real volume.
pub fn stats_key(market: &str, mode: Mode) -> String {
    match mode {
        Mode::Real => market.to_string(),
        Mode::Paper => crate::core_types::market_partition(market, mode),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub key: String,
    pub date: NaiveDate,
    pub volume: Decimal,
    pub fees: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_funding_rate: Option<Decimal>,
    pub trade_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifetimeStat {
    pub key: String,
    pub volume: Decimal,
    pub fees: Decimal,
    pub trade_count: u64,
    pub updated_at: TimestampMs,
}

// ============================================================
// TIME BUCKETS
// ============================================================

const MS_PER_MINUTE: i64 = 60_000;
const MS_PER_DAY: i64 = 86_400_000;

/// Start of the minute containing `ts`
pub fn minute_bucket(ts: TimestampMs) -> TimestampMs {
    ts - ts.rem_euclid(MS_PER_MINUTE)
}

/// Day number since the unix epoch (UTC)
pub fn epoch_day(ts: TimestampMs) -> i64 {
    ts.div_euclid(MS_PER_DAY)
}

/// UTC calendar date containing `ts`
pub fn utc_date(ts: TimestampMs) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(ts)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// `[start, end)` of a UTC date in unix milliseconds
pub fn day_range(date: NaiveDate) -> (TimestampMs, TimestampMs) {
    let start = date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default();
    (start, start + MS_PER_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(serde_json::to_string(&OrderType::Future).unwrap(), "\"FUTURE\"");
        assert_eq!(OrderStatus::Expired.to_string(), "EXPIRED");
        assert_eq!(MarketType::Perp.to_string(), "PERP");
    }

    #[test]
    fn test_minute_bucket_and_days() {
        // 2024-05-01T12:34:56.789Z
        let ts = 1_714_566_896_789;
        assert_eq!(minute_bucket(ts), 1_714_566_840_000);
        assert_eq!(utc_date(ts), NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        let (start, end) = day_range(utc_date(ts));
        assert!(start <= ts && ts < end);
        assert_eq!(epoch_day(start), epoch_day(end - 1));
        assert_eq!(epoch_day(end), epoch_day(start) + 1);
    }

    #[test]
    fn test_funding_trade_flag() {
        let mut trade = Trade {
            market: "BTC-PERP".into(),
            mode: Mode::Real,
            trade_id: "t1".into(),
            trader_id: None,
            side: Side::Buy,
            price: dec!(100),
            qty: dec!(0),
            fee: Decimal::ZERO,
            timestamp: 0,
            meta: None,
        };
        assert!(!trade.is_funding());
        trade.meta = Some(TradeMeta {
            funding_rate: Some(dec!(0.001)),
            ..Default::default()
        });
        assert!(trade.is_funding());
    }
}
