//! Ledger store abstraction
//!
//! All durable ledger state lives behind [`LedgerStore`]. Two backends exist:
//! - [`MemoryLedgerStore`]: DashMap-backed, used by tests and single-node dev runs
//! - [`PgLedgerStore`]: PostgreSQL via sqlx, change feed over LISTEN/NOTIFY
//!
//! Balance mutation is additive only. Settlement and expiry are single
//! conditional operations so a re-run job can never double-apply.

pub mod cursor;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::core_types::{MarketSymbol, Mode, TimestampMs, TraderId};
use crate::models::{
    Balance, BalanceDelta, BalanceKey, DailyStat, DeltaOutcome, ExpireOutcome, IntradayStat,
    IntradayUpdate, LifetimeStat, Market, MarketStatus, Order, OrderKey, Position, PositionKey,
    PriceSnapshot, SettleOutcome, Trade,
};

pub use cursor::{decode_cursor, encode_cursor};
pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// Table names carried on change records
pub mod tables {
    pub const TRADES: &str = "trades";
    pub const ORDERS: &str = "orders";
}

/// Capacity of the in-process change feed broadcast
pub const CHANGE_FEED_CAPACITY: usize = 4096;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid pagination cursor")]
    InvalidCursor,

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// One page of a paginated query
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Opaque cursor for the next page; None when exhausted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            next_cursor: self.next_cursor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeKeys {
    /// Partition key, e.g. `BTC-PERP#REAL` for trades
    pub pk: String,
    /// Sort key within the partition
    pub sk: String,
}

/// Row-level change notification emitted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub table: String,
    pub keys: ChangeKeys,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_image: Option<serde_json::Value>,
}

/// Sort key of a trade row: zero-padded timestamp then trade id
pub fn trade_sort_key(trade: &Trade) -> String {
    format!("{:020}#{}", trade.timestamp, trade.trade_id)
}

/// Change record for a freshly appended trade
pub fn trade_change(trade: &Trade) -> Result<ChangeRecord, StoreError> {
    Ok(ChangeRecord {
        kind: ChangeKind::Insert,
        table: tables::TRADES.to_string(),
        keys: ChangeKeys {
            pk: crate::core_types::market_partition(&trade.market, trade.mode),
            sk: trade_sort_key(trade),
        },
        new_image: Some(serde_json::to_value(trade)?),
    })
}

/// Change record for an order write
pub fn order_change(order: &Order, kind: ChangeKind) -> Result<ChangeRecord, StoreError> {
    Ok(ChangeRecord {
        kind,
        table: tables::ORDERS.to_string(),
        keys: ChangeKeys {
            pk: crate::core_types::market_partition(&order.market, order.mode),
            sk: order.order_id.clone(),
        },
        new_image: Some(serde_json::to_value(order)?),
    })
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // === Balances ===

    /// Add `delta.amount` to the balance row, creating it at zero if absent.
    /// A delta carrying an already-applied idempotency key is a no-op.
    async fn apply_delta(&self, delta: &BalanceDelta) -> Result<DeltaOutcome, StoreError>;

    /// Undo an applied idempotent delta: subtract its amount and release its
    /// key so the same delta can be applied again later. `Duplicate` when the
    /// key is not currently applied (or the delta carries no key).
    async fn revoke_delta(&self, delta: &BalanceDelta) -> Result<DeltaOutcome, StoreError>;

    async fn get_balance(&self, key: &BalanceKey) -> Result<Option<Balance>, StoreError>;

    /// All balances of a trader in one mode, ordered by asset
    async fn get_balances(&self, trader_id: &str, mode: Mode) -> Result<Vec<Balance>, StoreError>;

    // === Positions ===

    async fn put_position(&self, position: &Position) -> Result<(), StoreError>;

    async fn get_position(&self, key: &PositionKey) -> Result<Option<Position>, StoreError>;

    /// All positions of a trader, ordered by market
    async fn get_positions(&self, trader_id: &str) -> Result<Vec<Position>, StoreError>;

    /// Scan positions with non-zero size, ordered by (trader, market)
    async fn scan_open_positions(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<Position>, StoreError>;

    /// Realize unrealized PnL into the quote balance for `epoch`.
    ///
    /// Applies only when the position's `last_settled_epoch` is below `epoch`.
    /// The credit, the realized/unrealized move and the epoch stamp commit
    /// together.
    async fn settle_position(
        &self,
        key: &PositionKey,
        quote_asset: &str,
        epoch: i64,
        now: TimestampMs,
    ) -> Result<SettleOutcome, StoreError>;

    // === Orders ===

    async fn put_order(&self, order: &Order) -> Result<(), StoreError>;

    async fn get_order(&self, key: &OrderKey) -> Result<Option<Order>, StoreError>;

    /// OPEN option/future orders whose expiry is before `now` and that carry
    /// no settlement marker, oldest expiry first
    async fn query_expirable_orders(
        &self,
        now: TimestampMs,
        limit: usize,
    ) -> Result<Vec<Order>, StoreError>;

    /// Mark an OPEN, unsettled order EXPIRED, stamping `settled_at` and
    /// applying `payoff` in the same step. Any other state is left untouched.
    async fn expire_order(
        &self,
        key: &OrderKey,
        payoff: Option<&BalanceDelta>,
        now: TimestampMs,
    ) -> Result<ExpireOutcome, StoreError>;

    // === Trades ===

    /// Append a trade. Returns false if a trade with the same key exists.
    async fn append_trade(&self, trade: &Trade) -> Result<bool, StoreError>;

    /// Trades of a market partition, newest first
    async fn query_market_trades(
        &self,
        market: &str,
        mode: Mode,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Trade>, StoreError>;

    /// Newest trade of a market partition, restricted to funding records
    /// (`funding = true`) or to fills (`funding = false`)
    async fn latest_market_trade(
        &self,
        market: &str,
        mode: Mode,
        funding: bool,
    ) -> Result<Option<Trade>, StoreError>;

    /// Trades attributed to a trader, newest first, optionally one market
    async fn query_trader_trades(
        &self,
        trader_id: &str,
        mode: Mode,
        market: Option<&str>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Trade>, StoreError>;

    // === Markets ===

    async fn put_market(&self, market: &Market) -> Result<(), StoreError>;

    async fn get_market(&self, symbol: &str, mode: Mode) -> Result<Option<Market>, StoreError>;

    /// Markets of a mode ordered by symbol
    async fn query_markets(
        &self,
        mode: Mode,
        status: Option<MarketStatus>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Market>, StoreError>;

    // === Prices ===

    async fn put_price_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError>;

    /// Most recent unexpired snapshot of an asset
    async fn latest_price(
        &self,
        asset: &str,
        now: TimestampMs,
    ) -> Result<Option<PriceSnapshot>, StoreError>;

    /// Delete snapshots whose retention marker has passed
    async fn purge_expired_prices(&self, now: TimestampMs) -> Result<u64, StoreError>;

    // === Stats ===

    /// Add counters and replace gauges of an intraday row, creating it if absent
    async fn upsert_intraday(&self, update: &IntradayUpdate) -> Result<(), StoreError>;

    /// Intraday rows with `from <= bucket < to`, ordered by (key, bucket)
    async fn query_intraday(
        &self,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<Vec<IntradayStat>, StoreError>;

    /// Write a daily row. When the row is new, its totals are added to the
    /// lifetime counters of the same key in the same step; rewriting an
    /// existing day leaves lifetime counters alone. Returns true if new.
    async fn put_daily_stat(&self, stat: &DailyStat, now: TimestampMs) -> Result<bool, StoreError>;

    async fn get_daily_stats(&self, date: NaiveDate) -> Result<Vec<DailyStat>, StoreError>;

    async fn get_lifetime(&self, key: &str) -> Result<Option<LifetimeStat>, StoreError>;

    // === Cursors ===

    /// Named progress marker (e.g. last scanned block)
    async fn get_cursor(&self, name: &str) -> Result<Option<i64>, StoreError>;

    async fn put_cursor(&self, name: &str, value: i64) -> Result<(), StoreError>;

    // === Change feed ===

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeRecord>;
}

/// Position cursor key for `scan_open_positions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PositionCursor {
    pub trader_id: TraderId,
    pub market: MarketSymbol,
}

/// Trade cursor key: last (timestamp, trade_id) returned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TradeCursor {
    pub timestamp: TimestampMs,
    pub trade_id: String,
}

/// Market cursor key: last symbol returned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MarketCursor {
    pub symbol: MarketSymbol,
}

/// Idempotency key of a daily PnL credit
pub fn daily_pnl_key(key: &PositionKey, epoch: i64) -> String {
    format!("pnl:{}:{}:{}", key.trader_id, key.market, epoch)
}

/// Aggregate totals used by lifetime counters
pub(crate) fn lifetime_add(
    current: Option<LifetimeStat>,
    stat: &DailyStat,
    now: TimestampMs,
) -> LifetimeStat {
    let mut lifetime = current.unwrap_or_else(|| LifetimeStat {
        key: stat.key.clone(),
        ..Default::default()
    });
    lifetime.volume += stat.volume;
    lifetime.fees += stat.fees;
    lifetime.trade_count += stat.trade_count;
    lifetime.updated_at = now;
    lifetime
}

/// Realization applied by daily settlement: move unrealized into realized
pub(crate) fn realize(position: &mut Position, epoch: i64, now: TimestampMs) -> Decimal {
    let credited = position.unrealized_pnl;
    position.realized_pnl += credited;
    position.unrealized_pnl = Decimal::ZERO;
    position.last_settled_epoch = Some(epoch);
    position.updated_at = now;
    credited
}
