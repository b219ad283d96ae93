//! In-memory ledger store
//!
//! DashMap per table. Conditional writes hold the owning row's shard guard
//! for the whole read-check-write, which gives the same at-most-once
//! behaviour as the conditional updates of the PostgreSQL backend.
//!
//! Lock order is always: positions/orders/daily -> applied -> balances/lifetime.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use super::cursor::{decode_opt, paginate};
use super::{
    CHANGE_FEED_CAPACITY, ChangeKind, ChangeRecord, LedgerStore, MarketCursor, Page,
    PositionCursor, StoreError, TradeCursor, daily_pnl_key, lifetime_add, order_change, realize,
    trade_change,
};
use crate::core_types::{Asset, MarketSymbol, Mode, TimestampMs, TradeId, market_partition, now_ms};
use crate::models::{
    Balance, BalanceDelta, BalanceKey, DailyStat, DeltaOutcome, ExpireOutcome, IntradayStat,
    IntradayUpdate, LifetimeStat, Market, MarketStatus, Order, OrderKey, OrderStatus, Position,
    PositionKey, PriceSnapshot, SettleOutcome, Trade,
};

type TradeBook = BTreeMap<(TimestampMs, TradeId), Trade>;

pub struct MemoryLedgerStore {
    balances: DashMap<BalanceKey, Balance>,
    /// idempotency key -> applied_at
    applied: DashMap<String, TimestampMs>,
    positions: DashMap<PositionKey, Position>,
    orders: DashMap<OrderKey, Order>,
    /// `<market>#<mode>` -> trades ordered by (timestamp, trade_id)
    trades: DashMap<String, TradeBook>,
    markets: DashMap<(MarketSymbol, Mode), Market>,
    prices: DashMap<Asset, BTreeMap<TimestampMs, PriceSnapshot>>,
    intraday: DashMap<(String, TimestampMs), IntradayStat>,
    daily: DashMap<(String, NaiveDate), DailyStat>,
    lifetime: DashMap<String, LifetimeStat>,
    cursors: DashMap<String, i64>,
    changes: broadcast::Sender<ChangeRecord>,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            balances: DashMap::new(),
            applied: DashMap::new(),
            positions: DashMap::new(),
            orders: DashMap::new(),
            trades: DashMap::new(),
            markets: DashMap::new(),
            prices: DashMap::new(),
            intraday: DashMap::new(),
            daily: DashMap::new(),
            lifetime: DashMap::new(),
            cursors: DashMap::new(),
            changes,
        }
    }

    fn emit(&self, record: ChangeRecord) {
        // No subscribers is fine
        let _ = self.changes.send(record);
    }

    fn apply_delta_sync(&self, delta: &BalanceDelta) -> DeltaOutcome {
        let now = now_ms();
        // Keep the marker guard alive until the balance write is done
        let _marker = match &delta.idempotency_key {
            Some(key) => match self.applied.entry(key.clone()) {
                Entry::Occupied(_) => return DeltaOutcome::Duplicate,
                Entry::Vacant(slot) => Some(slot.insert(now)),
            },
            None => None,
        };

        let mut row = self
            .balances
            .entry(delta.key.clone())
            .or_insert_with(|| Balance {
                trader_id: delta.key.trader_id.clone(),
                asset: delta.key.asset.clone(),
                mode: delta.key.mode,
                balance: Decimal::ZERO,
                pending: Decimal::ZERO,
                updated_at: now,
            });
        row.balance += delta.amount;
        row.updated_at = now;
        DeltaOutcome::Applied {
            balance: row.balance,
        }
    }

    fn revoke_delta_sync(&self, delta: &BalanceDelta) -> DeltaOutcome {
        let Some(key) = &delta.idempotency_key else {
            return DeltaOutcome::Duplicate;
        };
        let Entry::Occupied(marker) = self.applied.entry(key.clone()) else {
            return DeltaOutcome::Duplicate;
        };
        let outcome = self.apply_delta_sync(&BalanceDelta::new(delta.key.clone(), -delta.amount));
        marker.remove();
        outcome
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn apply_delta(&self, delta: &BalanceDelta) -> Result<DeltaOutcome, StoreError> {
        Ok(self.apply_delta_sync(delta))
    }

    async fn revoke_delta(&self, delta: &BalanceDelta) -> Result<DeltaOutcome, StoreError> {
        Ok(self.revoke_delta_sync(delta))
    }

    async fn get_balance(&self, key: &BalanceKey) -> Result<Option<Balance>, StoreError> {
        Ok(self.balances.get(key).map(|b| b.clone()))
    }

    async fn get_balances(&self, trader_id: &str, mode: Mode) -> Result<Vec<Balance>, StoreError> {
        let mut rows: Vec<Balance> = self
            .balances
            .iter()
            .filter(|b| b.trader_id == trader_id && b.mode == mode)
            .map(|b| b.clone())
            .collect();
        rows.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(rows)
    }

    async fn put_position(&self, position: &Position) -> Result<(), StoreError> {
        self.positions.insert(position.key(), position.clone());
        Ok(())
    }

    async fn get_position(&self, key: &PositionKey) -> Result<Option<Position>, StoreError> {
        Ok(self.positions.get(key).map(|p| p.clone()))
    }

    async fn get_positions(&self, trader_id: &str) -> Result<Vec<Position>, StoreError> {
        let mut rows: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| p.trader_id == trader_id)
            .map(|p| p.clone())
            .collect();
        rows.sort_by(|a, b| a.market.cmp(&b.market));
        Ok(rows)
    }

    async fn scan_open_positions(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<Position>, StoreError> {
        let after: Option<PositionCursor> = decode_opt(cursor)?;
        let mut rows: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| p.is_open())
            .filter(|p| match &after {
                Some(c) => (&p.trader_id, &p.market) > (&c.trader_id, &c.market),
                None => true,
            })
            .map(|p| p.clone())
            .collect();
        rows.sort_by(|a, b| (&a.trader_id, &a.market).cmp(&(&b.trader_id, &b.market)));
        rows.truncate(limit + 1);
        paginate(rows, limit, |p| PositionCursor {
            trader_id: p.trader_id.clone(),
            market: p.market.clone(),
        })
    }

    async fn settle_position(
        &self,
        key: &PositionKey,
        quote_asset: &str,
        epoch: i64,
        now: TimestampMs,
    ) -> Result<SettleOutcome, StoreError> {
        let Some(mut position) = self.positions.get_mut(key) else {
            return Ok(SettleOutcome::NotFound);
        };
        if position.last_settled_epoch.is_some_and(|e| e >= epoch) {
            return Ok(SettleOutcome::AlreadySettled);
        }
        if position.unrealized_pnl.is_zero() {
            return Ok(SettleOutcome::NothingToSettle);
        }

        let credit = BalanceDelta::new(
            BalanceKey::new(position.trader_id.clone(), quote_asset, position.mode),
            position.unrealized_pnl,
        )
        .with_idempotency_key(daily_pnl_key(key, epoch));
        self.apply_delta_sync(&credit);

        let credited = realize(&mut position, epoch, now);
        Ok(SettleOutcome::Settled { credited })
    }

    async fn put_order(&self, order: &Order) -> Result<(), StoreError> {
        let kind = match self.orders.insert(order.key(), order.clone()) {
            Some(_) => ChangeKind::Modify,
            None => ChangeKind::Insert,
        };
        self.emit(order_change(order, kind)?);
        Ok(())
    }

    async fn get_order(&self, key: &OrderKey) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(key).map(|o| o.clone()))
    }

    async fn query_expirable_orders(
        &self,
        now: TimestampMs,
        limit: usize,
    ) -> Result<Vec<Order>, StoreError> {
        let mut rows: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| {
                o.status == OrderStatus::Open
                    && o.order_type.is_expiring()
                    && o.settled_at.is_none()
                    && o.is_expired_at(now)
            })
            .map(|o| o.clone())
            .collect();
        rows.sort_by_key(|o| (o.expiry_ts, o.order_id.clone()));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn expire_order(
        &self,
        key: &OrderKey,
        payoff: Option<&BalanceDelta>,
        now: TimestampMs,
    ) -> Result<ExpireOutcome, StoreError> {
        let record = {
            let Some(mut order) = self.orders.get_mut(key) else {
                return Ok(ExpireOutcome::NotFound);
            };
            if order.status != OrderStatus::Open || order.settled_at.is_some() {
                return Ok(ExpireOutcome::AlreadyFinal);
            }
            if let Some(delta) = payoff {
                self.apply_delta_sync(delta);
            }
            order.status = OrderStatus::Expired;
            order.settled_at = Some(now);
            order_change(&order, ChangeKind::Modify)?
        };
        self.emit(record);
        Ok(ExpireOutcome::Expired {
            payoff: payoff.map(|d| d.amount).unwrap_or_default(),
        })
    }

    async fn append_trade(&self, trade: &Trade) -> Result<bool, StoreError> {
        let inserted = {
            let mut book = self
                .trades
                .entry(market_partition(&trade.market, trade.mode))
                .or_default();
            let key = (trade.timestamp, trade.trade_id.clone());
            if book.contains_key(&key) {
                false
            } else {
                book.insert(key, trade.clone());
                true
            }
        };
        if inserted {
            self.emit(trade_change(trade)?);
        }
        Ok(inserted)
    }

    async fn query_market_trades(
        &self,
        market: &str,
        mode: Mode,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Trade>, StoreError> {
        let before: Option<TradeCursor> = decode_opt(cursor)?;
        let Some(book) = self.trades.get(&market_partition(market, mode)) else {
            return Ok(Page::empty());
        };
        let rows: Vec<Trade> = match before {
            Some(c) => book
                .range(..(c.timestamp, c.trade_id))
                .rev()
                .take(limit + 1)
                .map(|(_, t)| t.clone())
                .collect(),
            None => book.values().rev().take(limit + 1).cloned().collect(),
        };
        paginate(rows, limit, trade_cursor)
    }

    async fn latest_market_trade(
        &self,
        market: &str,
        mode: Mode,
        funding: bool,
    ) -> Result<Option<Trade>, StoreError> {
        Ok(self
            .trades
            .get(&market_partition(market, mode))
            .and_then(|book| book.values().rev().find(|t| t.is_funding() == funding).cloned()))
    }

    async fn query_trader_trades(
        &self,
        trader_id: &str,
        mode: Mode,
        market: Option<&str>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Trade>, StoreError> {
        let before: Option<TradeCursor> = decode_opt(cursor)?;
        let mut rows: Vec<Trade> = Vec::new();
        for book in self.trades.iter() {
            for trade in book.values() {
                if trade.mode != mode || trade.trader_id.as_deref() != Some(trader_id) {
                    continue;
                }
                if market.is_some_and(|m| m != trade.market) {
                    continue;
                }
                if let Some(c) = &before {
                    if (trade.timestamp, &trade.trade_id) >= (c.timestamp, &c.trade_id) {
                        continue;
                    }
                }
                rows.push(trade.clone());
            }
        }
        rows.sort_by(|a, b| (b.timestamp, &b.trade_id).cmp(&(a.timestamp, &a.trade_id)));
        rows.truncate(limit + 1);
        paginate(rows, limit, trade_cursor)
    }

    async fn put_market(&self, market: &Market) -> Result<(), StoreError> {
        self.markets
            .insert((market.symbol.clone(), market.mode), market.clone());
        Ok(())
    }

    async fn get_market(&self, symbol: &str, mode: Mode) -> Result<Option<Market>, StoreError> {
        Ok(self
            .markets
            .get(&(symbol.to_string(), mode))
            .map(|m| m.clone()))
    }

    async fn query_markets(
        &self,
        mode: Mode,
        status: Option<MarketStatus>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Market>, StoreError> {
        let after: Option<MarketCursor> = decode_opt(cursor)?;
        let mut rows: Vec<Market> = self
            .markets
            .iter()
            .filter(|m| m.mode == mode && status.is_none_or(|s| m.status == s))
            .filter(|m| after.as_ref().is_none_or(|c| m.symbol > c.symbol))
            .map(|m| m.clone())
            .collect();
        rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        rows.truncate(limit + 1);
        paginate(rows, limit, |m| MarketCursor {
            symbol: m.symbol.clone(),
        })
    }

    async fn put_price_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError> {
        self.prices
            .entry(snapshot.asset.clone())
            .or_default()
            .insert(snapshot.timestamp, snapshot.clone());
        Ok(())
    }

    async fn latest_price(
        &self,
        asset: &str,
        now: TimestampMs,
    ) -> Result<Option<PriceSnapshot>, StoreError> {
        Ok(self.prices.get(asset).and_then(|series| {
            series
                .values()
                .rev()
                .find(|s| s.expires_at > now)
                .cloned()
        }))
    }

    async fn purge_expired_prices(&self, now: TimestampMs) -> Result<u64, StoreError> {
        let mut purged = 0u64;
        for mut series in self.prices.iter_mut() {
            let before = series.len();
            series.retain(|_, s| s.expires_at > now);
            purged += (before - series.len()) as u64;
        }
        self.prices.retain(|_, series| !series.is_empty());
        Ok(purged)
    }

    async fn upsert_intraday(&self, update: &IntradayUpdate) -> Result<(), StoreError> {
        let mut row = self
            .intraday
            .entry((update.key.clone(), update.bucket))
            .or_insert_with(|| IntradayStat {
                key: update.key.clone(),
                bucket: update.bucket,
                ..Default::default()
            });
        row.volume += update.volume;
        row.fees += update.fees;
        row.trade_count += update.trade_count;
        if let Some(rate) = update.funding_rate {
            row.funding_rate = Some(rate);
        }
        if let Some(oi) = update.open_interest {
            row.open_interest = oi;
        }
        Ok(())
    }

    async fn query_intraday(
        &self,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<Vec<IntradayStat>, StoreError> {
        let mut rows: Vec<IntradayStat> = self
            .intraday
            .iter()
            .filter(|r| r.bucket >= from && r.bucket < to)
            .map(|r| r.clone())
            .collect();
        rows.sort_by(|a, b| (&a.key, a.bucket).cmp(&(&b.key, b.bucket)));
        Ok(rows)
    }

    async fn put_daily_stat(&self, stat: &DailyStat, now: TimestampMs) -> Result<bool, StoreError> {
        match self.daily.entry((stat.key.clone(), stat.date)) {
            Entry::Occupied(mut row) => {
                row.insert(stat.clone());
                Ok(false)
            }
            Entry::Vacant(slot) => {
                let _row = slot.insert(stat.clone());
                let current = self.lifetime.get(&stat.key).map(|l| l.clone());
                self.lifetime
                    .insert(stat.key.clone(), lifetime_add(current, stat, now));
                Ok(true)
            }
        }
    }

    async fn get_daily_stats(&self, date: NaiveDate) -> Result<Vec<DailyStat>, StoreError> {
        let mut rows: Vec<DailyStat> = self
            .daily
            .iter()
            .filter(|d| d.date == date)
            .map(|d| d.clone())
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }

    async fn get_lifetime(&self, key: &str) -> Result<Option<LifetimeStat>, StoreError> {
        Ok(self.lifetime.get(key).map(|l| l.clone()))
    }

    async fn get_cursor(&self, name: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.cursors.get(name).map(|c| *c))
    }

    async fn put_cursor(&self, name: &str, value: i64) -> Result<(), StoreError> {
        self.cursors.insert(name.to_string(), value);
        Ok(())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeRecord> {
        self.changes.subscribe()
    }
}

fn trade_cursor(trade: &Trade) -> TradeCursor {
    TradeCursor {
        timestamp: trade.timestamp,
        trade_id: trade.trade_id.clone(),
    }
}
