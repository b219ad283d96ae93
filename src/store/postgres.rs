//! PostgreSQL ledger store
//!
//! Conditional operations (settlement, expiry, daily rollup) run inside a
//! transaction that row-locks the guarded record with `FOR UPDATE`.
//! Change records are published with `pg_notify` inside the writing
//! transaction, so they are delivered only on commit, to every instance
//! listening on [`CHANGE_CHANNEL`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgListener, PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, Row};
use tokio::sync::broadcast;

use super::cursor::{decode_opt, paginate};
use super::{
    CHANGE_FEED_CAPACITY, ChangeKind, ChangeRecord, LedgerStore, MarketCursor, Page,
    PositionCursor, StoreError, TradeCursor, daily_pnl_key, order_change, realize, trade_change,
};
use crate::core_types::{Mode, TimestampMs, now_ms};
use crate::db::Database;
use crate::models::{
    Balance, BalanceDelta, BalanceKey, DailyStat, DeltaOutcome, ExpireOutcome, IntradayStat,
    IntradayUpdate, LifetimeStat, Market, MarketStatus, Order, OrderKey, OrderStatus, Position,
    PositionKey, PriceSnapshot, SettleOutcome, Trade, TradeMeta,
};

/// LISTEN/NOTIFY channel carrying serialized [`ChangeRecord`]s
pub const CHANGE_CHANNEL: &str = "ledger_changes";

const LISTENER_RETRY: Duration = Duration::from_secs(1);

pub struct PgLedgerStore {
    db: Database,
    changes: broadcast::Sender<ChangeRecord>,
}

impl PgLedgerStore {
    /// Wrap a connected database and start forwarding change notifications.
    /// Must be called inside a tokio runtime.
    pub fn new(db: Database) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        tokio::spawn(forward_changes(db.pool().clone(), changes.clone()));
        Self { db, changes }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn pool(&self) -> &PgPool {
        self.db.pool()
    }
}

/// Relay NOTIFY payloads into the in-process broadcast, reconnecting on error
async fn forward_changes(pool: PgPool, changes: broadcast::Sender<ChangeRecord>) {
    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "Change feed listener connect failed");
                tokio::time::sleep(LISTENER_RETRY).await;
                continue;
            }
        };
        if let Err(e) = listener.listen(CHANGE_CHANNEL).await {
            tracing::warn!(error = %e, "LISTEN {} failed", CHANGE_CHANNEL);
            tokio::time::sleep(LISTENER_RETRY).await;
            continue;
        }
        tracing::info!(channel = CHANGE_CHANNEL, "Change feed listener started");

        loop {
            match listener.recv().await {
                Ok(notification) => {
                    match serde_json::from_str::<ChangeRecord>(notification.payload()) {
                        Ok(record) => {
                            let _ = changes.send(record);
                        }
                        Err(e) => tracing::warn!(error = %e, "Malformed change notification"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Change feed listener dropped, reconnecting");
                    break;
                }
            }
        }
        tokio::time::sleep(LISTENER_RETRY).await;
    }
}

async fn notify(conn: &mut PgConnection, record: &ChangeRecord) -> Result<(), StoreError> {
    let payload = serde_json::to_string(record)?;
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CHANGE_CHANNEL)
        .bind(payload)
        .execute(conn)
        .await?;
    Ok(())
}

/// Idempotency marker + additive upsert, on a caller-owned transaction
async fn apply_delta_tx(
    conn: &mut PgConnection,
    delta: &BalanceDelta,
) -> Result<DeltaOutcome, StoreError> {
    let now = now_ms();
    if let Some(key) = &delta.idempotency_key {
        let inserted = sqlx::query(
            r#"INSERT INTO balance_deltas (idempotency_key, trader_id, asset, mode, amount, applied_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (idempotency_key) DO NOTHING"#,
        )
        .bind(key)
        .bind(&delta.key.trader_id)
        .bind(&delta.key.asset)
        .bind(delta.key.mode.as_str())
        .bind(delta.amount)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        if inserted == 0 {
            return Ok(DeltaOutcome::Duplicate);
        }
    }

    let row = sqlx::query(
        r#"INSERT INTO balances (trader_id, asset, mode, balance, pending, updated_at)
           VALUES ($1, $2, $3, $4, 0, $5)
           ON CONFLICT (trader_id, asset, mode)
           DO UPDATE SET balance = balances.balance + EXCLUDED.balance,
                         updated_at = EXCLUDED.updated_at
           RETURNING balance"#,
    )
    .bind(&delta.key.trader_id)
    .bind(&delta.key.asset)
    .bind(delta.key.mode.as_str())
    .bind(delta.amount)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(DeltaOutcome::Applied {
        balance: row.try_get("balance")?,
    })
}

async fn revoke_delta_tx(
    conn: &mut PgConnection,
    delta: &BalanceDelta,
) -> Result<DeltaOutcome, StoreError> {
    let Some(key) = &delta.idempotency_key else {
        return Ok(DeltaOutcome::Duplicate);
    };
    let released = sqlx::query("DELETE FROM balance_deltas WHERE idempotency_key = $1")
        .bind(key)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if released == 0 {
        return Ok(DeltaOutcome::Duplicate);
    }

    let row = sqlx::query(
        r#"INSERT INTO balances (trader_id, asset, mode, balance, pending, updated_at)
           VALUES ($1, $2, $3, $4, 0, $5)
           ON CONFLICT (trader_id, asset, mode)
           DO UPDATE SET balance = balances.balance + EXCLUDED.balance,
                         updated_at = EXCLUDED.updated_at
           RETURNING balance"#,
    )
    .bind(&delta.key.trader_id)
    .bind(&delta.key.asset)
    .bind(delta.key.mode.as_str())
    .bind(-delta.amount)
    .bind(now_ms())
    .fetch_one(&mut *conn)
    .await?;

    Ok(DeltaOutcome::Applied {
        balance: row.try_get("balance")?,
    })
}

// ============================================================
// ROW MAPPING
// ============================================================

fn parse_enum<T: DeserializeOwned>(column: &str, raw: String) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw))
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", column, e)))
}

fn parse_mode(row: &PgRow) -> Result<Mode, StoreError> {
    let raw: String = row.try_get("mode")?;
    raw.parse().map_err(StoreError::Corrupt)
}

fn opt_u64(row: &PgRow, column: &str) -> Result<Option<u64>, StoreError> {
    let raw: Option<i64> = row.try_get(column)?;
    Ok(raw.map(|v| v.max(0) as u64))
}

fn count(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let raw: i64 = row.try_get(column)?;
    Ok(raw.max(0) as u64)
}

fn balance_from_row(row: &PgRow) -> Result<Balance, StoreError> {
    Ok(Balance {
        trader_id: row.try_get("trader_id")?,
        asset: row.try_get("asset")?,
        mode: parse_mode(row)?,
        balance: row.try_get("balance")?,
        pending: row.try_get("pending")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn position_from_row(row: &PgRow) -> Result<Position, StoreError> {
    Ok(Position {
        trader_id: row.try_get("trader_id")?,
        market: row.try_get("market")?,
        mode: parse_mode(row)?,
        size: row.try_get("size")?,
        avg_entry_price: row.try_get("avg_entry_price")?,
        unrealized_pnl: row.try_get("unrealized_pnl")?,
        realized_pnl: row.try_get("realized_pnl")?,
        last_settled_epoch: row.try_get("last_settled_epoch")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let option_kind: Option<String> = row.try_get("option_kind")?;
    Ok(Order {
        market: row.try_get("market")?,
        mode: parse_mode(row)?,
        order_id: row.try_get("order_id")?,
        trader_id: row.try_get("trader_id")?,
        order_type: parse_enum("order_type", row.try_get("order_type")?)?,
        status: parse_enum("status", row.try_get("status")?)?,
        side: parse_enum("side", row.try_get("side")?)?,
        price: row.try_get("price")?,
        qty: row.try_get("qty")?,
        option_kind: option_kind
            .map(|k| parse_enum("option_kind", k))
            .transpose()?,
        expiry_ts: row.try_get("expiry_ts")?,
        settled_at: row.try_get("settled_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn trade_from_row(row: &PgRow) -> Result<Trade, StoreError> {
    let meta: Option<Json<TradeMeta>> = row.try_get("meta")?;
    Ok(Trade {
        market: row.try_get("market")?,
        mode: parse_mode(row)?,
        trade_id: row.try_get("trade_id")?,
        trader_id: row.try_get("trader_id")?,
        side: parse_enum("side", row.try_get("side")?)?,
        price: row.try_get("price")?,
        qty: row.try_get("qty")?,
        fee: row.try_get("fee")?,
        timestamp: row.try_get("ts")?,
        meta: meta.map(|m| m.0),
    })
}

fn market_from_row(row: &PgRow) -> Result<Market, StoreError> {
    Ok(Market {
        symbol: row.try_get("symbol")?,
        mode: parse_mode(row)?,
        market_type: parse_enum("market_type", row.try_get("market_type")?)?,
        status: parse_enum("status", row.try_get("status")?)?,
        underlying: row.try_get("underlying")?,
        tick_size: row.try_get("tick_size")?,
        lot_size: row.try_get("lot_size")?,
        funding_interval_sec: opt_u64(row, "funding_interval_sec")?,
        expiry_ts: row.try_get("expiry_ts")?,
    })
}

fn price_from_row(row: &PgRow) -> Result<PriceSnapshot, StoreError> {
    Ok(PriceSnapshot {
        asset: row.try_get("asset")?,
        price: row.try_get("price")?,
        timestamp: row.try_get("ts")?,
        source: row.try_get("source")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn intraday_from_row(row: &PgRow) -> Result<IntradayStat, StoreError> {
    Ok(IntradayStat {
        key: row.try_get("stat_key")?,
        bucket: row.try_get("bucket")?,
        volume: row.try_get("volume")?,
        fees: row.try_get("fees")?,
        funding_rate: row.try_get("funding_rate")?,
        open_interest: row.try_get("open_interest")?,
        trade_count: count(row, "trade_count")?,
    })
}

fn daily_from_row(row: &PgRow) -> Result<DailyStat, StoreError> {
    Ok(DailyStat {
        key: row.try_get("stat_key")?,
        date: row.try_get("date")?,
        volume: row.try_get("volume")?,
        fees: row.try_get("fees")?,
        avg_funding_rate: row.try_get("avg_funding_rate")?,
        trade_count: count(row, "trade_count")?,
    })
}

fn lifetime_from_row(row: &PgRow) -> Result<LifetimeStat, StoreError> {
    Ok(LifetimeStat {
        key: row.try_get("stat_key")?,
        volume: row.try_get("volume")?,
        fees: row.try_get("fees")?,
        trade_count: count(row, "trade_count")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn collect<T>(
    rows: Vec<PgRow>,
    map: fn(&PgRow) -> Result<T, StoreError>,
) -> Result<Vec<T>, StoreError> {
    rows.iter().map(map).collect()
}

fn trade_cursor(trade: &Trade) -> TradeCursor {
    TradeCursor {
        timestamp: trade.timestamp,
        trade_id: trade.trade_id.clone(),
    }
}

fn fetch_limit(limit: usize) -> i64 {
    (limit as i64).saturating_add(1)
}

const POSITION_COLUMNS: &str = "trader_id, market, mode, size, avg_entry_price, unrealized_pnl, \
     realized_pnl, last_settled_epoch, updated_at";
const ORDER_COLUMNS: &str = "market, mode, order_id, trader_id, order_type, status, side, price, \
     qty, option_kind, expiry_ts, settled_at, created_at";
const TRADE_COLUMNS: &str = "market, mode, trade_id, trader_id, side, price, qty, fee, ts, meta";

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn apply_delta(&self, delta: &BalanceDelta) -> Result<DeltaOutcome, StoreError> {
        let mut tx = self.pool().begin().await?;
        let outcome = apply_delta_tx(&mut tx, delta).await?;
        match outcome {
            DeltaOutcome::Duplicate => tx.rollback().await?,
            DeltaOutcome::Applied { .. } => tx.commit().await?,
        }
        Ok(outcome)
    }

    async fn revoke_delta(&self, delta: &BalanceDelta) -> Result<DeltaOutcome, StoreError> {
        let mut tx = self.pool().begin().await?;
        let outcome = revoke_delta_tx(&mut tx, delta).await?;
        match outcome {
            DeltaOutcome::Duplicate => tx.rollback().await?,
            DeltaOutcome::Applied { .. } => tx.commit().await?,
        }
        Ok(outcome)
    }

    async fn get_balance(&self, key: &BalanceKey) -> Result<Option<Balance>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM balances WHERE trader_id = $1 AND asset = $2 AND mode = $3",
        )
        .bind(&key.trader_id)
        .bind(&key.asset)
        .bind(key.mode.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(balance_from_row).transpose()
    }

    async fn get_balances(&self, trader_id: &str, mode: Mode) -> Result<Vec<Balance>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM balances WHERE trader_id = $1 AND mode = $2 ORDER BY asset",
        )
        .bind(trader_id)
        .bind(mode.as_str())
        .fetch_all(self.pool())
        .await?;
        collect(rows, balance_from_row)
    }

    async fn put_position(&self, position: &Position) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO positions (trader_id, market, mode, size, avg_entry_price,
                   unrealized_pnl, realized_pnl, last_settled_epoch, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (trader_id, market) DO UPDATE SET
                   mode = EXCLUDED.mode,
                   size = EXCLUDED.size,
                   avg_entry_price = EXCLUDED.avg_entry_price,
                   unrealized_pnl = EXCLUDED.unrealized_pnl,
                   realized_pnl = EXCLUDED.realized_pnl,
                   last_settled_epoch = EXCLUDED.last_settled_epoch,
                   updated_at = EXCLUDED.updated_at"#,
        )
        .bind(&position.trader_id)
        .bind(&position.market)
        .bind(position.mode.as_str())
        .bind(position.size)
        .bind(position.avg_entry_price)
        .bind(position.unrealized_pnl)
        .bind(position.realized_pnl)
        .bind(position.last_settled_epoch)
        .bind(position.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_position(&self, key: &PositionKey) -> Result<Option<Position>, StoreError> {
        let sql = format!(
            "SELECT {} FROM positions WHERE trader_id = $1 AND market = $2",
            POSITION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&key.trader_id)
            .bind(&key.market)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    async fn get_positions(&self, trader_id: &str) -> Result<Vec<Position>, StoreError> {
        let sql = format!(
            "SELECT {} FROM positions WHERE trader_id = $1 ORDER BY market",
            POSITION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(trader_id)
            .fetch_all(self.pool())
            .await?;
        collect(rows, position_from_row)
    }

    async fn scan_open_positions(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<Position>, StoreError> {
        let after: Option<PositionCursor> = decode_opt(cursor)?;
        let (after_trader, after_market) = match after {
            Some(c) => (Some(c.trader_id), Some(c.market)),
            None => (None, None),
        };
        let sql = format!(
            r#"SELECT {} FROM positions
               WHERE size <> 0
                 AND ($1::TEXT IS NULL OR (trader_id, market) > ($1::TEXT, $2::TEXT))
               ORDER BY trader_id, market
               LIMIT $3"#,
            POSITION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(after_trader)
            .bind(after_market)
            .bind(fetch_limit(limit))
            .fetch_all(self.pool())
            .await?;
        paginate(collect(rows, position_from_row)?, limit, |p| {
            PositionCursor {
                trader_id: p.trader_id.clone(),
                market: p.market.clone(),
            }
        })
    }

    async fn settle_position(
        &self,
        key: &PositionKey,
        quote_asset: &str,
        epoch: i64,
        now: TimestampMs,
    ) -> Result<SettleOutcome, StoreError> {
        let mut tx = self.pool().begin().await?;
        let sql = format!(
            "SELECT {} FROM positions WHERE trader_id = $1 AND market = $2 FOR UPDATE",
            POSITION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&key.trader_id)
            .bind(&key.market)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(SettleOutcome::NotFound);
        };
        let mut position = position_from_row(&row)?;
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
        apply_delta_tx(&mut tx, &credit).await?;

        let credited = realize(&mut position, epoch, now);
        sqlx::query(
            r#"UPDATE positions
               SET realized_pnl = $3, unrealized_pnl = $4, last_settled_epoch = $5, updated_at = $6
               WHERE trader_id = $1 AND market = $2"#,
        )
        .bind(&key.trader_id)
        .bind(&key.market)
        .bind(position.realized_pnl)
        .bind(position.unrealized_pnl)
        .bind(position.last_settled_epoch)
        .bind(position.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(SettleOutcome::Settled { credited })
    }

    async fn put_order(&self, order: &Order) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query(
            r#"INSERT INTO orders (market, mode, order_id, trader_id, order_type, status, side,
                   price, qty, option_kind, expiry_ts, settled_at, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
               ON CONFLICT (market, mode, order_id) DO UPDATE SET
                   trader_id = EXCLUDED.trader_id,
                   order_type = EXCLUDED.order_type,
                   status = EXCLUDED.status,
                   side = EXCLUDED.side,
                   price = EXCLUDED.price,
                   qty = EXCLUDED.qty,
                   option_kind = EXCLUDED.option_kind,
                   expiry_ts = EXCLUDED.expiry_ts,
                   settled_at = EXCLUDED.settled_at
               RETURNING (xmax = 0) AS inserted"#,
        )
        .bind(&order.market)
        .bind(order.mode.as_str())
        .bind(&order.order_id)
        .bind(&order.trader_id)
        .bind(order.order_type.to_string())
        .bind(order.status.to_string())
        .bind(order.side.to_string())
        .bind(order.price)
        .bind(order.qty)
        .bind(order.option_kind.map(|k| k.to_string()))
        .bind(order.expiry_ts)
        .bind(order.settled_at)
        .bind(order.created_at)
        .fetch_one(&mut *tx)
        .await?;
        let inserted: bool = row.try_get("inserted")?;
        let kind = if inserted {
            ChangeKind::Insert
        } else {
            ChangeKind::Modify
        };
        notify(&mut tx, &order_change(order, kind)?).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_order(&self, key: &OrderKey) -> Result<Option<Order>, StoreError> {
        let sql = format!(
            "SELECT {} FROM orders WHERE market = $1 AND mode = $2 AND order_id = $3",
            ORDER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&key.market)
            .bind(key.mode.as_str())
            .bind(&key.order_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn query_expirable_orders(
        &self,
        now: TimestampMs,
        limit: usize,
    ) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            r#"SELECT {} FROM orders
               WHERE status = 'OPEN'
                 AND order_type IN ('OPTION', 'FUTURE')
                 AND settled_at IS NULL
                 AND expiry_ts < $1
               ORDER BY expiry_ts, order_id
               LIMIT $2"#,
            ORDER_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        collect(rows, order_from_row)
    }

    async fn expire_order(
        &self,
        key: &OrderKey,
        payoff: Option<&BalanceDelta>,
        now: TimestampMs,
    ) -> Result<ExpireOutcome, StoreError> {
        let mut tx = self.pool().begin().await?;
        let sql = format!(
            "SELECT {} FROM orders WHERE market = $1 AND mode = $2 AND order_id = $3 FOR UPDATE",
            ORDER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&key.market)
            .bind(key.mode.as_str())
            .bind(&key.order_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(ExpireOutcome::NotFound);
        };
        let mut order = order_from_row(&row)?;
        if order.status != OrderStatus::Open || order.settled_at.is_some() {
            return Ok(ExpireOutcome::AlreadyFinal);
        }

        if let Some(delta) = payoff {
            apply_delta_tx(&mut tx, delta).await?;
        }
        sqlx::query(
            r#"UPDATE orders SET status = 'EXPIRED', settled_at = $4
               WHERE market = $1 AND mode = $2 AND order_id = $3"#,
        )
        .bind(&key.market)
        .bind(key.mode.as_str())
        .bind(&key.order_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        order.status = OrderStatus::Expired;
        order.settled_at = Some(now);
        notify(&mut tx, &order_change(&order, ChangeKind::Modify)?).await?;
        tx.commit().await?;

        Ok(ExpireOutcome::Expired {
            payoff: payoff.map(|d| d.amount).unwrap_or_default(),
        })
    }

    async fn append_trade(&self, trade: &Trade) -> Result<bool, StoreError> {
        let mut tx = self.pool().begin().await?;
        let inserted = sqlx::query(
            r#"INSERT INTO trades (market, mode, trade_id, trader_id, side, price, qty, fee, ts, meta)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT (market, mode, ts, trade_id) DO NOTHING"#,
        )
        .bind(&trade.market)
        .bind(trade.mode.as_str())
        .bind(&trade.trade_id)
        .bind(&trade.trader_id)
        .bind(trade.side.to_string())
        .bind(trade.price)
        .bind(trade.qty)
        .bind(trade.fee)
        .bind(trade.timestamp)
        .bind(trade.meta.clone().map(Json))
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        if inserted {
            notify(&mut tx, &trade_change(trade)?).await?;
        }
        tx.commit().await?;
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
        let (before_ts, before_id) = match before {
            Some(c) => (Some(c.timestamp), Some(c.trade_id)),
            None => (None, None),
        };
        let sql = format!(
            r#"SELECT {} FROM trades
               WHERE market = $1 AND mode = $2
                 AND ($3::BIGINT IS NULL OR (ts, trade_id) < ($3::BIGINT, $4::TEXT))
               ORDER BY ts DESC, trade_id DESC
               LIMIT $5"#,
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(market)
            .bind(mode.as_str())
            .bind(before_ts)
            .bind(before_id)
            .bind(fetch_limit(limit))
            .fetch_all(self.pool())
            .await?;
        paginate(collect(rows, trade_from_row)?, limit, trade_cursor)
    }

    async fn latest_market_trade(
        &self,
        market: &str,
        mode: Mode,
        funding: bool,
    ) -> Result<Option<Trade>, StoreError> {
        let sql = format!(
            r#"SELECT {} FROM trades
               WHERE market = $1 AND mode = $2
                 AND ((meta ->> 'fundingRate') IS NOT NULL) = $3
               ORDER BY ts DESC, trade_id DESC
               LIMIT 1"#,
            TRADE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(market)
            .bind(mode.as_str())
            .bind(funding)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(trade_from_row).transpose()
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
        let (before_ts, before_id) = match before {
            Some(c) => (Some(c.timestamp), Some(c.trade_id)),
            None => (None, None),
        };
        let sql = format!(
            r#"SELECT {} FROM trades
               WHERE trader_id = $1 AND mode = $2
                 AND ($3::TEXT IS NULL OR market = $3::TEXT)
                 AND ($4::BIGINT IS NULL OR (ts, trade_id) < ($4::BIGINT, $5::TEXT))
               ORDER BY ts DESC, trade_id DESC
               LIMIT $6"#,
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(trader_id)
            .bind(mode.as_str())
            .bind(market)
            .bind(before_ts)
            .bind(before_id)
            .bind(fetch_limit(limit))
            .fetch_all(self.pool())
            .await?;
        paginate(collect(rows, trade_from_row)?, limit, trade_cursor)
    }

    async fn put_market(&self, market: &Market) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO markets (symbol, mode, market_type, status, underlying, tick_size,
                   lot_size, funding_interval_sec, expiry_ts)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (symbol, mode) DO UPDATE SET
                   market_type = EXCLUDED.market_type,
                   status = EXCLUDED.status,
                   underlying = EXCLUDED.underlying,
                   tick_size = EXCLUDED.tick_size,
                   lot_size = EXCLUDED.lot_size,
                   funding_interval_sec = EXCLUDED.funding_interval_sec,
                   expiry_ts = EXCLUDED.expiry_ts"#,
        )
        .bind(&market.symbol)
        .bind(market.mode.as_str())
        .bind(market.market_type.to_string())
        .bind(market.status.to_string())
        .bind(&market.underlying)
        .bind(market.tick_size)
        .bind(market.lot_size)
        .bind(market.funding_interval_sec.map(|s| s as i64))
        .bind(market.expiry_ts)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_market(&self, symbol: &str, mode: Mode) -> Result<Option<Market>, StoreError> {
        let row = sqlx::query("SELECT * FROM markets WHERE symbol = $1 AND mode = $2")
            .bind(symbol)
            .bind(mode.as_str())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(market_from_row).transpose()
    }

    async fn query_markets(
        &self,
        mode: Mode,
        status: Option<MarketStatus>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Market>, StoreError> {
        let after: Option<MarketCursor> = decode_opt(cursor)?;
        let rows = sqlx::query(
            r#"SELECT * FROM markets
               WHERE mode = $1
                 AND ($2::TEXT IS NULL OR status = $2::TEXT)
                 AND ($3::TEXT IS NULL OR symbol > $3::TEXT)
               ORDER BY symbol
               LIMIT $4"#,
        )
        .bind(mode.as_str())
        .bind(status.map(|s| s.to_string()))
        .bind(after.map(|c| c.symbol))
        .bind(fetch_limit(limit))
        .fetch_all(self.pool())
        .await?;
        paginate(collect(rows, market_from_row)?, limit, |m| MarketCursor {
            symbol: m.symbol.clone(),
        })
    }

    async fn put_price_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO price_snapshots (asset, ts, price, source, expires_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (asset, ts) DO UPDATE SET
                   price = EXCLUDED.price,
                   source = EXCLUDED.source,
                   expires_at = EXCLUDED.expires_at"#,
        )
        .bind(&snapshot.asset)
        .bind(snapshot.timestamp)
        .bind(snapshot.price)
        .bind(&snapshot.source)
        .bind(snapshot.expires_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn latest_price(
        &self,
        asset: &str,
        now: TimestampMs,
    ) -> Result<Option<PriceSnapshot>, StoreError> {
        let row = sqlx::query(
            r#"SELECT * FROM price_snapshots
               WHERE asset = $1 AND expires_at > $2
               ORDER BY ts DESC
               LIMIT 1"#,
        )
        .bind(asset)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(price_from_row).transpose()
    }

    async fn purge_expired_prices(&self, now: TimestampMs) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM price_snapshots WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_intraday(&self, update: &IntradayUpdate) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO intraday_stats (stat_key, bucket, volume, fees, funding_rate,
                   open_interest, trade_count)
               VALUES ($1, $2, $3, $4, $5, COALESCE($6, 0), $7)
               ON CONFLICT (stat_key, bucket) DO UPDATE SET
                   volume = intraday_stats.volume + EXCLUDED.volume,
                   fees = intraday_stats.fees + EXCLUDED.fees,
                   trade_count = intraday_stats.trade_count + EXCLUDED.trade_count,
                   funding_rate = COALESCE($5, intraday_stats.funding_rate),
                   open_interest = COALESCE($6, intraday_stats.open_interest)"#,
        )
        .bind(&update.key)
        .bind(update.bucket)
        .bind(update.volume)
        .bind(update.fees)
        .bind(update.funding_rate)
        .bind(update.open_interest)
        .bind(update.trade_count as i64)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn query_intraday(
        &self,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<Vec<IntradayStat>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM intraday_stats
               WHERE bucket >= $1 AND bucket < $2
               ORDER BY stat_key, bucket"#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(self.pool())
        .await?;
        collect(rows, intraday_from_row)
    }

    async fn put_daily_stat(&self, stat: &DailyStat, now: TimestampMs) -> Result<bool, StoreError> {
        let mut tx = self.pool().begin().await?;
        let inserted = sqlx::query(
            r#"INSERT INTO daily_stats (stat_key, date, volume, fees, avg_funding_rate, trade_count)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (stat_key, date) DO NOTHING"#,
        )
        .bind(&stat.key)
        .bind(stat.date)
        .bind(stat.volume)
        .bind(stat.fees)
        .bind(stat.avg_funding_rate)
        .bind(stat.trade_count as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            sqlx::query(
                r#"INSERT INTO lifetime_stats (stat_key, volume, fees, trade_count, updated_at)
                   VALUES ($1, $2, $3, $4, $5)
                   ON CONFLICT (stat_key) DO UPDATE SET
                       volume = lifetime_stats.volume + EXCLUDED.volume,
                       fees = lifetime_stats.fees + EXCLUDED.fees,
                       trade_count = lifetime_stats.trade_count + EXCLUDED.trade_count,
                       updated_at = EXCLUDED.updated_at"#,
            )
            .bind(&stat.key)
            .bind(stat.volume)
            .bind(stat.fees)
            .bind(stat.trade_count as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"UPDATE daily_stats
                   SET volume = $3, fees = $4, avg_funding_rate = $5, trade_count = $6
                   WHERE stat_key = $1 AND date = $2"#,
            )
            .bind(&stat.key)
            .bind(stat.date)
            .bind(stat.volume)
            .bind(stat.fees)
            .bind(stat.avg_funding_rate)
            .bind(stat.trade_count as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_daily_stats(&self, date: NaiveDate) -> Result<Vec<DailyStat>, StoreError> {
        let rows = sqlx::query("SELECT * FROM daily_stats WHERE date = $1 ORDER BY stat_key")
            .bind(date)
            .fetch_all(self.pool())
            .await?;
        collect(rows, daily_from_row)
    }

    async fn get_lifetime(&self, key: &str) -> Result<Option<LifetimeStat>, StoreError> {
        let row = sqlx::query("SELECT * FROM lifetime_stats WHERE stat_key = $1")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(lifetime_from_row).transpose()
    }

    async fn get_cursor(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT value FROM ledger_cursors WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.try_get::<i64, _>("value")).transpose()?)
    }

    async fn put_cursor(&self, name: &str, value: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO ledger_cursors (name, value) VALUES ($1, $2)
               ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value"#,
        )
        .bind(name)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeRecord> {
        self.changes.subscribe()
    }
}
