//! Option / future expiry sweep
//!
//! Cash-settles expired OPEN orders against the latest oracle price:
//!
//! - FUTURE: (S - K) * qty * dir
//! - CALL:   max(S - K, 0) * qty * dir
//! - PUT:    max(K - S, 0) * qty * dir
//!
//! with dir = +1 for BUY, -1 for SELL, S the settlement price and K the order
//! price. Payoff, `settled_at` and the EXPIRED flip are one conditional store
//! write, so a second sweep finds nothing to do.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::{ItemOutcome, Job, JobError, JobReport, process_items};
use crate::core_types::{Asset, TimestampMs, market_partition};
use crate::models::{BalanceDelta, BalanceKey, ExpireOutcome, OptionKind, Order, OrderType};
use crate::store::LedgerStore;

#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    pub quote_asset: Asset,
    /// Max orders per sweep
    pub batch_size: usize,
    pub concurrency: usize,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            quote_asset: "USDC".to_string(),
            batch_size: 500,
            concurrency: 8,
        }
    }
}

/// Idempotency key of an expiry payoff. Order ids are only unique within a
/// market partition.
pub fn expiry_key(order: &Order) -> String {
    format!("expiry:{}:{}", market_partition(&order.market, order.mode), order.order_id)
}

/// Cash payoff of an expiring order at settlement price `settle`
pub fn payoff(order: &Order, settle: Decimal) -> Result<Decimal, JobError> {
    let strike = order.price;
    let intrinsic = match order.order_type {
        OrderType::Future => settle - strike,
        OrderType::Option => match order.option_kind {
            Some(OptionKind::Call) => (settle - strike).max(Decimal::ZERO),
            Some(OptionKind::Put) => (strike - settle).max(Decimal::ZERO),
            None => {
                return Err(JobError::Invalid(format!(
                    "option order {} has no call/put kind",
                    order.order_id
                )));
            }
        },
        other => {
            return Err(JobError::Invalid(format!(
                "order {} of type {} does not expire",
                order.order_id, other
            )));
        }
    };
    Ok(intrinsic * order.qty * order.side.direction())
}

pub struct ExpiryJob {
    store: Arc<dyn LedgerStore>,
    config: ExpiryConfig,
}

impl ExpiryJob {
    pub fn new(store: Arc<dyn LedgerStore>, config: ExpiryConfig) -> Self {
        Self { store, config }
    }

    /// Oracle asset for an order: the market's underlying, else the symbol
    /// prefix (`BTC-27JUN25-70000-C` -> `BTC`)
    async fn underlying(&self, order: &Order) -> Result<Asset, JobError> {
        if let Some(market) = self.store.get_market(&order.market, order.mode).await? {
            if !market.underlying.is_empty() {
                return Ok(market.underlying);
            }
        }
        Ok(order
            .market
            .split('-')
            .next()
            .unwrap_or(order.market.as_str())
            .to_string())
    }

    async fn settle(&self, order: Order, now: TimestampMs) -> Result<ItemOutcome, JobError> {
        let asset = self.underlying(&order).await?;
        let Some(price) = self.store.latest_price(&asset, now).await? else {
            debug!(order_id = %order.order_id, asset = %asset, "No settlement price, retry next sweep");
            return Ok(ItemOutcome::Skipped);
        };
        let amount = payoff(&order, price.price)?;

        let delta = (!amount.is_zero()).then(|| {
            BalanceDelta::new(
                BalanceKey::new(order.trader_id.clone(), self.config.quote_asset.clone(), order.mode),
                amount,
            )
            .with_idempotency_key(expiry_key(&order))
        });

        match self.store.expire_order(&order.key(), delta.as_ref(), now).await? {
            ExpireOutcome::Expired { payoff } => {
                info!(
                    order_id = %order.order_id,
                    market = %order.market,
                    trader = %order.trader_id,
                    settle_price = %price.price,
                    payoff = %payoff,
                    "Order expired"
                );
                Ok(ItemOutcome::Processed)
            }
            ExpireOutcome::AlreadyFinal | ExpireOutcome::NotFound => Ok(ItemOutcome::Skipped),
        }
    }
}

#[async_trait]
impl Job for ExpiryJob {
    fn name(&self) -> &'static str {
        "expiry"
    }

    async fn run_once(&self, now: TimestampMs) -> Result<JobReport, JobError> {
        let orders = self
            .store
            .query_expirable_orders(now, self.config.batch_size)
            .await?;
        Ok(process_items(
            self.name(),
            orders,
            self.config.concurrency,
            expiry_key,
            |o| self.settle(o, now),
        )
        .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Mode;
    use crate::models::{OrderStatus, PriceSnapshot, Side};
    use crate::store::MemoryLedgerStore;
    use rust_decimal_macros::dec;

    const NOW: TimestampMs = 1_714_566_896_789;

    fn order(id: &str, order_type: OrderType, kind: Option<OptionKind>, side: Side) -> Order {
        Order {
            market: "BTC-28JUN24".into(),
            mode: Mode::Real,
            order_id: id.into(),
            trader_id: "0xaa".into(),
            order_type,
            status: OrderStatus::Open,
            side,
            price: dec!(60000),
            qty: dec!(2),
            option_kind: kind,
            expiry_ts: Some(NOW - 1),
            settled_at: None,
            created_at: NOW - 86_400_000,
        }
    }

    #[test]
    fn test_payoff_models() {
        let s = dec!(65000);
        let future = order("f", OrderType::Future, None, Side::Buy);
        assert_eq!(payoff(&future, s).unwrap(), dec!(10000));
        let short_future = order("f", OrderType::Future, None, Side::Sell);
        assert_eq!(payoff(&short_future, s).unwrap(), dec!(-10000));

        let call = order("c", OrderType::Option, Some(OptionKind::Call), Side::Buy);
        assert_eq!(payoff(&call, s).unwrap(), dec!(10000));
        assert_eq!(payoff(&call, dec!(55000)).unwrap(), dec!(0));

        let put = order("p", OrderType::Option, Some(OptionKind::Put), Side::Sell);
        assert_eq!(payoff(&put, dec!(55000)).unwrap(), dec!(-10000));
        assert_eq!(payoff(&put, s).unwrap(), dec!(0));

        let kindless = order("x", OrderType::Option, None, Side::Buy);
        assert!(payoff(&kindless, s).is_err());
    }

    #[tokio::test]
    async fn test_sweep_expires_once() {
        let store = Arc::new(MemoryLedgerStore::new());
        store
            .put_order(&order("o-1", OrderType::Future, None, Side::Buy))
            .await
            .unwrap();
        store
            .put_price_snapshot(&PriceSnapshot {
                asset: "BTC".into(),
                price: dec!(61000),
                timestamp: NOW - 10,
                source: "test".into(),
                expires_at: NOW + 1_000_000,
            })
            .await
            .unwrap();

        let job = ExpiryJob::new(store.clone(), ExpiryConfig::default());
        assert_eq!(job.run_once(NOW).await.unwrap().processed, 1);
        let second = job.run_once(NOW).await.unwrap();
        assert_eq!(second.total(), 0);

        let key = BalanceKey::new("0xaa", "USDC", Mode::Real);
        assert_eq!(store.get_balance(&key).await.unwrap().unwrap().balance, dec!(2000));
        let stored = store
            .get_order(&order("o-1", OrderType::Future, None, Side::Buy).key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OrderStatus::Expired);
        assert_eq!(stored.settled_at, Some(NOW));
    }

    #[tokio::test]
    async fn test_same_order_id_in_two_markets_pays_both() {
        let store = Arc::new(MemoryLedgerStore::new());
        let btc = order("o-1", OrderType::Future, None, Side::Buy);
        let mut eth = btc.clone();
        eth.market = "ETH-28JUN24".into();
        store.put_order(&btc).await.unwrap();
        store.put_order(&eth).await.unwrap();
        assert_ne!(expiry_key(&btc), expiry_key(&eth));

        for (asset, px) in [("BTC", dec!(61000)), ("ETH", dec!(60500))] {
            store
                .put_price_snapshot(&PriceSnapshot {
                    asset: asset.into(),
                    price: px,
                    timestamp: NOW - 10,
                    source: "test".into(),
                    expires_at: NOW + 1_000_000,
                })
                .await
                .unwrap();
        }

        let job = ExpiryJob::new(store.clone(), ExpiryConfig::default());
        assert_eq!(job.run_once(NOW).await.unwrap().processed, 2);

        let key = BalanceKey::new("0xaa", "USDC", Mode::Real);
        assert_eq!(store.get_balance(&key).await.unwrap().unwrap().balance, dec!(3000));
        for o in [&btc, &eth] {
            let stored = store.get_order(&o.key()).await.unwrap().unwrap();
            assert_eq!(stored.status, OrderStatus::Expired);
        }
    }

    #[tokio::test]
    async fn test_no_price_leaves_order_open() {
        let store = Arc::new(MemoryLedgerStore::new());
        let o = order("o-2", OrderType::Option, Some(OptionKind::Call), Side::Buy);
        store.put_order(&o).await.unwrap();

        let job = ExpiryJob::new(store.clone(), ExpiryConfig::default());
        let report = job.run_once(NOW).await.unwrap();
        assert_eq!((report.processed, report.skipped), (0, 1));
        let stored = store.get_order(&o.key()).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Open);
    }
}
