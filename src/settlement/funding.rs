//! Perpetual funding
//!
//! rate = clamp((mark - index) / index, -band, +band), where mark is the
//! latest traded price and index the latest oracle price of the underlying.
//! Each charge is recorded as a zero-quantity system trade carrying the rate,
//! and as the funding gauge of the current intraday bucket.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::{ItemOutcome, Job, JobError, JobReport, process_items};
use crate::core_types::{Mode, TimestampMs};
use crate::models::{
    IntradayUpdate, Market, MarketStatus, MarketType, Side, Trade, TradeMeta, minute_bucket,
};
use crate::store::LedgerStore;

const MARKET_PAGE: usize = 200;

#[derive(Debug, Clone)]
pub struct FundingConfig {
    /// Absolute cap on the per-interval rate
    pub rate_band: Decimal,
    pub concurrency: usize,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            rate_band: Decimal::new(75, 4),
            concurrency: 8,
        }
    }
}

pub fn funding_rate(mark: Decimal, index: Decimal, band: Decimal) -> Option<Decimal> {
    if index <= Decimal::ZERO {
        return None;
    }
    let raw = (mark - index) / index;
    Some(raw.clamp(-band, band).round_dp(8))
}

pub fn funding_trade_id(bucket: TimestampMs) -> String {
    format!("funding-{}", bucket)
}

pub struct FundingJob {
    store: Arc<dyn LedgerStore>,
    config: FundingConfig,
}

impl FundingJob {
    pub fn new(store: Arc<dyn LedgerStore>, config: FundingConfig) -> Self {
        Self { store, config }
    }

    async fn perp_markets(&self) -> Result<Vec<Market>, JobError> {
        let mut markets = Vec::new();
        for mode in Mode::ALL {
            let mut cursor: Option<String> = None;
            loop {
                let page = self
                    .store
                    .query_markets(mode, Some(MarketStatus::Active), MARKET_PAGE, cursor.as_deref())
                    .await?;
                markets.extend(
                    page.items
                        .into_iter()
                        .filter(|m| m.market_type == MarketType::Perp),
                );
                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }
        Ok(markets)
    }

    async fn charge(&self, market: Market, now: TimestampMs) -> Result<ItemOutcome, JobError> {
        if let Some(interval) = market.funding_interval_sec {
            let last = self
                .store
                .latest_market_trade(&market.symbol, market.mode, true)
                .await?;
            if let Some(last) = last {
                if now - last.timestamp < (interval as i64) * 1000 {
                    return Ok(ItemOutcome::Skipped);
                }
            }
        }

        let Some(mark) = self
            .store
            .latest_market_trade(&market.symbol, market.mode, false)
            .await?
            .map(|t| t.price)
        else {
            debug!(market = %market.symbol, mode = %market.mode, "No mark price, funding skipped");
            return Ok(ItemOutcome::Skipped);
        };
        let Some(index) = self.store.latest_price(&market.underlying, now).await? else {
            debug!(market = %market.symbol, underlying = %market.underlying, "No index price, funding skipped");
            return Ok(ItemOutcome::Skipped);
        };
        let rate = funding_rate(mark, index.price, self.config.rate_band).ok_or_else(|| {
            JobError::Invalid(format!("non-positive index price for {}", market.underlying))
        })?;

        let bucket = minute_bucket(now);
        let record = Trade {
            market: market.symbol.clone(),
            mode: market.mode,
            trade_id: funding_trade_id(bucket),
            trader_id: None,
            side: if rate >= Decimal::ZERO { Side::Buy } else { Side::Sell },
            price: mark,
            qty: Decimal::ZERO,
            fee: Decimal::ZERO,
            timestamp: bucket,
            meta: Some(TradeMeta {
                funding_rate: Some(rate),
                mark_price: Some(mark),
                index_price: Some(index.price),
            }),
        };
        let appended = self.store.append_trade(&record).await?;

        // Gauge upserts replace rather than add, so a rerun after a partial
        // failure repairs the bucket without double counting
        let mut gauge = IntradayUpdate::for_market(&market.symbol, market.mode, now);
        gauge.funding_rate = Some(rate);
        self.store.upsert_intraday(&gauge).await?;
        if !appended {
            return Ok(ItemOutcome::Skipped);
        }

        info!(
            market = %market.symbol,
            mode = %market.mode,
            mark = %mark,
            index = %index.price,
            rate = %rate,
            "Funding recorded"
        );
        Ok(ItemOutcome::Processed)
    }
}

#[async_trait]
impl Job for FundingJob {
    fn name(&self) -> &'static str {
        "funding"
    }

    async fn run_once(&self, now: TimestampMs) -> Result<JobReport, JobError> {
        let markets = self.perp_markets().await?;
        Ok(process_items(
            self.name(),
            markets,
            self.config.concurrency,
            |m| format!("{}#{}", m.symbol, m.mode),
            |m| self.charge(m, now),
        )
        .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PriceSnapshot, stats_key};
    use crate::store::MemoryLedgerStore;
    use rust_decimal_macros::dec;

    const NOW: TimestampMs = 1_714_566_896_789;

    fn perp(symbol: &str, mode: Mode, interval: Option<u64>) -> Market {
        Market {
            symbol: symbol.into(),
            mode,
            market_type: MarketType::Perp,
            status: MarketStatus::Active,
            underlying: symbol.split('-').next().unwrap().into(),
            tick_size: dec!(0.1),
            lot_size: dec!(0.001),
            funding_interval_sec: interval,
            expiry_ts: None,
        }
    }

    fn fill(symbol: &str, mode: Mode, price: Decimal, ts: TimestampMs) -> Trade {
        Trade {
            market: symbol.into(),
            mode,
            trade_id: format!("fill-{}", ts),
            trader_id: Some("0xaa".into()),
            side: Side::Buy,
            price,
            qty: dec!(1),
            fee: dec!(0),
            timestamp: ts,
            meta: None,
        }
    }

    async fn price(store: &MemoryLedgerStore, asset: &str, price: Decimal) {
        store
            .put_price_snapshot(&PriceSnapshot {
                asset: asset.into(),
                price,
                timestamp: NOW - 1_000,
                source: "test".into(),
                expires_at: NOW + 86_400_000,
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_rate_is_clamped() {
        let band = dec!(0.0075);
        assert_eq!(funding_rate(dec!(101), dec!(100), band), Some(dec!(0.0075)));
        assert_eq!(funding_rate(dec!(99.9), dec!(100), band), Some(dec!(-0.001)));
        assert_eq!(funding_rate(dec!(50), dec!(100), band), Some(dec!(-0.0075)));
        assert_eq!(funding_rate(dec!(50), dec!(0), band), None);
    }

    #[tokio::test]
    async fn test_funding_records_trade_and_gauge() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.put_market(&perp("BTC-PERP", Mode::Real, None)).await.unwrap();
        store.put_market(&perp("BTC-PERP", Mode::Paper, None)).await.unwrap();
        store
            .append_trade(&fill("BTC-PERP", Mode::Real, dec!(65032.5), NOW - 5_000))
            .await
            .unwrap();
        price(&store, "BTC", dec!(65000)).await;

        let job = FundingJob::new(store.clone(), FundingConfig::default());
        let report = job.run_once(NOW).await.unwrap();
        // Paper market has no fills yet
        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 1);

        let trades = store
            .query_market_trades("BTC-PERP", Mode::Real, 10, None)
            .await
            .unwrap();
        let funding = trades.items.iter().find(|t| t.is_funding()).unwrap();
        assert_eq!(funding.qty, Decimal::ZERO);
        assert_eq!(funding.meta.as_ref().unwrap().funding_rate, Some(dec!(0.0005)));

        let rows = store.query_intraday(0, i64::MAX).await.unwrap();
        let gauge = rows
            .iter()
            .find(|r| r.key == stats_key("BTC-PERP", Mode::Real))
            .unwrap();
        assert_eq!(gauge.funding_rate, Some(dec!(0.0005)));

        // Same minute again: the charge already exists
        let again = job.run_once(NOW).await.unwrap();
        assert_eq!(again.processed, 0);
    }

    #[tokio::test]
    async fn test_interval_not_elapsed_skips() {
        let store = Arc::new(MemoryLedgerStore::new());
        store
            .put_market(&perp("ETH-PERP", Mode::Real, Some(3600)))
            .await
            .unwrap();
        store
            .append_trade(&fill("ETH-PERP", Mode::Real, dec!(3210), NOW - 10_000))
            .await
            .unwrap();
        price(&store, "ETH", dec!(3200)).await;

        let job = FundingJob::new(store.clone(), FundingConfig::default());
        assert_eq!(job.run_once(NOW).await.unwrap().processed, 1);
        // Ten minutes later, still inside the hourly interval
        let later = job.run_once(NOW + 600_000).await.unwrap();
        assert_eq!((later.processed, later.skipped), (0, 1));
        // Past the interval
        assert_eq!(job.run_once(NOW + 3_700_000).await.unwrap().processed, 1);
    }

    #[tokio::test]
    async fn test_mark_survives_a_long_run_of_charges() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.put_market(&perp("BTC-PERP", Mode::Real, None)).await.unwrap();
        store
            .append_trade(&fill("BTC-PERP", Mode::Real, dec!(65032.5), NOW - 5_000))
            .await
            .unwrap();
        price(&store, "BTC", dec!(65000)).await;

        // One charge per minute with no fills in between buries the only
        // fill behind more funding records than any fixed window
        let job = FundingJob::new(store.clone(), FundingConfig::default());
        for minute in 0..60 {
            let report = job.run_once(NOW + minute * 60_000).await.unwrap();
            assert_eq!(report.processed, 1, "minute {minute}");
        }
        let fill = store
            .latest_market_trade("BTC-PERP", Mode::Real, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fill.trade_id, format!("fill-{}", NOW - 5_000));
    }

    #[tokio::test]
    async fn test_rerun_repairs_missing_gauge() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.put_market(&perp("BTC-PERP", Mode::Real, None)).await.unwrap();
        store
            .append_trade(&fill("BTC-PERP", Mode::Real, dec!(65032.5), NOW - 5_000))
            .await
            .unwrap();
        price(&store, "BTC", dec!(65000)).await;

        // A previous run appended the charge and failed before the gauge
        let bucket = minute_bucket(NOW);
        let mut charged = fill("BTC-PERP", Mode::Real, dec!(65032.5), bucket);
        charged.trade_id = funding_trade_id(bucket);
        charged.trader_id = None;
        charged.qty = Decimal::ZERO;
        charged.meta = Some(TradeMeta {
            funding_rate: Some(dec!(0.0005)),
            mark_price: Some(dec!(65032.5)),
            index_price: Some(dec!(65000)),
        });
        assert!(store.append_trade(&charged).await.unwrap());

        let job = FundingJob::new(store.clone(), FundingConfig::default());
        let report = job.run_once(NOW).await.unwrap();
        assert_eq!((report.processed, report.skipped), (0, 1));

        let rows = store.query_intraday(0, i64::MAX).await.unwrap();
        let gauge = rows
            .iter()
            .find(|r| r.key == stats_key("BTC-PERP", Mode::Real))
            .unwrap();
        assert_eq!(gauge.funding_rate, Some(dec!(0.0005)));
    }

    #[tokio::test]
    async fn test_missing_index_skips() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.put_market(&perp("SOL-PERP", Mode::Real, None)).await.unwrap();
        store
            .append_trade(&fill("SOL-PERP", Mode::Real, dec!(150), NOW - 1))
            .await
            .unwrap();
        let job = FundingJob::new(store, FundingConfig::default());
        let report = job.run_once(NOW).await.unwrap();
        assert_eq!((report.processed, report.skipped), (0, 1));
    }
}
