//! End-to-end ledger properties against the in-memory store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::sync::mpsc;

use depin_ledger::chain::{ChainEventListener, EventAssets, ListenerConfig, MockVault};
use depin_ledger::core_types::{Asset, Mode, TimestampMs};
use depin_ledger::ledger::{LedgerAssets, LedgerService};
use depin_ledger::models::{
    BalanceDelta, BalanceKey, IntradayUpdate, Market, MarketStatus, MarketType, OptionKind, Order,
    OrderStatus, OrderType, Position, PriceSnapshot, Side,
};
use depin_ledger::settlement::{
    DEFAULT_SNAPSHOT_TTL, DailyPnlConfig, DailyPnlJob, ExpiryConfig, ExpiryJob, FsArchiveStore,
    Job, OracleError, OracleJob, PriceOracle, RollupJob,
};
use depin_ledger::store::{LedgerStore, MemoryLedgerStore};
use depin_ledger::websocket::messages::market_channel;
use depin_ledger::websocket::{ConnectionRegistry, FanOutDispatcher, PushEvent};

const TRADER: &str = "0x00000000000000000000000000000000000000aa";
const VAULT: &str = "0x00000000000000000000000000000000000000cc";
// 2024-05-01 12:34:56.789 UTC
const NOW: TimestampMs = 1_714_566_896_789;

fn store() -> Arc<MemoryLedgerStore> {
    Arc::new(MemoryLedgerStore::new())
}

async fn balance(store: &MemoryLedgerStore, asset: &str) -> Decimal {
    store
        .get_balance(&BalanceKey::new(TRADER, asset, Mode::Real))
        .await
        .unwrap()
        .map(|b| b.balance)
        .unwrap_or_default()
}

#[tokio::test]
async fn balance_equals_sum_of_concurrent_deltas() {
    let store = store();
    let deltas = [dec!(10), dec!(-3.5), dec!(7.25), dec!(100), dec!(-50), dec!(0.25)];

    let mut tasks = Vec::new();
    // Apply in reverse and interleaved order to show order does not matter
    for amount in deltas.iter().rev().copied() {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let delta = BalanceDelta::new(BalanceKey::new(TRADER, "USDC", Mode::Real), amount);
            store.apply_delta(&delta).await.unwrap();
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let expected: Decimal = deltas.iter().sum();
    assert_eq!(balance(&store, "USDC").await, expected);
}

fn open_position(unrealized: Decimal) -> Position {
    Position {
        trader_id: TRADER.to_string(),
        market: "BTC-PERP".to_string(),
        mode: Mode::Real,
        size: dec!(2),
        avg_entry_price: dec!(60000),
        unrealized_pnl: unrealized,
        realized_pnl: Decimal::ZERO,
        last_settled_epoch: None,
        updated_at: NOW,
    }
}

#[tokio::test]
async fn daily_settlement_realizes_unrealized_pnl_once() {
    let store = store();
    store.put_position(&open_position(dec!(15))).await.unwrap();
    let job = DailyPnlJob::new(store.clone(), DailyPnlConfig::default());

    let first = job.run_once(NOW).await.unwrap();
    assert_eq!(first.processed, 1);

    // Retry the same day: no second credit
    let second = job.run_once(NOW + 60_000).await.unwrap();
    assert_eq!(second.processed, 0);

    assert_eq!(balance(&store, "USDC").await, dec!(15));
    let p = store
        .get_position(&open_position(Decimal::ZERO).key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(p.unrealized_pnl, Decimal::ZERO);
    assert_eq!(p.realized_pnl, dec!(15));
    assert_eq!(p.size, dec!(2));
}

#[tokio::test]
async fn expiry_sweep_is_a_no_op_the_second_time() {
    let store = store();
    store
        .put_market(&Market {
            symbol: "BTC-24MAY01-60000-C".to_string(),
            mode: Mode::Real,
            market_type: MarketType::Option,
            status: MarketStatus::Active,
            underlying: "BTC".to_string(),
            tick_size: dec!(0.5),
            lot_size: dec!(0.01),
            funding_interval_sec: None,
            expiry_ts: Some(NOW - 1_000),
        })
        .await
        .unwrap();
    store
        .put_price_snapshot(&PriceSnapshot {
            asset: "BTC".to_string(),
            price: dec!(65000),
            timestamp: NOW - 500,
            source: "test".to_string(),
            expires_at: NOW + 86_400_000,
        })
        .await
        .unwrap();
    store
        .put_order(&Order {
            market: "BTC-24MAY01-60000-C".to_string(),
            mode: Mode::Real,
            order_id: "o-1".to_string(),
            trader_id: TRADER.to_string(),
            order_type: OrderType::Option,
            status: OrderStatus::Open,
            side: Side::Buy,
            price: dec!(60000),
            qty: dec!(0.5),
            option_kind: Some(OptionKind::Call),
            expiry_ts: Some(NOW - 1_000),
            settled_at: None,
            created_at: NOW - 86_400_000,
        })
        .await
        .unwrap();

    let job = ExpiryJob::new(store.clone(), ExpiryConfig::default());
    let first = job.run_once(NOW).await.unwrap();
    assert_eq!(first.processed, 1);
    let second = job.run_once(NOW + 1_000).await.unwrap();
    assert_eq!(second.total(), 0);

    // (65000 - 60000) * 0.5, credited once
    assert_eq!(balance(&store, "USDC").await, dec!(2500));
}

fn connect(registry: &ConnectionRegistry, channel: &str) -> (u64, mpsc::Receiver<depin_ledger::websocket::Envelope>) {
    let (tx, rx) = mpsc::channel(8);
    let id = registry.add_connection(None, tx);
    assert!(registry.subscribe(id, channel));
    (id, rx)
}

#[tokio::test]
async fn fan_out_reaches_exactly_the_channel_subscribers() {
    let registry = Arc::new(ConnectionRegistry::new());
    let btc = market_channel("BTC-PERP");
    let (_a, mut rx_a) = connect(&registry, &btc);
    let (_b, mut rx_b) = connect(&registry, &btc);
    let (_c, mut rx_c) = connect(&registry, &market_channel("ETH-PERP"));

    let dispatcher = FanOutDispatcher::new(
        registry.clone(),
        Arc::new(crossbeam_queue::ArrayQueue::new(16)),
        Duration::from_millis(20),
    );
    let report = dispatcher
        .dispatch(PushEvent {
            channel: btc,
            topic: "trade".to_string(),
            data: json!({"price": "65000"}),
        })
        .await;

    assert_eq!(report.delivered, 2);
    assert_eq!(rx_a.try_recv().unwrap().topic, "trade");
    assert_eq!(rx_b.try_recv().unwrap().topic, "trade");
    assert!(rx_c.try_recv().is_err());
}

#[tokio::test]
async fn gone_connection_is_absent_on_next_fan_out() {
    let registry = Arc::new(ConnectionRegistry::new());
    let btc = market_channel("BTC-PERP");
    let (_live, mut rx_live) = connect(&registry, &btc);
    let (gone, rx_gone) = connect(&registry, &btc);
    drop(rx_gone);

    let dispatcher = FanOutDispatcher::new(
        registry.clone(),
        Arc::new(crossbeam_queue::ArrayQueue::new(16)),
        Duration::from_millis(20),
    );
    let event = PushEvent {
        channel: btc.clone(),
        topic: "trade".to_string(),
        data: json!({}),
    };

    let first = dispatcher.dispatch(event.clone()).await;
    assert_eq!((first.delivered, first.pruned), (1, 1));
    assert!(registry.info(gone).is_none());

    let second = dispatcher.dispatch(event).await;
    assert_eq!((second.delivered, second.pruned), (1, 0));
    assert!(registry.subscribers(&btc).iter().all(|(id, _)| *id != gone));
    assert!(rx_live.try_recv().is_ok());
}

#[tokio::test]
async fn intraday_volumes_roll_up_into_one_daily_row() {
    let store = store();
    let dir = tempfile::tempdir().unwrap();
    let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

    for (i, volume) in [dec!(10), dec!(20), dec!(5)].into_iter().enumerate() {
        let mut update = IntradayUpdate::for_market("M", Mode::Real, NOW + i as i64 * 60_000);
        update.volume = volume;
        update.trade_count = 1;
        store.upsert_intraday(&update).await.unwrap();
    }

    let job = RollupJob::new(store.clone(), Arc::new(FsArchiveStore::new(dir.path())), 4);
    job.rollup_day(day, NOW + 86_400_000).await.unwrap();

    let rows = store.get_daily_stats(day).await.unwrap();
    let m: Vec<_> = rows.iter().filter(|r| r.key == "M").collect();
    assert_eq!(m.len(), 1);
    assert_eq!(m[0].volume, dec!(35));
    assert_eq!(m[0].trade_count, 3);
}

#[tokio::test]
async fn daily_settlement_moves_pnl_into_balance() {
    let store = store();
    store.put_position(&open_position(dec!(15))).await.unwrap();
    let job = DailyPnlJob::new(store.clone(), DailyPnlConfig::default());
    job.run_once(NOW).await.unwrap();

    let p = store
        .get_position(&open_position(Decimal::ZERO).key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(balance(&store, "USDC").await, dec!(15));
    assert_eq!(p.unrealized_pnl, Decimal::ZERO);
    assert_eq!(p.realized_pnl, dec!(15));
}

struct StaticOracle(HashMap<Asset, Decimal>);

#[async_trait]
impl PriceOracle for StaticOracle {
    fn source(&self) -> &str {
        "static"
    }

    async fn fetch_prices(&self, assets: &[Asset]) -> Result<HashMap<Asset, Decimal>, OracleError> {
        Ok(assets
            .iter()
            .filter_map(|a| self.0.get(a).map(|p| (a.clone(), *p)))
            .collect())
    }
}

#[tokio::test]
async fn oracle_ingestion_writes_snapshots_with_seven_day_retention() {
    let store = store();
    let oracle = Arc::new(StaticOracle(HashMap::from([
        ("BTC".to_string(), dec!(65000)),
        ("ETH".to_string(), dec!(3200)),
    ])));
    let job = OracleJob::new(
        store.clone(),
        oracle,
        vec!["BTC".to_string(), "ETH".to_string()],
        DEFAULT_SNAPSHOT_TTL,
        2,
    );
    let report = job.run_once(NOW).await.unwrap();
    assert_eq!(report.processed, 2);

    let seven_days = 7 * 24 * 3_600_000;
    for (asset, price) in [("BTC", dec!(65000)), ("ETH", dec!(3200))] {
        let snap = store.latest_price(asset, NOW).await.unwrap().unwrap();
        assert_eq!(snap.price, price);
        assert_eq!(snap.expires_at, NOW + seven_days);
    }
}

#[tokio::test]
async fn deposit_then_chain_event_credits_once() {
    let store = store();
    let vault = Arc::new(MockVault::new(VAULT));
    let ledger = LedgerService::new(store.clone(), vault.clone(), LedgerAssets::default());

    let change = ledger.initiate_deposit(TRADER, dec!(250)).await.unwrap();
    assert_eq!(change.balance, Some(dec!(250)));

    let listener = ChainEventListener::new(
        vault,
        store.clone(),
        EventAssets {
            quote_asset: "USDC".to_string(),
            platform_asset: "CXPT".to_string(),
            synths: HashMap::new(),
        },
        ListenerConfig {
            start_block: 1,
            ..Default::default()
        },
    );
    let report = listener.poll_once().await.unwrap();
    assert_eq!(report.applied, 0);
    assert_eq!(report.duplicates, 1);

    assert_eq!(balance(&store, "USDC").await, dec!(250));
}
