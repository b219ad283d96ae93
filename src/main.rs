//! depin_ledger service entry point
//!
//! ```text
//! vault ──▶ ChainEventListener ──┐
//! HTTP  ──▶ LedgerService ───────┼──▶ LedgerStore ──change feed──▶ TradeEventRouter ──▶ sink
//! jobs  ──▶ settlement ──────────┘                                        │
//!                                  EventPublisher ◀───────────────────────┘
//!                                        │
//!                                        ▼
//!                               FanOutDispatcher ──▶ /ws clients
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use depin_ledger::chain::{
    ChainEventListener, EventAssets, JsonRpcClient, JsonRpcVaultClient, ListenerConfig, LogSource,
    RpcLogSource, VaultClient, VaultClientConfig, VaultTopics, abi,
};
use depin_ledger::config::{AppConfig, ChainConfig, StoreBackend};
use depin_ledger::db::Database;
use depin_ledger::gateway::{self, state::AppState};
use depin_ledger::ledger::{LedgerAssets, LedgerService};
use depin_ledger::router::{HttpTradeSink, QueueTradeSink, TradeEventRouter, TradeSink};
use depin_ledger::settlement::{
    DailyPnlConfig, DailyPnlJob, ExpiryConfig, ExpiryJob, FsArchiveStore, FundingConfig,
    FundingJob, HttpPriceOracle, JobSchedule, OracleJob, RollupJob, spawn_jobs,
};
use depin_ledger::store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
use depin_ledger::websocket::{ConnectionRegistry, EventPublisher, FanOutDispatcher};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory ledger store; state is lost on restart");
            Ok(Arc::new(MemoryLedgerStore::new()))
        }
        StoreBackend::Postgres => {
            let url = config
                .store
                .postgres_url
                .as_deref()
                .context("store.postgres_url is required for the postgres backend")?;
            let db = Database::connect(url, config.store.max_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            db.migrate().await.context("Failed to run migrations")?;
            info!("PostgreSQL ledger store ready");
            Ok(Arc::new(PgLedgerStore::new(db)))
        }
    }
}

#[cfg(feature = "mock-chain")]
fn mock_chain(chain: &ChainConfig) -> anyhow::Result<(Arc<dyn VaultClient>, Arc<dyn LogSource>)> {
    warn!("chain.enabled = false: using the in-process mock vault");
    let mock = Arc::new(depin_ledger::chain::MockVault::new(chain.vault_address.as_str()));
    let vault: Arc<dyn VaultClient> = mock.clone();
    let source: Arc<dyn LogSource> = mock;
    Ok((vault, source))
}

#[cfg(not(feature = "mock-chain"))]
fn mock_chain(_chain: &ChainConfig) -> anyhow::Result<(Arc<dyn VaultClient>, Arc<dyn LogSource>)> {
    anyhow::bail!("chain.enabled = false requires the mock-chain feature")
}

fn build_chain(chain: &ChainConfig) -> anyhow::Result<(Arc<dyn VaultClient>, Arc<dyn LogSource>)> {
    if !chain.enabled {
        return mock_chain(chain);
    }
    let rpc = Arc::new(JsonRpcClient::new(
        chain.rpc_url.as_str(),
        Duration::from_millis(chain.rpc_timeout_ms),
    )?);
    let vault: Arc<dyn VaultClient> = Arc::new(JsonRpcVaultClient::new(
        rpc.clone(),
        VaultClientConfig {
            vault_address: abi::normalize_address(&chain.vault_address),
            operator_address: abi::normalize_address(&chain.operator_address),
            confirmation_timeout: Duration::from_millis(chain.confirmation_timeout_ms),
            receipt_poll_interval: Duration::from_millis(chain.receipt_poll_interval_ms),
        },
    ));
    let source: Arc<dyn LogSource> = Arc::new(RpcLogSource::new(
        rpc,
        abi::normalize_address(&chain.vault_address),
        &VaultTopics::new(),
    ));
    Ok((vault, source))
}

fn build_jobs(
    config: &AppConfig,
    store: &Arc<dyn LedgerStore>,
) -> anyhow::Result<Vec<JobSchedule>> {
    let jobs = &config.jobs;
    let quote = config.chain.quote_asset.clone();
    let mut schedules = Vec::new();

    if jobs.funding.enabled {
        let job = FundingJob::new(
            store.clone(),
            FundingConfig {
                rate_band: jobs.funding_rate_band,
                concurrency: jobs.concurrency,
            },
        );
        schedules.push(JobSchedule::new(Arc::new(job), jobs.funding.interval()));
    }
    if jobs.expiry.enabled {
        let job = ExpiryJob::new(
            store.clone(),
            ExpiryConfig {
                quote_asset: quote.clone(),
                concurrency: jobs.concurrency,
                ..ExpiryConfig::default()
            },
        );
        schedules.push(JobSchedule::new(Arc::new(job), jobs.expiry.interval()));
    }
    if jobs.daily_pnl.enabled {
        let job = DailyPnlJob::new(
            store.clone(),
            DailyPnlConfig {
                quote_asset: quote,
                concurrency: jobs.concurrency,
                ..DailyPnlConfig::default()
            },
        );
        schedules.push(JobSchedule::new(Arc::new(job), jobs.daily_pnl.interval()));
    }
    if jobs.rollup.enabled {
        let archive = Arc::new(FsArchiveStore::new(config.archive.root.as_str()));
        let job = RollupJob::new(store.clone(), archive, jobs.concurrency);
        schedules.push(JobSchedule::new(Arc::new(job), jobs.rollup.interval()));
    }
    if jobs.oracle.enabled && !config.oracle.assets.is_empty() {
        let oracle = HttpPriceOracle::new(
            config.oracle.base_url.as_str(),
            config.oracle.vs_currency.as_str(),
            config.oracle.assets.clone(),
            Duration::from_millis(config.oracle.timeout_ms),
        )?;
        let mut assets: Vec<String> = config.oracle.assets.keys().cloned().collect();
        assets.sort();
        let job = OracleJob::new(
            store.clone(),
            Arc::new(oracle),
            assets,
            Duration::from_secs(jobs.oracle_ttl_secs),
            jobs.concurrency,
        );
        schedules.push(JobSchedule::new(Arc::new(job), jobs.oracle.interval()));
    }
    Ok(schedules)
}

fn build_sink(config: &AppConfig) -> anyhow::Result<Arc<dyn TradeSink>> {
    if let Some(url) = &config.router.aggregator_url {
        info!(url = %url, "Trade router forwarding over HTTP");
        return Ok(Arc::new(HttpTradeSink::new(url.as_str(), Duration::from_secs(5))?));
    }

    let sink = QueueTradeSink::new(config.router.queue_size);
    let queue = sink.queue();
    // No aggregator configured: drain locally so the queue never fills
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            tick.tick().await;
            while let Some(msg) = queue.pop() {
                debug!(market = %msg.market, trade_id = %msg.trade_id, price = %msg.price, "Trade routed");
            }
        }
    });
    Ok(Arc::new(sink))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = depin_ledger::logging::init_logging(&app_config);

    info!(env = %env, git = env!("GIT_HASH"), "Starting depin_ledger");

    let store = build_store(&app_config).await?;
    let (vault, log_source) = build_chain(&app_config.chain)?;

    let publisher = EventPublisher::with_capacity(app_config.gateway.queue_size);
    let ws_registry = Arc::new(ConnectionRegistry::new());

    // Chain event listener
    let event_assets = EventAssets {
        quote_asset: app_config.chain.quote_asset.clone(),
        platform_asset: app_config.chain.platform_asset.clone(),
        synths: app_config
            .chain
            .synths
            .iter()
            .map(|(addr, sym)| (abi::normalize_address(addr), sym.clone()))
            .collect::<HashMap<_, _>>(),
    };
    let listener = ChainEventListener::new(
        log_source,
        store.clone(),
        event_assets,
        ListenerConfig {
            poll_interval: app_config.chain.poll_interval(),
            max_backoff: app_config.chain.max_backoff(),
            max_block_range: app_config.chain.max_block_range,
            start_block: app_config.chain.start_block,
            ..ListenerConfig::default()
        },
    )
    .with_publisher(publisher.clone());
    tokio::spawn(listener.run());

    // Push fan-out
    let dispatcher = FanOutDispatcher::new(
        ws_registry.clone(),
        publisher.queue(),
        Duration::from_millis(app_config.gateway.push_timeout_ms),
    );
    tokio::spawn(dispatcher.run());
    info!("WebSocket push service started");

    // Trade router
    let router = TradeEventRouter::new(store.subscribe_changes(), build_sink(&app_config)?)
        .with_publisher(publisher.clone());
    tokio::spawn(async move {
        let stats = router.run().await;
        warn!(?stats, "Trade router stopped");
    });

    // Settlement jobs
    let schedules = build_jobs(&app_config, &store)?;
    info!(jobs = schedules.len(), "Settlement jobs scheduled");
    let _job_handles = spawn_jobs(schedules);

    let ledger = Arc::new(
        LedgerService::new(
            store,
            vault,
            LedgerAssets {
                quote_asset: app_config.chain.quote_asset.clone(),
                platform_asset: app_config.chain.platform_asset.clone(),
            },
        )
        .with_publisher(publisher),
    );
    let state = Arc::new(AppState::new(
        ledger,
        ws_registry,
        app_config.gateway.ws_outbound_capacity,
    ));

    let port = get_port_override().unwrap_or(app_config.gateway.port);
    gateway::run_server(state, &app_config.gateway.host, port).await
}
