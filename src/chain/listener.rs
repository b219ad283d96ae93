//! Chain Event Listener
//!
//! Polls the vault's event log from a persisted block cursor and applies one
//! idempotent balance delta per decoded event. Re-reading a block range is
//! harmless, so the cursor only advances after a whole range is applied.
//! A log flagged `removed` (its block was re-orged out) revokes the delta it
//! applied; if the transaction lands again on the new fork it is re-applied.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::events::{EventAssets, LoggedEvent, RawLog, VaultTopics, decode_log};
use super::error::ChainError;
use super::rpc::{JsonRpcClient, parse_quantity, to_quantity};
use crate::models::{BalanceKey, DeltaOutcome};
use crate::store::LedgerStore;
use crate::websocket::EventPublisher;

/// Where vault logs come from
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn latest_block(&self) -> Result<u64, ChainError>;

    /// Vault logs with `from <= block <= to`
    async fn get_logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, ChainError>;
}

/// `eth_getLogs` against a node, filtered to the vault address and its topics
pub struct RpcLogSource {
    rpc: Arc<JsonRpcClient>,
    vault_address: String,
    topics: Vec<String>,
}

impl RpcLogSource {
    pub fn new(rpc: Arc<JsonRpcClient>, vault_address: impl Into<String>, topics: &VaultTopics) -> Self {
        Self {
            rpc,
            vault_address: vault_address.into(),
            topics: topics.all(),
        }
    }
}

#[async_trait]
impl LogSource for RpcLogSource {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        let hex: String = self.rpc.call("eth_blockNumber", Vec::<()>::new()).await?;
        parse_quantity(&hex)
    }

    async fn get_logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, ChainError> {
        let filter = json!({
            "address": self.vault_address,
            "fromBlock": to_quantity(from),
            "toBlock": to_quantity(to),
            // OR across the four event signatures in topic position 0
            "topics": [self.topics],
        });
        self.rpc.call("eth_getLogs", [filter]).await
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub max_block_range: u64,
    /// First block scanned when no cursor is stored
    pub start_block: u64,
    pub cursor_name: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            max_block_range: 1000,
            start_block: 0,
            cursor_name: "vault_listener".to_string(),
        }
    }
}

/// Outcome of one poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub from_block: u64,
    pub to_block: u64,
    pub latest_block: u64,
    pub applied: usize,
    pub duplicates: usize,
    /// Removed logs whose delta was revoked
    pub reverted: usize,
    pub ignored: usize,
    pub undecodable: usize,
}

impl PollReport {
    pub fn caught_up(&self) -> bool {
        self.to_block >= self.latest_block
    }
}

pub struct ChainEventListener {
    source: Arc<dyn LogSource>,
    store: Arc<dyn LedgerStore>,
    topics: VaultTopics,
    assets: EventAssets,
    config: ListenerConfig,
    publisher: Option<EventPublisher>,
}

impl ChainEventListener {
    pub fn new(
        source: Arc<dyn LogSource>,
        store: Arc<dyn LedgerStore>,
        assets: EventAssets,
        config: ListenerConfig,
    ) -> Self {
        Self {
            source,
            store,
            topics: VaultTopics::new(),
            assets,
            config,
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Scan the next block range and apply its events
    pub async fn poll_once(&self) -> Result<PollReport, ChainError> {
        let latest = self.source.latest_block().await?;
        let next = match self.store.get_cursor(&self.config.cursor_name).await? {
            Some(last) => last as u64 + 1,
            None => self.config.start_block,
        };
        let mut report = PollReport {
            from_block: next,
            to_block: latest,
            latest_block: latest,
            ..Default::default()
        };
        if next > latest {
            return Ok(report);
        }
        let to = latest.min(next + self.config.max_block_range.max(1) - 1);
        report.to_block = to;

        let mut logs = self.source.get_logs(next, to).await?;
        logs.sort_by_key(|l| (l.block().unwrap_or(0), l.index().unwrap_or(0)));

        for log in &logs {
            match decode_log(log, &self.topics) {
                Ok(Some(event)) if log.removed => match self.revert(&event).await? {
                    DeltaOutcome::Applied { .. } => report.reverted += 1,
                    DeltaOutcome::Duplicate => report.ignored += 1,
                },
                Ok(Some(event)) => match self.apply(&event).await? {
                    DeltaOutcome::Applied { .. } => report.applied += 1,
                    DeltaOutcome::Duplicate => report.duplicates += 1,
                },
                Ok(None) => report.ignored += 1,
                Err(e) => {
                    warn!(
                        error = %e,
                        tx = ?log.transaction_hash,
                        "Skipping undecodable vault log"
                    );
                    report.undecodable += 1;
                }
            }
        }

        self.store
            .put_cursor(&self.config.cursor_name, to as i64)
            .await?;
        Ok(report)
    }

    async fn revert(&self, logged: &LoggedEvent) -> Result<DeltaOutcome, ChainError> {
        let delta = logged.to_delta(&self.assets);
        let outcome = self.store.revoke_delta(&delta).await?;
        match outcome {
            DeltaOutcome::Applied { balance } => {
                warn!(
                    trader = %delta.key.trader_id,
                    asset = %delta.key.asset,
                    amount = %delta.amount,
                    balance = %balance,
                    tx = %logged.tx_hash,
                    block = logged.block_number,
                    "Re-orged vault event reverted"
                );
                self.publish_balance(logged, &delta.key, -delta.amount, balance);
            }
            DeltaOutcome::Duplicate => {
                debug!(tx = %logged.tx_hash, "Removed vault log was never applied");
            }
        }
        Ok(outcome)
    }

    fn publish_balance(
        &self,
        logged: &LoggedEvent,
        key: &BalanceKey,
        amount: Decimal,
        balance: Decimal,
    ) {
        if let Some(publisher) = &self.publisher {
            publisher.to_trader(
                &key.trader_id,
                "balance",
                json!({
                    "asset": key.asset,
                    "mode": key.mode,
                    "delta": amount,
                    "balance": balance,
                    "txHash": logged.tx_hash,
                    "source": "chain",
                }),
            );
        }
    }

    async fn apply(&self, logged: &LoggedEvent) -> Result<DeltaOutcome, ChainError> {
        let delta = logged.to_delta(&self.assets);
        let outcome = self.store.apply_delta(&delta).await?;
        match outcome {
            DeltaOutcome::Applied { balance } => {
                info!(
                    trader = %delta.key.trader_id,
                    asset = %delta.key.asset,
                    amount = %delta.amount,
                    balance = %balance,
                    tx = %logged.tx_hash,
                    block = logged.block_number,
                    "Vault event applied"
                );
                self.publish_balance(logged, &delta.key, delta.amount, balance);
            }
            DeltaOutcome::Duplicate => {
                debug!(
                    tx = %logged.tx_hash,
                    key = ?delta.idempotency_key,
                    "Vault event already applied"
                );
            }
        }
        Ok(outcome)
    }

    /// Poll until a permanent error. Transient RPC or store failures back
    /// off exponentially (capped) and resume from the stored cursor; anything
    /// else (bad configuration, a node answering garbage) stops the listener
    /// and is returned.
    pub async fn run(self) -> Result<(), ChainError> {
        info!(
            cursor = %self.config.cursor_name,
            start_block = self.config.start_block,
            "Chain event listener started"
        );
        let mut backoff = self.config.poll_interval;
        loop {
            match self.poll_once().await {
                Ok(report) => {
                    backoff = self.config.poll_interval;
                    if report.applied + report.duplicates + report.reverted + report.undecodable > 0 {
                        info!(
                            from = report.from_block,
                            to = report.to_block,
                            applied = report.applied,
                            duplicates = report.duplicates,
                            reverted = report.reverted,
                            undecodable = report.undecodable,
                            "Vault logs processed"
                        );
                    }
                    if report.caught_up() {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Chain listener poll failed, reconnecting"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
                Err(e) => {
                    error!(error = %e, cursor = %self.config.cursor_name, "Chain listener stopped");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::client::{MockVault, VaultClient};
    use crate::core_types::Mode;
    use crate::store::MemoryLedgerStore;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    const TRADER: &str = "0x00000000000000000000000000000000000000aa";

    fn assets() -> EventAssets {
        EventAssets {
            quote_asset: "USDC".into(),
            platform_asset: "CXPT".into(),
            synths: HashMap::new(),
        }
    }

    fn listener(vault: Arc<MockVault>, store: Arc<MemoryLedgerStore>) -> ChainEventListener {
        ChainEventListener::new(
            vault,
            store,
            assets(),
            ListenerConfig {
                start_block: 1,
                max_block_range: 2,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_poll_applies_and_advances_cursor() {
        let vault = Arc::new(MockVault::new("0x00000000000000000000000000000000000000cc"));
        let store = Arc::new(MemoryLedgerStore::new());
        vault.deposit(TRADER, dec!(100)).await.unwrap();
        vault.withdraw(TRADER, dec!(30), false).await.unwrap();
        vault.deposit(TRADER, dec!(5)).await.unwrap();

        let listener = listener(vault.clone(), store.clone());
        let first = listener.poll_once().await.unwrap();
        assert_eq!((first.from_block, first.to_block), (1, 2));
        assert_eq!(first.applied, 2);
        assert!(!first.caught_up());

        let second = listener.poll_once().await.unwrap();
        assert_eq!((second.from_block, second.to_block), (3, 3));
        assert!(second.caught_up());

        let idle = listener.poll_once().await.unwrap();
        assert_eq!(idle.applied, 0);

        let key = BalanceKey::new(TRADER, "USDC", Mode::Real);
        assert_eq!(store.get_balance(&key).await.unwrap().unwrap().balance, dec!(75));
        assert_eq!(store.get_cursor("vault_listener").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_replayed_range_is_deduplicated() {
        let vault = Arc::new(MockVault::new("0x00000000000000000000000000000000000000cc"));
        let store = Arc::new(MemoryLedgerStore::new());
        vault.deposit(TRADER, dec!(40)).await.unwrap();

        let listener = listener(vault.clone(), store.clone());
        listener.poll_once().await.unwrap();
        // Simulate a restart that lost the cursor
        store.put_cursor("vault_listener", 0).await.unwrap();
        let replay = listener.poll_once().await.unwrap();
        assert_eq!(replay.duplicates, 1);
        assert_eq!(replay.applied, 0);

        let key = BalanceKey::new(TRADER, "USDC", Mode::Real);
        assert_eq!(store.get_balance(&key).await.unwrap().unwrap().balance, dec!(40));
    }

    struct FlakySource {
        inner: Arc<MockVault>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl LogSource for FlakySource {
        async fn latest_block(&self) -> Result<u64, ChainError> {
            if self.fail.swap(false, Ordering::SeqCst) {
                return Err(ChainError::RpcConnection("connection reset".into()));
            }
            self.inner.latest_block().await
        }

        async fn get_logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, ChainError> {
            self.inner.get_logs(from, to).await
        }
    }

    #[tokio::test]
    async fn test_rpc_failure_keeps_cursor() {
        let vault = Arc::new(MockVault::new("0x00000000000000000000000000000000000000cc"));
        let store = Arc::new(MemoryLedgerStore::new());
        vault.deposit(TRADER, dec!(1)).await.unwrap();
        let source = Arc::new(FlakySource {
            inner: vault.clone(),
            fail: AtomicBool::new(true),
        });
        let listener = ChainEventListener::new(
            source,
            store.clone(),
            assets(),
            ListenerConfig {
                start_block: 1,
                ..Default::default()
            },
        );
        assert!(listener.poll_once().await.is_err());
        assert_eq!(store.get_cursor("vault_listener").await.unwrap(), None);
        assert_eq!(listener.poll_once().await.unwrap().applied, 1);
    }

    #[tokio::test]
    async fn test_reorged_deposit_is_reverted() {
        let vault = Arc::new(MockVault::new("0x00000000000000000000000000000000000000cc"));
        let store = Arc::new(MemoryLedgerStore::new());
        let receipt = vault.deposit(TRADER, dec!(100)).await.unwrap();
        let key = BalanceKey::new(TRADER, "USDC", Mode::Real);

        let listener = listener(vault.clone(), store.clone());
        assert_eq!(listener.poll_once().await.unwrap().applied, 1);
        assert_eq!(store.get_balance(&key).await.unwrap().unwrap().balance, dec!(100));

        assert_eq!(vault.reorg_tx(&receipt.tx_hash, false), 1);
        let report = listener.poll_once().await.unwrap();
        assert_eq!(report.reverted, 1);
        assert_eq!(store.get_balance(&key).await.unwrap().unwrap().balance, dec!(0));

        // Replaying the removed log does not revert twice
        store.put_cursor("vault_listener", 0).await.unwrap();
        let replay = listener.poll_once().await.unwrap();
        assert_eq!(replay.reverted, 0);
        assert_eq!(store.get_balance(&key).await.unwrap().unwrap().balance, dec!(0));
    }

    #[tokio::test]
    async fn test_reincluded_tx_is_applied_again() {
        let vault = Arc::new(MockVault::new("0x00000000000000000000000000000000000000cc"));
        let store = Arc::new(MemoryLedgerStore::new());
        let receipt = vault.deposit(TRADER, dec!(60)).await.unwrap();
        let listener = ChainEventListener::new(
            vault.clone(),
            store.clone(),
            assets(),
            ListenerConfig {
                start_block: 1,
                ..Default::default()
            },
        );
        listener.poll_once().await.unwrap();

        vault.reorg_tx(&receipt.tx_hash, true);
        let report = listener.poll_once().await.unwrap();
        assert_eq!((report.reverted, report.applied), (1, 1));
        let key = BalanceKey::new(TRADER, "USDC", Mode::Real);
        assert_eq!(store.get_balance(&key).await.unwrap().unwrap().balance, dec!(60));
    }

    struct FailingSource(fn() -> ChainError);

    #[async_trait]
    impl LogSource for FailingSource {
        async fn latest_block(&self) -> Result<u64, ChainError> {
            Err((self.0)())
        }

        async fn get_logs(&self, _from: u64, _to: u64) -> Result<Vec<RawLog>, ChainError> {
            Ok(Vec::new())
        }
    }

    fn failing_listener(error: fn() -> ChainError) -> ChainEventListener {
        ChainEventListener::new(
            Arc::new(FailingSource(error)),
            Arc::new(MemoryLedgerStore::new()),
            assets(),
            ListenerConfig {
                poll_interval: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_run_stops_on_permanent_error() {
        let run = failing_listener(|| ChainError::Config("bad vault address".into())).run();
        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("listener should stop");
        assert!(matches!(result, Err(ChainError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_keeps_retrying_transient_errors() {
        let run = failing_listener(|| ChainError::RpcConnection("connection refused".into())).run();
        assert!(tokio::time::timeout(Duration::from_millis(200), run).await.is_err());
    }
}
