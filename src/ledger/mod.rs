//! Ledger Query API
//!
//! Read access to balances, positions, trades and markets, plus the
//! deposit/withdraw write path. Chain writes wait for one confirmation and
//! are then applied optimistically under the same idempotency key the chain
//! listener derives from the confirmed event, so each transfer lands once.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::chain::abi;
use crate::chain::events::{deposit_key, withdraw_key};
use crate::chain::{TxReceipt, VaultClient};
use crate::core_types::{Asset, GLOBAL_KEY, Mode, TraderId};
use crate::error::LedgerError;
use crate::models::{
    Balance, BalanceDelta, BalanceKey, DeltaOutcome, IntradayUpdate, Market, MarketStatus,
    Position, Trade,
};
use crate::store::{LedgerStore, Page};
use crate::websocket::EventPublisher;

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 500;

/// Clamp a requested page size into `[1, MAX_PAGE_LIMIT]`
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

/// Assets the vault settles in
#[derive(Debug, Clone)]
pub struct LedgerAssets {
    pub quote_asset: Asset,
    /// Platform token paid out by `withdraw(.., asCxpt = true)`
    pub platform_asset: Asset,
}

impl Default for LedgerAssets {
    fn default() -> Self {
        Self {
            quote_asset: "USDC".to_string(),
            platform_asset: "CXPT".to_string(),
        }
    }
}

/// Asset a withdrawal is paid out in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettleAsset {
    #[default]
    Quote,
    Platform,
}

/// Result of a deposit or withdrawal
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChange {
    pub trader_id: TraderId,
    pub asset: Asset,
    pub mode: Mode,
    /// Signed change applied to the balance
    pub delta: Decimal,
    /// Balance after the change; None if the chain listener applied it first
    pub balance: Option<Decimal>,
    pub tx_hash: String,
    pub block_number: u64,
}

/// Trader ids are account addresses; hex addresses compare lowercase
fn canonical_trader(trader_id: &str) -> TraderId {
    let trimmed = trader_id.trim();
    if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
        abi::normalize_address(&trimmed[2..])
    } else {
        trimmed.to_string()
    }
}

fn require_positive(amount: Decimal) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount);
    }
    Ok(())
}

fn require_address(trader_id: &str) -> Result<TraderId, LedgerError> {
    abi::encode_address(trader_id)
        .map_err(|_| LedgerError::InvalidParameter(format!("not an account address: {}", trader_id)))?;
    Ok(canonical_trader(trader_id))
}

pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    vault: Arc<dyn VaultClient>,
    assets: LedgerAssets,
    publisher: Option<EventPublisher>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>, vault: Arc<dyn VaultClient>, assets: LedgerAssets) -> Self {
        Self {
            store,
            vault,
            assets,
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn assets(&self) -> &LedgerAssets {
        &self.assets
    }

    // === Queries ===

    pub async fn get_balances(&self, trader_id: &str, mode: Mode) -> Result<Vec<Balance>, LedgerError> {
        Ok(self
            .store
            .get_balances(&canonical_trader(trader_id), mode)
            .await?)
    }

    pub async fn get_positions(&self, trader_id: &str) -> Result<Vec<Position>, LedgerError> {
        Ok(self.store.get_positions(&canonical_trader(trader_id)).await?)
    }

    /// A trader's trades, newest first
    pub async fn get_trade_history(
        &self,
        trader_id: &str,
        market: Option<&str>,
        mode: Mode,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<Page<Trade>, LedgerError> {
        Ok(self
            .store
            .query_trader_trades(
                &canonical_trader(trader_id),
                mode,
                market,
                clamp_limit(limit),
                cursor,
            )
            .await?)
    }

    /// Public trades of a market, newest first
    pub async fn get_market_trades(
        &self,
        market: &str,
        mode: Mode,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<Page<Trade>, LedgerError> {
        if market.is_empty() {
            return Err(LedgerError::InvalidParameter("market is required".into()));
        }
        Ok(self
            .store
            .query_market_trades(market, mode, clamp_limit(limit), cursor)
            .await?)
    }

    pub async fn get_markets(
        &self,
        mode: Mode,
        status: Option<MarketStatus>,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<Page<Market>, LedgerError> {
        Ok(self
            .store
            .query_markets(mode, status, clamp_limit(limit), cursor)
            .await?)
    }

    // === Transfers ===

    /// Deposit quote asset into the vault on behalf of `trader_id`
    pub async fn initiate_deposit(
        &self,
        trader_id: &str,
        amount: Decimal,
    ) -> Result<BalanceChange, LedgerError> {
        require_positive(amount)?;
        let trader = require_address(trader_id)?;

        let receipt = self.vault.deposit(&trader, amount).await?;
        let key = BalanceKey::new(trader, self.assets.quote_asset.clone(), Mode::Real);
        let delta = BalanceDelta::new(key, amount).with_idempotency_key(deposit_key(&receipt.tx_hash));
        self.apply_confirmed(delta, receipt, "deposit").await
    }

    /// Withdraw from the vault, paid out in the quote asset or platform token
    pub async fn initiate_withdraw(
        &self,
        trader_id: &str,
        amount: Decimal,
        settle_asset: SettleAsset,
    ) -> Result<BalanceChange, LedgerError> {
        require_positive(amount)?;
        let trader = require_address(trader_id)?;
        let asset = match settle_asset {
            SettleAsset::Quote => self.assets.quote_asset.clone(),
            SettleAsset::Platform => self.assets.platform_asset.clone(),
        };
        let key = BalanceKey::new(trader.clone(), asset, Mode::Real);

        let available = self
            .store
            .get_balance(&key)
            .await?
            .map(|b| b.balance)
            .unwrap_or(Decimal::ZERO);
        if available < amount {
            return Err(LedgerError::InvalidParameter(format!(
                "insufficient {} balance: {} < {}",
                key.asset, available, amount
            )));
        }

        let as_cxpt = settle_asset == SettleAsset::Platform;
        let receipt = self.vault.withdraw(&trader, amount, as_cxpt).await?;
        let delta = BalanceDelta::new(key, -amount).with_idempotency_key(withdraw_key(&receipt.tx_hash));
        self.apply_confirmed(delta, receipt, "withdraw").await
    }

    async fn apply_confirmed(
        &self,
        delta: BalanceDelta,
        receipt: TxReceipt,
        kind: &'static str,
    ) -> Result<BalanceChange, LedgerError> {
        let outcome = match self.store.apply_delta(&delta).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Funds moved on chain; the listener will still apply the event
                warn!(
                    error = %e,
                    tx = %receipt.tx_hash,
                    kind,
                    "Optimistic balance update failed after confirmation"
                );
                return Err(e.into());
            }
        };
        let balance = match outcome {
            DeltaOutcome::Applied { balance } => Some(balance),
            DeltaOutcome::Duplicate => None,
        };
        info!(
            trader = %delta.key.trader_id,
            asset = %delta.key.asset,
            amount = %delta.amount,
            tx = %receipt.tx_hash,
            block = receipt.block_number,
            applied = balance.is_some(),
            kind,
            "Vault transfer confirmed"
        );

        let change = BalanceChange {
            trader_id: delta.key.trader_id,
            asset: delta.key.asset,
            mode: delta.key.mode,
            delta: delta.amount,
            balance,
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
        };
        if let (Some(publisher), Some(_)) = (&self.publisher, balance) {
            publisher.to_trader(
                &change.trader_id,
                "balance",
                json!({
                    "asset": change.asset,
                    "mode": change.mode,
                    "delta": change.delta,
                    "balance": change.balance,
                    "txHash": change.tx_hash,
                    "source": kind,
                }),
            );
        }
        Ok(change)
    }

    // === Execution-layer entry ===

    /// Append an executed trade and bump the intraday counters of its market
    /// and of GLOBAL. Returns false if the trade was already recorded.
    pub async fn record_trade(&self, trade: &Trade) -> Result<bool, LedgerError> {
        if trade.market.is_empty() || trade.trade_id.is_empty() {
            return Err(LedgerError::InvalidParameter(
                "trade needs a market and a trade id".into(),
            ));
        }
        if trade.price <= Decimal::ZERO || trade.qty < Decimal::ZERO {
            return Err(LedgerError::InvalidParameter(format!(
                "bad trade price/qty: {} / {}",
                trade.price, trade.qty
            )));
        }
        if !self.store.append_trade(trade).await? {
            return Ok(false);
        }

        let bump = |mut update: IntradayUpdate| {
            update.volume = trade.notional();
            update.fees = trade.fee;
            update.trade_count = 1;
            update
        };
        self.store
            .upsert_intraday(&bump(IntradayUpdate::for_market(
                &trade.market,
                trade.mode,
                trade.timestamp,
            )))
            .await?;
        // GLOBAL aggregates real trading only
        if trade.mode == Mode::Real {
            self.store
                .upsert_intraday(&bump(IntradayUpdate::for_key(GLOBAL_KEY, trade.timestamp)))
                .await?;
        }
        Ok(true)
    }

    // === Admin ===

    pub async fn register_synth(&self, synth: &str) -> Result<TxReceipt, LedgerError> {
        let receipt = self.vault.register_synth(synth).await?;
        info!(synth = %synth, tx = %receipt.tx_hash, "Synth registered");
        Ok(receipt)
    }

    pub async fn withdraw_fees(&self, to: &str, amount: Decimal) -> Result<TxReceipt, LedgerError> {
        let to = require_address(to)?;
        require_positive(amount)?;
        let receipt = self.vault.withdraw_fees(&to, amount).await?;
        info!(to = %to, amount = %amount, tx = %receipt.tx_hash, "Protocol fees withdrawn");
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockVault;
    use crate::models::Side;
    use crate::store::MemoryLedgerStore;
    use rust_decimal_macros::dec;

    const TRADER: &str = "0x00000000000000000000000000000000000000AA";

    fn service() -> (LedgerService, Arc<MemoryLedgerStore>, EventPublisher) {
        let store = Arc::new(MemoryLedgerStore::new());
        let vault = Arc::new(MockVault::new("0x00000000000000000000000000000000000000cc"));
        let publisher = EventPublisher::with_capacity(16);
        let service = LedgerService::new(store.clone(), vault, LedgerAssets::default())
            .with_publisher(publisher.clone());
        (service, store, publisher)
    }

    #[tokio::test]
    async fn test_withdraw_fees_rejects_bad_address() {
        let (service, _, _) = service();
        let err = service.withdraw_fees("treasury", dec!(10)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidParameter(_)));
        let err = service.withdraw_fees("", dec!(10)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidParameter(_)));
        assert!(service.withdraw_fees(TRADER, dec!(10)).await.is_ok());
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), 500);
        assert_eq!(clamp_limit(Some(20)), 20);
    }

    #[tokio::test]
    async fn test_deposit_credits_and_publishes() {
        let (service, _store, publisher) = service();
        let change = service.initiate_deposit(TRADER, dec!(250)).await.unwrap();
        assert_eq!(change.trader_id, TRADER.to_ascii_lowercase());
        assert_eq!(change.balance, Some(dec!(250)));
        assert_eq!(change.asset, "USDC");

        let balances = service.get_balances(TRADER, Mode::Real).await.unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].balance, dec!(250));

        let event = publisher.queue().pop().unwrap();
        assert_eq!(event.channel, format!("trader.{}", TRADER.to_ascii_lowercase()));
        assert_eq!(event.topic, "balance");
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amount() {
        let (service, _, _) = service();
        assert!(matches!(
            service.initiate_deposit(TRADER, dec!(0)).await,
            Err(LedgerError::InvalidAmount)
        ));
        assert!(matches!(
            service.initiate_withdraw(TRADER, dec!(-5), SettleAsset::Quote).await,
            Err(LedgerError::InvalidAmount)
        ));
    }

    #[tokio::test]
    async fn test_withdraw_checks_balance_and_asset() {
        let (service, store, _) = service();
        service.initiate_deposit(TRADER, dec!(100)).await.unwrap();

        let err = service
            .initiate_withdraw(TRADER, dec!(101), SettleAsset::Quote)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidParameter(_)));

        let change = service
            .initiate_withdraw(TRADER, dec!(40), SettleAsset::Quote)
            .await
            .unwrap();
        assert_eq!(change.delta, dec!(-40));
        assert_eq!(change.balance, Some(dec!(60)));

        // No platform-token balance to pay out from
        let err = service
            .initiate_withdraw(TRADER, dec!(1), SettleAsset::Platform)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidParameter(_)));

        let key = BalanceKey::new(TRADER.to_ascii_lowercase(), "USDC", Mode::Real);
        assert_eq!(store.get_balance(&key).await.unwrap().unwrap().balance, dec!(60));
    }

    #[tokio::test]
    async fn test_record_trade_bumps_stats_once() {
        let (service, store, _) = service();
        let trade = Trade {
            market: "BTC-PERP".into(),
            mode: Mode::Real,
            trade_id: "t-1".into(),
            trader_id: Some(TRADER.to_ascii_lowercase()),
            side: Side::Buy,
            price: dec!(100),
            qty: dec!(2),
            fee: dec!(0.5),
            timestamp: 1_714_566_896_789,
            meta: None,
        };
        assert!(service.record_trade(&trade).await.unwrap());
        assert!(!service.record_trade(&trade).await.unwrap());

        let rows = store.query_intraday(0, i64::MAX).await.unwrap();
        assert_eq!(rows.len(), 2);
        for row in rows {
            assert_eq!(row.volume, dec!(200));
            assert_eq!(row.fees, dec!(0.5));
            assert_eq!(row.trade_count, 1);
        }

        let page = service
            .get_trade_history(TRADER, None, Mode::Real, None, None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_cursor_is_reported() {
        let (service, _, _) = service();
        let err = service
            .get_market_trades("BTC-PERP", Mode::Real, None, Some("%%%"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidCursor));
    }
}
