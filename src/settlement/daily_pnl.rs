//! Daily perp settlement: realize each open position's unrealized PnL into
//! the trader's quote balance, at most once per UTC day.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{ItemOutcome, Job, JobError, JobReport, process_items};
use crate::core_types::{Asset, TimestampMs};
use crate::models::{Position, SettleOutcome, epoch_day};
use crate::store::LedgerStore;

#[derive(Debug, Clone)]
pub struct DailyPnlConfig {
    pub quote_asset: Asset,
    /// Positions fetched per scan page
    pub page_size: usize,
    pub concurrency: usize,
}

impl Default for DailyPnlConfig {
    fn default() -> Self {
        Self {
            quote_asset: "USDC".to_string(),
            page_size: 500,
            concurrency: 8,
        }
    }
}

pub struct DailyPnlJob {
    store: Arc<dyn LedgerStore>,
    config: DailyPnlConfig,
}

impl DailyPnlJob {
    pub fn new(store: Arc<dyn LedgerStore>, config: DailyPnlConfig) -> Self {
        Self { store, config }
    }

    async fn settle(&self, position: Position, epoch: i64, now: TimestampMs) -> Result<ItemOutcome, JobError> {
        if position.unrealized_pnl.is_zero() {
            return Ok(ItemOutcome::Skipped);
        }
        match self
            .store
            .settle_position(&position.key(), &self.config.quote_asset, epoch, now)
            .await?
        {
            SettleOutcome::Settled { credited } => {
                info!(
                    trader = %position.trader_id,
                    market = %position.market,
                    epoch,
                    credited = %credited,
                    "Daily PnL realized"
                );
                Ok(ItemOutcome::Processed)
            }
            SettleOutcome::AlreadySettled
            | SettleOutcome::NothingToSettle
            | SettleOutcome::NotFound => Ok(ItemOutcome::Skipped),
        }
    }
}

#[async_trait]
impl Job for DailyPnlJob {
    fn name(&self) -> &'static str {
        "daily_pnl"
    }

    async fn run_once(&self, now: TimestampMs) -> Result<JobReport, JobError> {
        let epoch = epoch_day(now);
        let mut report = JobReport::default();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .scan_open_positions(cursor.as_deref(), self.config.page_size)
                .await?;
            let batch = process_items(
                self.name(),
                page.items,
                self.config.concurrency,
                |p| format!("{}/{}", p.trader_id, p.market),
                |p| self.settle(p, epoch, now),
            )
            .await;
            report.merge(batch);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(report)
    }
}
