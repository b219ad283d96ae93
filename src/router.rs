//! Trade Event Router
//!
//! Consumes the store's change feed and forwards every newly inserted trade
//! to the aggregation sink as a compact `TradeMessage`. Records are handled
//! in feed order; anything that is not a trade insert is ignored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_queue::ArrayQueue;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::core_types::{MarketSymbol, Mode, TimestampMs, TradeId, split_market_partition};
use crate::models::Side;
use crate::store::{ChangeKind, ChangeRecord, tables};
use crate::websocket::EventPublisher;

/// Message sent to the aggregation layer for each trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeMessage {
    pub market: MarketSymbol,
    pub mode: Mode,
    pub price: Decimal,
    pub qty: Decimal,
    pub timestamp: TimestampMs,
    pub trade_id: TradeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Trade sink full")]
    Full,

    #[error("Trade sink request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Downstream consumer of trade messages
#[async_trait]
pub trait TradeSink: Send + Sync {
    async fn send(&self, message: TradeMessage) -> Result<(), SinkError>;
}

/// Bounded in-process queue drained by the aggregation layer
pub struct QueueTradeSink {
    queue: Arc<ArrayQueue<TradeMessage>>,
}

impl QueueTradeSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    pub fn queue(&self) -> Arc<ArrayQueue<TradeMessage>> {
        self.queue.clone()
    }
}

#[async_trait]
impl TradeSink for QueueTradeSink {
    async fn send(&self, message: TradeMessage) -> Result<(), SinkError> {
        self.queue.push(message).map_err(|_| SinkError::Full)
    }
}

/// POSTs each message as JSON to an aggregation endpoint
pub struct HttpTradeSink {
    client: reqwest::Client,
    url: String,
}

impl HttpTradeSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TradeSink for HttpTradeSink {
    async fn send(&self, message: TradeMessage) -> Result<(), SinkError> {
        self.client
            .post(&self.url)
            .json(&message)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Loosely typed trade image; older writers used camelCase ids and `ts`
#[derive(Debug, Deserialize)]
struct TradeImage {
    market: Option<MarketSymbol>,
    mode: Option<Mode>,
    price: Option<Decimal>,
    qty: Option<Decimal>,
    #[serde(alias = "ts")]
    timestamp: Option<TimestampMs>,
    #[serde(alias = "tradeId")]
    trade_id: Option<TradeId>,
    side: Option<Side>,
}

/// Build the outbound message for a change record.
///
/// Returns `Ok(None)` for records the router does not handle and `Err` with
/// a reason for trade inserts that cannot be forwarded.
pub fn to_trade_message(record: &ChangeRecord) -> Result<Option<TradeMessage>, String> {
    if record.kind != ChangeKind::Insert || record.table != tables::TRADES {
        return Ok(None);
    }
    let image = record
        .new_image
        .clone()
        .ok_or_else(|| "insert without new image".to_string())?;
    let image: TradeImage =
        serde_json::from_value(image).map_err(|e| format!("unreadable image: {}", e))?;

    let partition = split_market_partition(&record.keys.pk);
    let market = image
        .market
        .filter(|m| !m.is_empty())
        .or_else(|| partition.as_ref().map(|(m, _)| m.clone()))
        .ok_or("missing market")?;
    let mode = image
        .mode
        .or_else(|| partition.as_ref().map(|(_, mode)| *mode))
        .ok_or("missing mode")?;
    let price = image.price.ok_or("missing price")?;
    let qty = image.qty.ok_or("missing qty")?;
    let timestamp = image.timestamp.ok_or("missing timestamp")?;
    let trade_id = image
        .trade_id
        .unwrap_or_else(|| record.keys.sk.rsplit('#').next().unwrap_or_default().to_string());

    Ok(Some(TradeMessage {
        market,
        mode,
        price,
        qty,
        timestamp,
        trade_id,
        side: image.side,
    }))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub forwarded: u64,
    pub ignored: u64,
    pub invalid: u64,
    pub sink_errors: u64,
    pub lagged: u64,
}

pub struct TradeEventRouter {
    changes: broadcast::Receiver<ChangeRecord>,
    sink: Arc<dyn TradeSink>,
    publisher: Option<EventPublisher>,
    stats: RouterStats,
}

impl TradeEventRouter {
    pub fn new(changes: broadcast::Receiver<ChangeRecord>, sink: Arc<dyn TradeSink>) -> Self {
        Self {
            changes,
            sink,
            publisher: None,
            stats: RouterStats::default(),
        }
    }

    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Route one change record
    pub async fn handle(&mut self, record: &ChangeRecord) {
        let message = match to_trade_message(record) {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.stats.ignored += 1;
                return;
            }
            Err(reason) => {
                warn!(pk = %record.keys.pk, sk = %record.keys.sk, reason = %reason, "Dropping incomplete trade record");
                self.stats.invalid += 1;
                return;
            }
        };

        if let Some(publisher) = &self.publisher {
            publisher.to_market(&message.market, "trade", json!(message));
        }
        let trade_id = message.trade_id.clone();
        match self.sink.send(message).await {
            Ok(()) => {
                self.stats.forwarded += 1;
                debug!(trade_id = %trade_id, "Trade forwarded");
            }
            Err(e) => {
                self.stats.sink_errors += 1;
                warn!(trade_id = %trade_id, error = %e, "Trade sink rejected message");
            }
        }
    }

    /// Drain the change feed until every sender is dropped
    pub async fn run(mut self) -> RouterStats {
        info!("Trade event router started");
        loop {
            match self.changes.recv().await {
                Ok(record) => self.handle(&record).await,
                Err(RecvError::Lagged(skipped)) => {
                    self.stats.lagged += skipped;
                    warn!(skipped, "Trade router lagged behind the change feed");
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!(
            forwarded = self.stats.forwarded,
            invalid = self.stats.invalid,
            "Trade event router stopped"
        );
        self.stats
    }
}
