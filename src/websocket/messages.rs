//! Push protocol messages
//!
//! Server -> client: `{topic, data}` envelopes, `type: "history"` for
//! replies to synchronous queries.
//! Client -> server: `{"channel": ...}` to subscribe, or `{"action": ...}`.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core_types::{MarketSymbol, Mode, TraderId};

pub const MARKET_PREFIX: &str = "market.";
pub const TRADER_PREFIX: &str = "trader.";

pub fn market_channel(symbol: &str) -> String {
    format!("{}{}", MARKET_PREFIX, symbol)
}

pub fn trader_channel(trader_id: &str) -> String {
    format!("{}{}", TRADER_PREFIX, trader_id)
}

/// Subscription target parsed from a channel string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    Market(MarketSymbol),
    Trader(TraderId),
}

impl Channel {
    pub fn parse(raw: &str) -> Option<Channel> {
        if let Some(symbol) = raw.strip_prefix(MARKET_PREFIX) {
            return (!symbol.is_empty()).then(|| Channel::Market(symbol.to_string()));
        }
        if let Some(id) = raw.strip_prefix(TRADER_PREFIX) {
            return (!id.is_empty()).then(|| Channel::Trader(id.to_string()));
        }
        None
    }
}

/// Event queued for fan-out to every connection on `channel`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub channel: String,
    pub topic: String,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    History,
}

/// Frame sent to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EnvelopeKind>,
}

impl Envelope {
    pub fn push(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            data,
            kind: None,
        }
    }

    pub fn history(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            data,
            kind: Some(EnvelopeKind::History),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::push("error", serde_json::json!({ "message": message.into() }))
    }
}

impl From<PushEvent> for Envelope {
    fn from(event: PushEvent) -> Self {
        Envelope::push(event.topic, event.data)
    }
}

/// Synchronous requests answered only to the requesting connection
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ActionRequest {
    /// Current positions of the connection's trader
    Pnl,
    /// Recent trades of a market
    Trade {
        market: MarketSymbol,
        #[serde(default)]
        mode: Option<Mode>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Ping,
}

/// Anything a client may send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Subscribe { channel: String },
    Action(ActionRequest),
}

/// Producer handle for the fan-out queue
#[derive(Clone)]
pub struct EventPublisher {
    queue: Arc<ArrayQueue<PushEvent>>,
}

impl EventPublisher {
    pub fn new(queue: Arc<ArrayQueue<PushEvent>>) -> Self {
        Self { queue }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(Arc::new(ArrayQueue::new(capacity.max(1))))
    }

    pub fn queue(&self) -> Arc<ArrayQueue<PushEvent>> {
        self.queue.clone()
    }

    /// Enqueue an event. A full queue drops the event with a warning.
    pub fn publish(&self, event: PushEvent) -> bool {
        match self.queue.push(event) {
            Ok(()) => true,
            Err(dropped) => {
                tracing::warn!(
                    channel = %dropped.channel,
                    topic = %dropped.topic,
                    "Push queue full, event dropped"
                );
                false
            }
        }
    }

    pub fn to_trader(&self, trader_id: &str, topic: &str, data: Value) -> bool {
        self.publish(PushEvent {
            channel: trader_channel(trader_id),
            topic: topic.to_string(),
            data,
        })
    }

    pub fn to_market(&self, market: &str, topic: &str, data: Value) -> bool {
        self.publish(PushEvent {
            channel: market_channel(market),
            topic: topic.to_string(),
            data,
        })
    }
}
