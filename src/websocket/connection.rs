//! Connection registry
//!
//! Active push connections keyed by connection id, plus a channel index
//! (channel -> connection ids) so fan-out resolves subscribers with a
//! single lookup.
//!
//! Connection lifecycle: Connected (no channel) -> Subscribed -> removed on
//! disconnect or when a push finds its queue closed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

use super::messages::Envelope;
use crate::core_types::{TimestampMs, TraderId, now_ms};

/// Bounded outbound queue of a connection, drained by its socket task
pub type WsSender = mpsc::Sender<Envelope>;

/// Unique connection identifier
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Receiver dropped: the client is gone
    Gone,
    /// Outbound queue full: the client is too slow
    Full,
}

struct ConnectionEntry {
    trader_id: Option<TraderId>,
    channel: Option<String>,
    sender: WsSender,
    connected_at: TimestampMs,
}

/// Snapshot of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub trader_id: Option<TraderId>,
    pub channel: Option<String>,
    pub connected_at: TimestampMs,
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// channel -> subscribed connection ids
    by_channel: DashMap<String, HashSet<ConnectionId>>,
    next_conn_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_channel: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register a new connection. It receives nothing until it subscribes.
    pub fn add_connection(&self, trader_id: Option<TraderId>, sender: WsSender) -> ConnectionId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            conn_id,
            ConnectionEntry {
                trader_id: trader_id.clone(),
                channel: None,
                sender,
                connected_at: now_ms(),
            },
        );
        tracing::info!(
            conn_id,
            trader_id = ?trader_id,
            total_connections = self.connections.len(),
            "WebSocket connection added"
        );
        conn_id
    }

    /// Point a connection at `channel`, leaving its previous channel.
    /// Returns false if the connection no longer exists.
    pub fn subscribe(&self, conn_id: ConnectionId, channel: &str) -> bool {
        let previous = {
            let Some(mut entry) = self.connections.get_mut(&conn_id) else {
                return false;
            };
            entry.channel.replace(channel.to_string())
        };
        if let Some(old) = previous.as_deref().filter(|old| *old != channel) {
            self.unindex(old, conn_id);
        }
        self.by_channel
            .entry(channel.to_string())
            .or_default()
            .insert(conn_id);

        // Lost a race with remove_connection: undo the index insert
        if !self.connections.contains_key(&conn_id) {
            self.unindex(channel, conn_id);
            return false;
        }
        tracing::debug!(conn_id, channel, previous = ?previous, "Connection subscribed");
        true
    }

    fn unindex(&self, channel: &str, conn_id: ConnectionId) {
        if let Some(mut ids) = self.by_channel.get_mut(channel) {
            ids.remove(&conn_id);
        }
        self.by_channel.remove_if(channel, |_, ids| ids.is_empty());
    }

    /// Remove a connection. Returns false if it was already gone.
    pub fn remove_connection(&self, conn_id: ConnectionId) -> bool {
        let Some((_, entry)) = self.connections.remove(&conn_id) else {
            return false;
        };
        if let Some(channel) = &entry.channel {
            self.unindex(channel, conn_id);
        }
        tracing::info!(
            conn_id,
            channel = ?entry.channel,
            remaining_connections = self.connections.len(),
            "WebSocket connection removed"
        );
        true
    }

    /// Connections currently subscribed to `channel`
    pub fn subscribers(&self, channel: &str) -> Vec<(ConnectionId, WsSender)> {
        let ids: Vec<ConnectionId> = match self.by_channel.get(channel) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Vec::new(),
        };
        ids.into_iter()
            .filter_map(|id| {
                self.connections
                    .get(&id)
                    .map(|entry| (id, entry.sender.clone()))
            })
            .collect()
    }

    pub fn info(&self, conn_id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&conn_id).map(|entry| ConnectionInfo {
            id: conn_id,
            trader_id: entry.trader_id.clone(),
            channel: entry.channel.clone(),
            connected_at: entry.connected_at,
        })
    }

    /// Queue a frame for one connection without waiting
    pub fn send_to(&self, conn_id: ConnectionId, envelope: Envelope) -> Result<(), PushError> {
        let sender = self
            .connections
            .get(&conn_id)
            .map(|entry| entry.sender.clone())
            .ok_or(PushError::Gone)?;
        sender.try_send(envelope).map_err(|e| match e {
            TrySendError::Closed(_) => PushError::Gone,
            TrySendError::Full(_) => PushError::Full,
        })
    }

    /// Get connection statistics
    ///
    /// Returns (total connections, channels with at least one subscriber)
    pub fn stats(&self) -> (usize, usize) {
        (self.connections.len(), self.by_channel.len())
    }
}

/// Push one frame, waiting at most `timeout` for queue space
pub async fn push(sender: &WsSender, envelope: Envelope, timeout: Duration) -> Result<(), PushError> {
    sender
        .send_timeout(envelope, timeout)
        .await
        .map_err(|e| match e {
            SendTimeoutError::Closed(_) => PushError::Gone,
            SendTimeoutError::Timeout(_) => PushError::Full,
        })
}
