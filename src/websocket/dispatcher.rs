//! Fan-Out Dispatcher
//!
//! Drains the push queue and delivers every event to all connections
//! subscribed to its channel. Pushes to one channel run concurrently; a
//! connection whose queue is closed is removed, a slow one misses the frame.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use futures::future::join_all;
use tokio::time::interval;

use super::connection::{ConnectionRegistry, PushError, push};
use super::messages::{Envelope, PushEvent};

/// Max events handled per tick
const BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Connections found gone and removed
    pub pruned: usize,
    /// Slow connections that missed this event
    pub dropped: usize,
}

pub struct FanOutDispatcher {
    registry: Arc<ConnectionRegistry>,
    queue: Arc<ArrayQueue<PushEvent>>,
    push_timeout: Duration,
}

impl FanOutDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        queue: Arc<ArrayQueue<PushEvent>>,
        push_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            push_timeout,
        }
    }

    /// Deliver one event to every current subscriber of its channel
    pub async fn dispatch(&self, event: PushEvent) -> DispatchReport {
        let subscribers = self.registry.subscribers(&event.channel);
        let mut report = DispatchReport::default();
        if subscribers.is_empty() {
            return report;
        }
        let channel = event.channel.clone();
        let envelope = Envelope::from(event);

        let pushes = subscribers.iter().map(|(conn_id, sender)| {
            let envelope = envelope.clone();
            async move { (*conn_id, push(sender, envelope, self.push_timeout).await) }
        });

        for (conn_id, result) in join_all(pushes).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(PushError::Gone) => {
                    if self.registry.remove_connection(conn_id) {
                        report.pruned += 1;
                    }
                }
                Err(PushError::Full) => {
                    tracing::warn!(conn_id, channel = %channel, "Slow client, push dropped");
                    report.dropped += 1;
                }
            }
        }
        tracing::trace!(
            channel = %channel,
            delivered = report.delivered,
            pruned = report.pruned,
            dropped = report.dropped,
            "Event dispatched"
        );
        report
    }

    /// Drain up to one batch of queued events
    pub async fn drain_batch(&self) -> usize {
        let mut count = 0;
        while let Some(event) = self.queue.pop() {
            self.dispatch(event).await;
            count += 1;
            if count >= BATCH_SIZE {
                break;
            }
        }
        count
    }

    /// Poll the push queue forever
    pub async fn run(self) {
        let mut tick = interval(Duration::from_millis(1));
        tracing::info!("Fan-out dispatcher started");
        loop {
            tick.tick().await;
            self.drain_batch().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::messages::EventPublisher;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<ConnectionRegistry>, EventPublisher, FanOutDispatcher) {
        let registry = Arc::new(ConnectionRegistry::new());
        let publisher = EventPublisher::with_capacity(64);
        let dispatcher = FanOutDispatcher::new(
            registry.clone(),
            publisher.queue(),
            Duration::from_millis(20),
        );
        (registry, publisher, dispatcher)
    }

    #[tokio::test]
    async fn test_dispatch_reaches_only_channel_subscribers() {
        let (registry, _publisher, dispatcher) = setup();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let (tx_c, mut rx_c) = mpsc::channel(8);
        let a = registry.add_connection(None, tx_a);
        let b = registry.add_connection(None, tx_b);
        let _c = registry.add_connection(None, tx_c);
        registry.subscribe(a, "market.BTC-PERP");
        registry.subscribe(b, "market.ETH-PERP");

        let report = dispatcher
            .dispatch(PushEvent {
                channel: "market.BTC-PERP".into(),
                topic: "trade".into(),
                data: json!({"price": "100"}),
            })
            .await;
        assert_eq!(report.delivered, 1);

        let frame = rx_a.try_recv().unwrap();
        assert_eq!(frame.topic, "trade");
        assert_eq!(frame.data, json!({"price": "100"}));
        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_gone_connection_is_pruned() {
        let (registry, _publisher, dispatcher) = setup();
        let (tx_live, mut rx_live) = mpsc::channel(8);
        let (tx_dead, rx_dead) = mpsc::channel(8);
        let live = registry.add_connection(None, tx_live);
        let dead = registry.add_connection(None, tx_dead);
        registry.subscribe(live, "market.BTC-PERP");
        registry.subscribe(dead, "market.BTC-PERP");
        drop(rx_dead);

        let report = dispatcher
            .dispatch(PushEvent {
                channel: "market.BTC-PERP".into(),
                topic: "trade".into(),
                data: json!(1),
            })
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, 1);
        assert!(registry.info(dead).is_none());
        assert!(rx_live.try_recv().is_ok());
        assert_eq!(registry.subscribers("market.BTC-PERP").len(), 1);
    }

    #[tokio::test]
    async fn test_slow_connection_misses_frame_but_stays() {
        let (registry, _publisher, dispatcher) = setup();
        let (tx, mut rx) = mpsc::channel(1);
        let conn = registry.add_connection(None, tx);
        registry.subscribe(conn, "trader.0xaa");

        let event = |n: i64| PushEvent {
            channel: "trader.0xaa".into(),
            topic: "balance".into(),
            data: json!(n),
        };
        assert_eq!(dispatcher.dispatch(event(1)).await.delivered, 1);
        let report = dispatcher.dispatch(event(2)).await;
        assert_eq!(report.dropped, 1);
        assert!(registry.info(conn).is_some());
        assert_eq!(rx.recv().await.unwrap().data, json!(1));
    }

    #[tokio::test]
    async fn test_drain_batch_consumes_queue() {
        let (registry, publisher, dispatcher) = setup();
        let (tx, mut rx) = mpsc::channel(8);
        let conn = registry.add_connection(Some("0xaa".into()), tx);
        registry.subscribe(conn, "trader.0xaa");

        publisher.to_trader("0xaa", "balance", json!({"n": 1}));
        publisher.to_market("BTC-PERP", "trade", json!({"n": 2}));
        assert_eq!(dispatcher.drain_batch().await, 2);
        assert!(publisher.queue().is_empty());
        assert_eq!(rx.try_recv().unwrap().topic, "balance");
        assert!(rx.try_recv().is_err());
    }
}
