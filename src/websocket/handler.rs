//! WebSocket handler for client connections
//!
//! Handles upgrade, connection lifecycle, subscription messages and the
//! synchronous `pnl` / `trade` queries.

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{State, WebSocketUpgrade},
    http::HeaderMap,
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::connection::{ConnectionId, ConnectionRegistry, PushError};
use super::messages::{ActionRequest, Channel, ClientMessage, Envelope};
use crate::core_types::{Mode, TraderId};
use crate::gateway::handlers::trader_from_headers;
use crate::gateway::state::AppState;
use crate::ledger::LedgerService;

/// WebSocket upgrade handler
///
/// Endpoint: GET /ws. The connection's trader comes from the same
/// `x-trader-id` header as the REST API; without it the connection is
/// anonymous and limited to market channels.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let trader_id = trader_from_headers(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, trader_id, state))
}

/// Handle WebSocket connection lifecycle
async fn handle_socket(socket: WebSocket, trader_id: Option<TraderId>, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Envelope>(state.ws_outbound_capacity.max(1));

    let registry = state.ws_registry.clone();
    let conn_id = registry.add_connection(trader_id.clone(), tx);

    let welcome = Envelope::push("connected", json!({ "connectionId": conn_id }));
    if let Ok(text) = serde_json::to_string(&welcome) {
        let _ = sender.send(Message::Text(text.into())).await;
    }

    // Forward queued frames to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Ok(text) = serde_json::to_string(&envelope) {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    let recv_state = state.clone();
    let recv_trader = trader_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = handle_client_message(
                        text.as_str(),
                        conn_id,
                        recv_trader.as_deref(),
                        &recv_state.ws_registry,
                        &recv_state.ledger,
                    )
                    .await;
                    if let Some(reply) = reply {
                        if recv_state.ws_registry.send_to(conn_id, reply) == Err(PushError::Gone) {
                            break;
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    registry.remove_connection(conn_id);
}

/// Process one client frame. Returns the reply for this connection, if any.
pub async fn handle_client_message(
    text: &str,
    conn_id: ConnectionId,
    trader_id: Option<&str>,
    registry: &ConnectionRegistry,
    ledger: &LedgerService,
) -> Option<Envelope> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(conn_id, error = %e, "Unparseable client message");
            return Some(Envelope::error(format!("invalid message: {}", e)));
        }
    };

    match message {
        ClientMessage::Subscribe { channel } => {
            match Channel::parse(&channel) {
                Some(Channel::Trader(owner)) if Some(owner.as_str()) != trader_id => {
                    return Some(Envelope::error("cannot subscribe to another trader's channel"));
                }
                Some(_) => {}
                None => return Some(Envelope::error(format!("unknown channel: {}", channel))),
            }
            if !registry.subscribe(conn_id, &channel) {
                return None;
            }
            Some(Envelope::push("subscribed", json!({ "channel": channel })))
        }
        ClientMessage::Action(ActionRequest::Ping) => Some(Envelope::push("pong", Value::Null)),
        ClientMessage::Action(ActionRequest::Pnl) => {
            let Some(trader_id) = trader_id else {
                return Some(Envelope::error("pnl requires a trader_id"));
            };
            match ledger.get_positions(trader_id).await {
                Ok(positions) => Some(Envelope::history("pnl", json!(positions))),
                Err(e) => {
                    tracing::warn!(conn_id, error = %e, "pnl query failed");
                    Some(Envelope::error(e.to_string()))
                }
            }
        }
        ClientMessage::Action(ActionRequest::Trade {
            market,
            mode,
            limit,
        }) => {
            let mode = mode.unwrap_or(Mode::Real);
            match ledger.get_market_trades(&market, mode, limit, None).await {
                Ok(page) => Some(Envelope::history("trade", json!(page.items))),
                Err(e) => {
                    tracing::warn!(conn_id, market = %market, error = %e, "trade query failed");
                    Some(Envelope::error(e.to_string()))
                }
            }
        }
    }
}
