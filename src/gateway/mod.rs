pub mod handlers;
pub mod state;
pub mod types;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tracing::info;

use crate::websocket::ws_handler;
use state::AppState;

/// All routes: ledger API under /api/v1, /health and the /ws push endpoint
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/balances", get(handlers::get_balances))
        .route("/positions", get(handlers::get_positions))
        .route("/trades", get(handlers::get_trades))
        .route("/markets", get(handlers::get_markets))
        .route("/deposit", post(handlers::deposit))
        .route("/withdraw", post(handlers::withdraw));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws", get(ws_handler))
        .nest("/api/v1", api)
        .with_state(state)
}

pub async fn run_server(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()> {
    let app = router(state);

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {} (port in use?)", addr))?;

    info!(addr = %addr, "Gateway listening");
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
