//! HTTP handlers for the ledger API
//!
//! The upstream auth service authenticates the caller and forwards the
//! trader address in `x-trader-id`; every private route reads it through
//! [`AuthenticatedTrader`].

use std::sync::Arc;

use axum::{
    Json,
    extract::{FromRequestParts, Query, State},
    http::{HeaderMap, request::Parts},
};

use super::state::AppState;
use super::types::{
    ApiError, ApiResponse, ApiResult, DepositRequest, HealthResponse, MarketsQuery, ModeQuery,
    TradesQuery, WithdrawRequest,
};
use crate::core_types::{TraderId, now_ms};
use crate::error::LedgerError;
use crate::ledger::BalanceChange;
use crate::models::{Balance, Market, Position, Trade};
use crate::store::Page;

pub const TRADER_HEADER: &str = "x-trader-id";

/// Trader identity forwarded by the auth service
#[derive(Debug, Clone)]
pub struct AuthenticatedTrader(pub TraderId);

/// Normalized trader id from the auth header, if present and non-empty.
/// Shared by the REST extractor and the `/ws` upgrade.
pub fn trader_from_headers(headers: &HeaderMap) -> Option<TraderId> {
    headers
        .get(TRADER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_ascii_lowercase)
}

impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedTrader {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        trader_from_headers(&parts.headers)
            .map(AuthenticatedTrader)
            .ok_or(ApiError(LedgerError::Unauthorized))
    }
}

/// GET /health
///
/// Checks the store by reading the listener cursor.
pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let last_block = state
        .ledger
        .store()
        .get_cursor("vault_listener")
        .await
        .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
    let (connections, channels) = state.ws_registry.stats();
    Ok(Json(ApiResponse::success(HealthResponse {
        timestamp_ms: now_ms(),
        connections,
        channels,
        last_block,
    })))
}

/// GET /api/v1/balances?mode=
pub async fn get_balances(
    State(state): State<Arc<AppState>>,
    AuthenticatedTrader(trader): AuthenticatedTrader,
    Query(q): Query<ModeQuery>,
) -> ApiResult<Vec<Balance>> {
    let balances = state.ledger.get_balances(&trader, q.mode).await?;
    Ok(Json(ApiResponse::success(balances)))
}

/// GET /api/v1/positions
pub async fn get_positions(
    State(state): State<Arc<AppState>>,
    AuthenticatedTrader(trader): AuthenticatedTrader,
) -> ApiResult<Vec<Position>> {
    let positions = state.ledger.get_positions(&trader).await?;
    Ok(Json(ApiResponse::success(positions)))
}

/// GET /api/v1/trades?market=&mode=&limit=&cursor=
pub async fn get_trades(
    State(state): State<Arc<AppState>>,
    AuthenticatedTrader(trader): AuthenticatedTrader,
    Query(q): Query<TradesQuery>,
) -> ApiResult<Page<Trade>> {
    let page = state
        .ledger
        .get_trade_history(
            &trader,
            q.market.as_deref(),
            q.mode,
            q.limit,
            q.cursor.as_deref(),
        )
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

/// GET /api/v1/markets?mode=&status=&limit=&cursor=
pub async fn get_markets(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MarketsQuery>,
) -> ApiResult<Page<Market>> {
    let page = state
        .ledger
        .get_markets(q.mode, q.status, q.limit, q.cursor.as_deref())
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

/// POST /api/v1/deposit
pub async fn deposit(
    State(state): State<Arc<AppState>>,
    AuthenticatedTrader(trader): AuthenticatedTrader,
    Json(req): Json<DepositRequest>,
) -> ApiResult<BalanceChange> {
    let change = state.ledger.initiate_deposit(&trader, req.amount).await?;
    Ok(Json(ApiResponse::success(change)))
}

/// POST /api/v1/withdraw
pub async fn withdraw(
    State(state): State<Arc<AppState>>,
    AuthenticatedTrader(trader): AuthenticatedTrader,
    Json(req): Json<WithdrawRequest>,
) -> ApiResult<BalanceChange> {
    let change = state
        .ledger
        .initiate_withdraw(&trader, req.amount, req.settle_asset)
        .await?;
    Ok(Json(ApiResponse::success(change)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockVault;
    use crate::core_types::Mode;
    use crate::ledger::{LedgerAssets, LedgerService, SettleAsset};
    use crate::store::MemoryLedgerStore;
    use crate::websocket::ConnectionRegistry;
    use axum::http::Request;
    use rust_decimal_macros::dec;

    const TRADER: &str = "0x00000000000000000000000000000000000000ab";

    fn state() -> Arc<AppState> {
        let store = Arc::new(MemoryLedgerStore::new());
        let vault = Arc::new(MockVault::new("0x00000000000000000000000000000000000000cc"));
        let ledger = Arc::new(LedgerService::new(store, vault, LedgerAssets::default()));
        Arc::new(AppState::new(ledger, Arc::new(ConnectionRegistry::new()), 16))
    }

    async fn extract(header: Option<&str>) -> Result<AuthenticatedTrader, ApiError> {
        let mut builder = Request::builder().uri("/api/v1/balances");
        if let Some(h) = header {
            builder = builder.header(TRADER_HEADER, h);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        AuthenticatedTrader::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_trader_header_required() {
        let err = extract(None).await.unwrap_err();
        assert!(matches!(err.0, LedgerError::Unauthorized));
        let err = extract(Some("  ")).await.unwrap_err();
        assert!(matches!(err.0, LedgerError::Unauthorized));

        let AuthenticatedTrader(id) = extract(Some("0xABCDEF")).await.unwrap();
        assert_eq!(id, "0xabcdef");
    }

    #[tokio::test]
    async fn test_deposit_then_balances() {
        let state = state();
        let trader = AuthenticatedTrader(TRADER.to_string());

        let Json(resp) = deposit(
            State(state.clone()),
            trader.clone(),
            Json(DepositRequest { amount: dec!(100) }),
        )
        .await
        .unwrap();
        assert_eq!(resp.code, 0);
        assert_eq!(resp.data.unwrap().balance, Some(dec!(100)));

        let Json(resp) = get_balances(
            State(state),
            trader,
            Query(ModeQuery { mode: Mode::Real }),
        )
        .await
        .unwrap();
        let balances = resp.data.unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].balance, dec!(100));
    }

    #[tokio::test]
    async fn test_withdraw_over_balance_rejected() {
        let state = state();
        let err = withdraw(
            State(state),
            AuthenticatedTrader(TRADER.to_string()),
            Json(WithdrawRequest {
                amount: dec!(5),
                settle_asset: SettleAsset::Quote,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err.0, LedgerError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_health_reports_connections() {
        let state = state();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        state.ws_registry.add_connection(None, tx);
        let Json(resp) = health_check(State(state)).await.unwrap();
        let health = resp.data.unwrap();
        assert_eq!(health.connections, 1);
        assert_eq!(health.last_block, None);
    }
}
