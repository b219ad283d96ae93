//! API response envelope, error codes and request bodies

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::Mode;
use crate::error::LedgerError;
use crate::ledger::SettleAsset;
use crate::models::MarketStatus;

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: actual data (success) or absent (error)
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: error_codes::SUCCESS,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

pub mod error_codes {
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;
    pub const INVALID_AMOUNT: i32 = 1002;
    pub const INVALID_CURSOR: i32 = 1003;

    // Auth errors (2xxx)
    pub const MISSING_AUTH: i32 = 2001;

    // Resource errors (4xxx)
    pub const NOT_FOUND: i32 = 4001;

    // Server errors (5xxx)
    pub const STORE_ERROR: i32 = 5001;
    pub const CHAIN_ERROR: i32 = 5002;
    pub const SERVICE_UNAVAILABLE: i32 = 5003;
}

/// Handler error: renders a `LedgerError` as status + envelope
#[derive(Debug)]
pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn numeric_code(&self) -> i32 {
        use error_codes::*;
        match self.0 {
            LedgerError::InvalidAmount => INVALID_AMOUNT,
            LedgerError::InvalidParameter(_) => INVALID_PARAMETER,
            LedgerError::InvalidCursor => INVALID_CURSOR,
            LedgerError::Unauthorized => MISSING_AUTH,
            LedgerError::NotFound(_) => NOT_FOUND,
            LedgerError::Store(_) => STORE_ERROR,
            LedgerError::Chain(_) => CHAIN_ERROR,
            LedgerError::Unavailable(_) => SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "Request failed");
        }
        let body = ApiResponse::<()>::error(
            self.numeric_code(),
            format!("{}: {}", self.0.code(), self.0),
        );
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// Query strings and request bodies
// ============================================================================

fn default_mode() -> Mode {
    Mode::Real
}

#[derive(Debug, Deserialize)]
pub struct ModeQuery {
    #[serde(default = "default_mode")]
    pub mode: Mode,
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    pub market: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarketsQuery {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    pub status: Option<MarketStatus>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequest {
    pub amount: Decimal,
    #[serde(default)]
    pub settle_asset: SettleAsset,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub timestamp_ms: i64,
    pub connections: usize,
    pub channels: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_block: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope_omits_data() {
        let body = serde_json::to_value(ApiResponse::<()>::error(1001, "bad")).unwrap();
        assert_eq!(body["code"], 1001);
        assert!(body.get("data").is_none());
    }

    #[test]
    fn test_api_error_status() {
        let resp = ApiError(LedgerError::Unauthorized).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = ApiError(LedgerError::Chain("reverted".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_withdraw_body_defaults_to_quote() {
        let req: WithdrawRequest = serde_json::from_str(r#"{"amount":"25.5"}"#).unwrap();
        assert_eq!(req.settle_asset, SettleAsset::Quote);
        let req: WithdrawRequest =
            serde_json::from_str(r#"{"amount":10,"settleAsset":"platform"}"#).unwrap();
        assert_eq!(req.settle_asset, SettleAsset::Platform);
    }

    #[test]
    fn test_trades_query_defaults_to_real() {
        let q: TradesQuery = serde_json::from_str(r#"{"market":"BTC-PERP"}"#).unwrap();
        assert_eq!(q.mode, Mode::Real);
        assert!(q.limit.is_none());
    }
}
