//! Ledger API error types
//!
//! Errors surfaced by the Ledger Query API. Each maps to a stable error
//! code and an HTTP status so the gateway can render an explicit payload.

use thiserror::Error;

use crate::chain::ChainError;
use crate::store::StoreError;

#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid pagination cursor")]
    InvalidCursor,

    #[error("Missing trader identity")]
    Unauthorized,

    // === Resource Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    // === System Errors ===
    #[error("Store error: {0}")]
    Store(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount => "INVALID_AMOUNT",
            LedgerError::InvalidParameter(_) => "INVALID_PARAMETER",
            LedgerError::InvalidCursor => "INVALID_CURSOR",
            LedgerError::Unauthorized => "UNAUTHORIZED",
            LedgerError::NotFound(_) => "NOT_FOUND",
            LedgerError::Store(_) => "STORE_ERROR",
            LedgerError::Chain(_) => "CHAIN_ERROR",
            LedgerError::Unavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::InvalidAmount
            | LedgerError::InvalidParameter(_)
            | LedgerError::InvalidCursor => 400,
            LedgerError::Unauthorized => 401,
            LedgerError::NotFound(_) => 404,
            LedgerError::Store(_) => 500,
            LedgerError::Chain(_) => 502,
            LedgerError::Unavailable(_) => 503,
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidCursor => LedgerError::InvalidCursor,
            other => LedgerError::Store(other.to_string()),
        }
    }
}

impl From<ChainError> for LedgerError {
    fn from(e: ChainError) -> Self {
        LedgerError::Chain(e.to_string())
    }
}
