use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC connection failed: {0}")]
    RpcConnection(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Transaction {0} reverted")]
    Reverted(String),

    #[error("Timed out waiting for confirmation of {0}")]
    ConfirmationTimeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ChainError {
    /// Transport-level failures are retried by the listener with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::RpcConnection(_) | ChainError::Rpc { .. } | ChainError::Store(_)
        )
    }
}
