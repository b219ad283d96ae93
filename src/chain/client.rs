//! Vault contract write path
//!
//! Every call submits one transaction and waits for a single confirmation
//! (a mined receipt with success status) before returning.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::abi;
use super::error::ChainError;
use super::rpc::{JsonRpcClient, parse_quantity};

/// Confirmed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: u64,
}

#[async_trait]
pub trait VaultClient: Send + Sync {
    /// `deposit(uint256)` sent from the trader's account
    async fn deposit(&self, from: &str, amount: Decimal) -> Result<TxReceipt, ChainError>;

    /// `withdraw(uint256,bool)` sent from the trader's account
    async fn withdraw(
        &self,
        from: &str,
        amount: Decimal,
        as_cxpt: bool,
    ) -> Result<TxReceipt, ChainError>;

    /// `registerSynth(address)` sent from the operator account
    async fn register_synth(&self, synth: &str) -> Result<TxReceipt, ChainError>;

    /// `withdrawFees(address,uint256)` sent from the operator account
    async fn withdraw_fees(&self, to: &str, amount: Decimal) -> Result<TxReceipt, ChainError>;
}

#[derive(Debug, Clone)]
pub struct VaultClientConfig {
    pub vault_address: String,
    /// Operator account used for admin calls
    pub operator_address: String,
    pub confirmation_timeout: Duration,
    pub receipt_poll_interval: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptBody {
    block_number: Option<String>,
    status: Option<String>,
}

/// Vault client for a node holding unlocked accounts (`eth_sendTransaction`)
pub struct JsonRpcVaultClient {
    rpc: Arc<JsonRpcClient>,
    config: VaultClientConfig,
}

impl JsonRpcVaultClient {
    pub fn new(rpc: Arc<JsonRpcClient>, config: VaultClientConfig) -> Self {
        info!(
            vault = %config.vault_address,
            rpc = %rpc.url(),
            "Vault client initialised"
        );
        Self { rpc, config }
    }

    async fn send(&self, from: &str, calldata: String) -> Result<TxReceipt, ChainError> {
        let tx = json!({
            "from": from,
            "to": self.config.vault_address,
            "data": calldata,
        });
        let tx_hash: String = self.rpc.call("eth_sendTransaction", [tx]).await?;
        debug!(tx_hash = %tx_hash, "Vault transaction submitted");
        self.wait_for_receipt(tx_hash).await
    }

    async fn wait_for_receipt(&self, tx_hash: String) -> Result<TxReceipt, ChainError> {
        let deadline = tokio::time::Instant::now() + self.config.confirmation_timeout;
        loop {
            let receipt: Option<ReceiptBody> = self
                .rpc
                .call_optional("eth_getTransactionReceipt", [&tx_hash])
                .await?;
            if let Some(receipt) = receipt {
                if receipt.status.as_deref() == Some("0x0") {
                    return Err(ChainError::Reverted(tx_hash));
                }
                if let Some(block) = receipt.block_number {
                    return Ok(TxReceipt {
                        block_number: parse_quantity(&block)?,
                        tx_hash,
                    });
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChainError::ConfirmationTimeout(tx_hash));
            }
            tokio::time::sleep(self.config.receipt_poll_interval).await;
        }
    }
}

#[async_trait]
impl VaultClient for JsonRpcVaultClient {
    async fn deposit(&self, from: &str, amount: Decimal) -> Result<TxReceipt, ChainError> {
        let data = abi::encode_call("deposit(uint256)", &[abi::encode_amount(amount)?]);
        self.send(from, data).await
    }

    async fn withdraw(
        &self,
        from: &str,
        amount: Decimal,
        as_cxpt: bool,
    ) -> Result<TxReceipt, ChainError> {
        let data = abi::encode_call(
            "withdraw(uint256,bool)",
            &[abi::encode_amount(amount)?, abi::encode_bool(as_cxpt)],
        );
        self.send(from, data).await
    }

    async fn register_synth(&self, synth: &str) -> Result<TxReceipt, ChainError> {
        let data = abi::encode_call("registerSynth(address)", &[abi::encode_address(synth)?]);
        self.send(&self.config.operator_address, data).await
    }

    async fn withdraw_fees(&self, to: &str, amount: Decimal) -> Result<TxReceipt, ChainError> {
        let data = abi::encode_call(
            "withdrawFees(address,uint256)",
            &[abi::encode_address(to)?, abi::encode_amount(amount)?],
        );
        self.send(&self.config.operator_address, data).await
    }
}

#[cfg(any(test, feature = "mock-chain"))]
pub use mock::MockVault;

#[cfg(any(test, feature = "mock-chain"))]
mod mock {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::{TxReceipt, VaultClient};
    use crate::chain::abi;
    use crate::chain::error::ChainError;
    use crate::chain::events::{RawLog, VaultEvent, VaultTopics, encode_log};
    use crate::chain::listener::LogSource;
    use crate::chain::rpc::to_quantity;

    #[derive(Default)]
    struct MockChainState {
        block: u64,
        logs: Vec<RawLog>,
    }

    /// In-process vault: every call mines one block and emits the event the
    /// real contract would, so the chain listener can consume it.
    pub struct MockVault {
        address: String,
        topics: VaultTopics,
        state: Mutex<MockChainState>,
    }

    impl MockVault {
        pub fn new(address: impl Into<String>) -> Self {
            Self {
                address: abi::normalize_address(&address.into()),
                topics: VaultTopics::new(),
                state: Mutex::new(MockChainState::default()),
            }
        }

        pub fn address(&self) -> &str {
            &self.address
        }

        /// Mine a block carrying `events` (none for admin calls)
        pub fn mine(&self, events: &[VaultEvent]) -> Result<TxReceipt, ChainError> {
            let tx_hash = format!(
                "0x{}{}",
                uuid::Uuid::new_v4().simple(),
                uuid::Uuid::new_v4().simple()
            );
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.block += 1;
            let block = state.block;
            for (i, event) in events.iter().enumerate() {
                let log = encode_log(event, &self.topics, &self.address, &tx_hash, block, i as u64)?;
                state.logs.push(log);
            }
            Ok(TxReceipt {
                tx_hash,
                block_number: block,
            })
        }

        /// Drop `tx_hash` from the canonical chain: its logs are re-emitted
        /// with `removed = true` in a new block. With `reinclude` the same
        /// logs land again in the block after that, as on the winning fork.
        /// Returns how many logs the transaction had.
        pub fn reorg_tx(&self, tx_hash: &str, reinclude: bool) -> usize {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let (orphaned, canonical): (Vec<RawLog>, Vec<RawLog>) = std::mem::take(&mut state.logs)
                .into_iter()
                .partition(|l| l.transaction_hash.as_deref() == Some(tx_hash) && !l.removed);
            state.logs = canonical;

            state.block += 1;
            let removed_at = Some(to_quantity(state.block));
            for log in &orphaned {
                state.logs.push(RawLog {
                    block_number: removed_at.clone(),
                    removed: true,
                    ..log.clone()
                });
            }
            if reinclude {
                state.block += 1;
                let included_at = Some(to_quantity(state.block));
                for log in &orphaned {
                    state.logs.push(RawLog {
                        block_number: included_at.clone(),
                        ..log.clone()
                    });
                }
            }
            orphaned.len()
        }
    }

    #[async_trait]
    impl VaultClient for MockVault {
        async fn deposit(&self, from: &str, amount: Decimal) -> Result<TxReceipt, ChainError> {
            self.mine(&[VaultEvent::Deposited {
                trader: from.to_string(),
                amount,
            }])
        }

        async fn withdraw(
            &self,
            from: &str,
            amount: Decimal,
            as_cxpt: bool,
        ) -> Result<TxReceipt, ChainError> {
            self.mine(&[VaultEvent::Withdrawn {
                trader: from.to_string(),
                amount,
                as_cxpt,
            }])
        }

        async fn register_synth(&self, synth: &str) -> Result<TxReceipt, ChainError> {
            abi::encode_address(synth)?;
            self.mine(&[])
        }

        async fn withdraw_fees(&self, to: &str, amount: Decimal) -> Result<TxReceipt, ChainError> {
            abi::encode_address(to)?;
            abi::encode_amount(amount)?;
            self.mine(&[])
        }
    }

    #[async_trait]
    impl LogSource for MockVault {
        async fn latest_block(&self) -> Result<u64, ChainError> {
            Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).block)
        }

        async fn get_logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, ChainError> {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let mut logs = Vec::new();
            for log in &state.logs {
                let block = log.block()?;
                if block >= from && block <= to {
                    logs.push(log.clone());
                }
            }
            Ok(logs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::listener::LogSource;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_mock_vault_emits_deposit_log() {
        let vault = MockVault::new("0x00000000000000000000000000000000000000cc");
        let trader = "0x00000000000000000000000000000000000000aa";
        let receipt = vault.deposit(trader, dec!(100)).await.unwrap();
        assert_eq!(receipt.block_number, 1);
        assert_eq!(receipt.tx_hash.len(), 66);

        vault.register_synth(trader).await.unwrap();
        assert_eq!(vault.latest_block().await.unwrap(), 2);

        let logs = vault.get_logs(1, 2).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].transaction_hash.as_deref(), Some(receipt.tx_hash.as_str()));
    }

    #[tokio::test]
    async fn test_mock_vault_validates_arguments() {
        let vault = MockVault::new("0x00000000000000000000000000000000000000cc");
        assert!(vault.register_synth("0x12").await.is_err());
        assert!(
            vault
                .withdraw_fees("0x00000000000000000000000000000000000000aa", dec!(-1))
                .await
                .is_err()
        );
    }
}
