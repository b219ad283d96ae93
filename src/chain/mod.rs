//! Vault contract integration
//!
//! - `listener`: reconciles ledger balances from confirmed vault events
//! - `client`: submits deposit/withdraw/admin transactions
//! - `events` / `abi` / `rpc`: decoding and transport

pub mod abi;
pub mod client;
pub mod error;
pub mod events;
pub mod listener;
pub mod rpc;

pub use client::{JsonRpcVaultClient, TxReceipt, VaultClient, VaultClientConfig};
#[cfg(any(test, feature = "mock-chain"))]
pub use client::MockVault;
pub use error::ChainError;
pub use events::{EventAssets, LoggedEvent, RawLog, VaultEvent, VaultTopics};
pub use listener::{ChainEventListener, ListenerConfig, LogSource, PollReport, RpcLogSource};
pub use rpc::JsonRpcClient;
