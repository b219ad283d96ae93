//! DePIN ledger: balances, positions, trades and statistics for a
//! synthetic-asset exchange, reconciled against the on-chain vault and
//! pushed to clients in real time.
//!
//! # Modules
//!
//! - [`core_types`] - Type aliases, funds mode and market partitions
//! - [`models`] - Ledger records (balances, positions, orders, trades, stats)
//! - [`store`] - `LedgerStore` trait with in-memory and PostgreSQL backends
//! - [`chain`] - Vault client, ABI codec and chain event listener
//! - [`ledger`] - Ledger query and transfer service
//! - [`router`] - Trade change-feed router
//! - [`settlement`] - Funding, expiry, daily PnL, rollup and oracle jobs
//! - [`websocket`] - Connection registry and fan-out dispatcher
//! - [`gateway`] - HTTP API and WebSocket endpoint

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod error;
pub mod logging;
pub mod models;

// Persistence
pub mod db;
pub mod store;

// Services
pub mod chain;
pub mod ledger;
pub mod router;
pub mod settlement;

// Real-time and HTTP surfaces
pub mod gateway;
pub mod websocket;

// Convenient re-exports at crate root
pub use core_types::{Asset, MarketSymbol, Mode, TimestampMs, TraderId};
pub use error::LedgerError;
pub use ledger::{LedgerAssets, LedgerService};
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore, StoreError};
