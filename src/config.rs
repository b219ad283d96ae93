use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of the push-event queue feeding the fan-out dispatcher
    pub queue_size: usize,
    /// Per-connection outbound queue
    #[serde(default = "default_ws_outbound")]
    pub ws_outbound_capacity: usize,
    /// How long a push waits on a full connection queue before dropping
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
}

fn default_ws_outbound() -> usize {
    256
}

fn default_push_timeout_ms() -> u64 {
    50
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub postgres_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            postgres_url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ChainConfig {
    /// false: in-process mock vault (dev)
    pub enabled: bool,
    pub rpc_url: String,
    pub vault_address: String,
    pub operator_address: String,
    pub rpc_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_backoff_ms: u64,
    pub confirmation_timeout_ms: u64,
    pub receipt_poll_interval_ms: u64,
    pub start_block: u64,
    pub max_block_range: u64,
    /// synth contract address -> asset symbol
    pub synths: HashMap<String, String>,
    pub quote_asset: String,
    pub platform_asset: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rpc_url: "http://127.0.0.1:8545".to_string(),
            vault_address: "0x0000000000000000000000000000000000000001".to_string(),
            operator_address: "0x0000000000000000000000000000000000000002".to_string(),
            rpc_timeout_ms: 10_000,
            poll_interval_ms: 2_000,
            max_backoff_ms: 60_000,
            confirmation_timeout_ms: 120_000,
            receipt_poll_interval_ms: 1_000,
            start_block: 0,
            max_block_range: 1_000,
            synths: HashMap::new(),
            quote_asset: "USDC".to_string(),
            platform_asset: "CXPT".to_string(),
        }
    }
}

impl ChainConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct JobToggle {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl JobToggle {
    const fn every(interval_secs: u64) -> Self {
        Self {
            enabled: true,
            interval_secs,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct JobsConfig {
    pub funding: JobToggle,
    pub expiry: JobToggle,
    pub daily_pnl: JobToggle,
    pub rollup: JobToggle,
    pub oracle: JobToggle,
    pub funding_rate_band: Decimal,
    pub oracle_ttl_secs: u64,
    /// Items processed concurrently within one job run
    pub concurrency: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            funding: JobToggle::every(60),
            expiry: JobToggle::every(60),
            daily_pnl: JobToggle::every(3_600),
            rollup: JobToggle::every(86_400),
            oracle: JobToggle::every(300),
            funding_rate_band: Decimal::new(75, 4),
            oracle_ttl_secs: 7 * 24 * 3600,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OracleConfig {
    pub base_url: String,
    pub vs_currency: String,
    pub timeout_ms: u64,
    /// asset symbol -> oracle id
    pub assets: HashMap<String, String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            vs_currency: "usd".to_string(),
            timeout_ms: 10_000,
            assets: HashMap::from([
                ("BTC".to_string(), "bitcoin".to_string()),
                ("ETH".to_string(), "ethereum".to_string()),
            ]),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ArchiveConfig {
    pub root: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: "./data/archive".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RouterConfig {
    /// POST trade messages here; None keeps them in the in-process queue
    pub aggregator_url: Option<String>,
    pub queue_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            aggregator_url: None,
            queue_size: 10_000,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn parse(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: ledger.log
use_json: false
rotation: daily
gateway:
  host: 0.0.0.0
  port: 8080
  queue_size: 1024
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(!config.chain.enabled);
        assert_eq!(config.jobs.funding_rate_band, dec!(0.0075));
        assert_eq!(config.jobs.oracle_ttl_secs, 604_800);
        assert_eq!(config.gateway.ws_outbound_capacity, 256);
        assert_eq!(config.oracle.assets.get("BTC").map(String::as_str), Some("bitcoin"));
    }

    #[test]
    fn test_sections_override() {
        let yaml = format!(
            "{}{}",
            MINIMAL,
            r#"
store:
  backend: postgres
  postgres_url: postgres://ledger@localhost/ledger
  max_connections: 4
jobs:
  funding:
    enabled: false
    interval_secs: 30
  funding_rate_band: "0.01"
"#
        );
        let config = AppConfig::parse(&yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Postgres);
        assert_eq!(config.store.max_connections, 4);
        assert!(!config.jobs.funding.enabled);
        assert_eq!(config.jobs.funding_rate_band, dec!(0.01));
        // Untouched jobs keep their defaults
        assert!(config.jobs.expiry.enabled);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(AppConfig::load("does-not-exist").is_err());
    }
}
