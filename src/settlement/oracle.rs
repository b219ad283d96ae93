//! Oracle ingestion
//!
//! Pulls reference prices for the configured assets and appends one price
//! snapshot per asset with a retention marker. Expired snapshots are purged
//! on the same run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use super::{ItemOutcome, Job, JobError, JobReport, process_items};
use crate::core_types::{Asset, TimestampMs};
use crate::models::PriceSnapshot;
use crate::store::LedgerStore;

pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Oracle request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Source tag stored on snapshots
    fn source(&self) -> &str;

    /// Current prices; assets the source has no quote for are absent
    async fn fetch_prices(&self, assets: &[Asset]) -> Result<HashMap<Asset, Decimal>, OracleError>;
}

/// CoinGecko-style `GET {base}/simple/price?ids=..&vs_currencies=..`
pub struct HttpPriceOracle {
    client: reqwest::Client,
    base_url: String,
    vs_currency: String,
    /// asset symbol -> oracle id (e.g. BTC -> bitcoin)
    ids: HashMap<Asset, String>,
}

impl HttpPriceOracle {
    pub fn new(
        base_url: impl Into<String>,
        vs_currency: impl Into<String>,
        ids: HashMap<Asset, String>,
        timeout: Duration,
    ) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            vs_currency: vs_currency.into().to_ascii_lowercase(),
            ids,
        })
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    fn source(&self) -> &str {
        "coingecko"
    }

    async fn fetch_prices(&self, assets: &[Asset]) -> Result<HashMap<Asset, Decimal>, OracleError> {
        let mut id_to_asset = HashMap::with_capacity(assets.len());
        for asset in assets {
            match self.ids.get(asset) {
                Some(id) => {
                    id_to_asset.insert(id.clone(), asset.clone());
                }
                None => warn!(asset = %asset, "No oracle id configured, asset skipped"),
            }
        }
        if id_to_asset.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<&str> = id_to_asset.keys().map(String::as_str).collect();

        let body: HashMap<String, HashMap<String, Decimal>> = self
            .client
            .get(format!("{}/simple/price", self.base_url))
            .query(&[("ids", ids.join(",")), ("vs_currencies", self.vs_currency.clone())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(body
            .into_iter()
            .filter_map(|(id, quotes)| {
                let asset = id_to_asset.get(&id)?.clone();
                let price = quotes.get(&self.vs_currency).copied()?;
                Some((asset, price))
            })
            .collect())
    }
}

pub struct OracleJob {
    store: Arc<dyn LedgerStore>,
    oracle: Arc<dyn PriceOracle>,
    assets: Vec<Asset>,
    ttl: Duration,
    concurrency: usize,
}

impl OracleJob {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        oracle: Arc<dyn PriceOracle>,
        assets: Vec<Asset>,
        ttl: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            oracle,
            assets,
            ttl,
            concurrency,
        }
    }
}

#[async_trait]
impl Job for OracleJob {
    fn name(&self) -> &'static str {
        "oracle"
    }

    async fn run_once(&self, now: TimestampMs) -> Result<JobReport, JobError> {
        let prices = self.oracle.fetch_prices(&self.assets).await?;
        let expires_at = now + self.ttl.as_millis() as i64;
        let source = self.oracle.source().to_string();

        let report = process_items(
            self.name(),
            self.assets.clone(),
            self.concurrency,
            |a| a.clone(),
            |asset| {
                let quote = prices.get(&asset).copied();
                let source = source.clone();
                async move {
                    let Some(price) = quote else {
                        warn!(asset = %asset, "Oracle returned no price");
                        return Ok(ItemOutcome::Skipped);
                    };
                    if price <= Decimal::ZERO {
                        return Err(JobError::Invalid(format!("non-positive price for {}", asset)));
                    }
                    self.store
                        .put_price_snapshot(&PriceSnapshot {
                            asset,
                            price,
                            timestamp: now,
                            source,
                            expires_at,
                        })
                        .await?;
                    Ok(ItemOutcome::Processed)
                }
            },
        )
        .await;

        let purged = self.store.purge_expired_prices(now).await?;
        info!(
            written = report.processed,
            purged,
            "Oracle prices ingested"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedgerStore;
    use rust_decimal_macros::dec;

    struct FixedOracle(HashMap<Asset, Decimal>);

    #[async_trait]
    impl PriceOracle for FixedOracle {
        fn source(&self) -> &str {
            "fixed"
        }

        async fn fetch_prices(&self, assets: &[Asset]) -> Result<HashMap<Asset, Decimal>, OracleError> {
            Ok(assets
                .iter()
                .filter_map(|a| self.0.get(a).map(|p| (a.clone(), *p)))
                .collect())
        }
    }

    #[tokio::test]
    async fn test_writes_snapshot_per_asset_with_ttl() {
        let store = Arc::new(MemoryLedgerStore::new());
        let oracle = Arc::new(FixedOracle(HashMap::from([
            ("BTC".to_string(), dec!(65000)),
            ("ETH".to_string(), dec!(3200)),
        ])));
        let job = OracleJob::new(
            store.clone(),
            oracle,
            vec!["BTC".into(), "ETH".into(), "DOGE".into()],
            DEFAULT_SNAPSHOT_TTL,
            4,
        );
        let now = 1_714_566_896_789;
        let report = job.run_once(now).await.unwrap();
        assert_eq!((report.processed, report.skipped), (2, 1));

        let week = 7 * 86_400_000;
        let btc = store.latest_price("BTC", now).await.unwrap().unwrap();
        assert_eq!(btc.price, dec!(65000));
        assert_eq!(btc.expires_at, now + week);
        let eth = store.latest_price("ETH", now).await.unwrap().unwrap();
        assert_eq!(eth.price, dec!(3200));
        assert_eq!(eth.source, "fixed");

        // A week later the next run replaces and purges the old snapshots
        let later = now + week + 1;
        job.run_once(later).await.unwrap();
        let fresh = store.latest_price("BTC", later).await.unwrap().unwrap();
        assert_eq!(fresh.timestamp, later);
        assert_eq!(store.purge_expired_prices(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unmapped_assets_are_skipped() {
        // Nothing listens on the discard port: any request would fail
        let oracle = HttpPriceOracle::new(
            "http://127.0.0.1:9",
            "USD",
            HashMap::from([("ETH".to_string(), "ethereum".to_string())]),
            Duration::from_millis(100),
        )
        .unwrap();
        let prices = oracle.fetch_prices(&["BTC".into(), "DOGE".into()]).await.unwrap();
        assert!(prices.is_empty());
        // A mapped asset still goes to the network
        assert!(oracle.fetch_prices(&["BTC".into(), "ETH".into()]).await.is_err());
    }

    #[tokio::test]
    async fn test_unmapped_asset_does_not_fail_the_run() {
        let store = Arc::new(MemoryLedgerStore::new());
        let oracle = HttpPriceOracle::new(
            "http://127.0.0.1:9",
            "USD",
            HashMap::new(),
            Duration::from_millis(100),
        )
        .unwrap();
        let job = OracleJob::new(store, Arc::new(oracle), vec!["BTC".into()], DEFAULT_SNAPSHOT_TTL, 1);
        let report = job.run_once(1_714_566_896_789).await.unwrap();
        assert_eq!((report.processed, report.skipped, report.failed), (0, 1, 0));
    }
}
