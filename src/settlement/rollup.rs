//! Metrics rollup: intraday minute rows of the prior UTC day become one
//! daily row per key, lifetime counters grow by each newly written day, and
//! the day's aggregate is archived as `daily/<YYYY-MM-DD>.json`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use super::archive::ArchiveStore;
use super::{ItemOutcome, Job, JobError, JobReport, process_items};
use crate::core_types::TimestampMs;
use crate::models::{DailyStat, IntradayStat, day_range, utc_date};
use crate::store::LedgerStore;

#[derive(Serialize)]
struct DailyArchive<'a> {
    date: NaiveDate,
    generated_at: TimestampMs,
    stats: &'a [DailyStat],
}

pub fn archive_key(date: NaiveDate) -> String {
    format!("daily/{}.json", date.format("%Y-%m-%d"))
}

/// Sum counters and average the funding gauge per key
pub fn aggregate(date: NaiveDate, rows: &[IntradayStat]) -> Vec<DailyStat> {
    #[derive(Default)]
    struct Acc {
        volume: Decimal,
        fees: Decimal,
        trade_count: u64,
        rate_sum: Decimal,
        rate_samples: u32,
    }

    let mut by_key: BTreeMap<&str, Acc> = BTreeMap::new();
    for row in rows {
        let acc = by_key.entry(row.key.as_str()).or_default();
        acc.volume += row.volume;
        acc.fees += row.fees;
        acc.trade_count += row.trade_count;
        if let Some(rate) = row.funding_rate {
            acc.rate_sum += rate;
            acc.rate_samples += 1;
        }
    }

    by_key
        .into_iter()
        .map(|(key, acc)| DailyStat {
            key: key.to_string(),
            date,
            volume: acc.volume,
            fees: acc.fees,
            avg_funding_rate: (acc.rate_samples > 0)
                .then(|| (acc.rate_sum / Decimal::from(acc.rate_samples)).round_dp(10)),
            trade_count: acc.trade_count,
        })
        .collect()
}

pub struct RollupJob {
    store: Arc<dyn LedgerStore>,
    archive: Arc<dyn ArchiveStore>,
    concurrency: usize,
}

impl RollupJob {
    pub fn new(store: Arc<dyn LedgerStore>, archive: Arc<dyn ArchiveStore>, concurrency: usize) -> Self {
        Self {
            store,
            archive,
            concurrency,
        }
    }

    /// Roll up one specific UTC date
    pub async fn rollup_day(&self, date: NaiveDate, now: TimestampMs) -> Result<JobReport, JobError> {
        let (from, to) = day_range(date);
        let rows = self.store.query_intraday(from, to).await?;
        let stats = aggregate(date, &rows);

        let report = process_items(
            self.name(),
            stats.clone(),
            self.concurrency,
            |s| s.key.clone(),
            |s| async move {
                if self.store.put_daily_stat(&s, now).await? {
                    Ok(ItemOutcome::Processed)
                } else {
                    Ok(ItemOutcome::Skipped)
                }
            },
        )
        .await;

        let body = serde_json::to_vec_pretty(&DailyArchive {
            date,
            generated_at: now,
            stats: &stats,
        })
        .map_err(|e| JobError::Invalid(e.to_string()))?;
        self.archive.put_object(&archive_key(date), body).await?;

        info!(
            date = %date,
            intraday_rows = rows.len(),
            keys = stats.len(),
            new_rows = report.processed,
            "Daily rollup written"
        );
        Ok(report)
    }
}

#[async_trait]
impl Job for RollupJob {
    fn name(&self) -> &'static str {
        "rollup"
    }

    async fn run_once(&self, now: TimestampMs) -> Result<JobReport, JobError> {
        let today = utc_date(now);
        let yesterday = today
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| JobError::Invalid(format!("no day before {}", today)))?;
        self.rollup_day(yesterday, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IntradayUpdate;
    use crate::settlement::archive::FsArchiveStore;
    use crate::store::MemoryLedgerStore;
    use rust_decimal_macros::dec;

    #[test]
    fn test_aggregate_sums_and_averages() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let row = |key: &str, volume: Decimal, rate: Option<Decimal>| IntradayStat {
            key: key.into(),
            bucket: 0,
            volume,
            fees: dec!(1),
            funding_rate: rate,
            open_interest: dec!(0),
            trade_count: 2,
        };
        let stats = aggregate(
            date,
            &[
                row("BTC-PERP", dec!(10), Some(dec!(0.001))),
                row("BTC-PERP", dec!(20), None),
                row("BTC-PERP", dec!(5), Some(dec!(0.003))),
                row("GLOBAL", dec!(7), None),
            ],
        );
        assert_eq!(stats.len(), 2);
        let btc = &stats[0];
        assert_eq!(btc.key, "BTC-PERP");
        assert_eq!(btc.volume, dec!(35));
        assert_eq!(btc.fees, dec!(3));
        assert_eq!(btc.trade_count, 6);
        assert_eq!(btc.avg_funding_rate, Some(dec!(0.002)));
        assert_eq!(stats[1].avg_funding_rate, None);
    }

    #[tokio::test]
    async fn test_rollup_prior_day_and_rerun() {
        let store = Arc::new(MemoryLedgerStore::new());
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(FsArchiveStore::new(dir.path()));

        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let (start, end) = day_range(date);
        for (offset, volume) in [(0, dec!(10)), (60_000, dec!(20)), (120_000, dec!(5))] {
            let mut u = IntradayUpdate::for_key("BTC-PERP", start + offset);
            u.volume = volume;
            u.trade_count = 1;
            store.upsert_intraday(&u).await.unwrap();
        }
        // A row from the current day stays out of the rollup
        let mut today = IntradayUpdate::for_key("BTC-PERP", end + 1);
        today.volume = dec!(999);
        store.upsert_intraday(&today).await.unwrap();

        let job = RollupJob::new(store.clone(), archive, 4);
        let now = end + 3_600_000;
        assert_eq!(job.run_once(now).await.unwrap().processed, 1);
        assert_eq!(job.run_once(now).await.unwrap().processed, 0);

        let daily = store.get_daily_stats(date).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].volume, dec!(35));

        let lifetime = store.get_lifetime("BTC-PERP").await.unwrap().unwrap();
        assert_eq!(lifetime.volume, dec!(35));
        assert_eq!(lifetime.trade_count, 3);

        let archived = std::fs::read_to_string(dir.path().join("daily/2024-05-01.json")).unwrap();
        assert!(archived.contains("BTC-PERP"));
    }
}
