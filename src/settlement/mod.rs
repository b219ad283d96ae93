//! Settlement and maintenance jobs
//!
//! Every job is stateless: a run reads a bounded candidate set from the
//! store, processes the items concurrently and reports counts. One item's
//! failure is logged and counted, never fatal to the batch. All writes are
//! additive deltas or single conditional store operations, so overlapping or
//! repeated runs are safe.

pub mod archive;
pub mod daily_pnl;
pub mod expiry;
pub mod funding;
pub mod oracle;
pub mod rollup;
pub mod scheduler;

use std::future::Future;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use thiserror::Error;

use crate::core_types::TimestampMs;
use crate::store::StoreError;

pub use archive::{ArchiveError, ArchiveStore, FsArchiveStore};
pub use daily_pnl::{DailyPnlConfig, DailyPnlJob};
pub use expiry::{ExpiryConfig, ExpiryJob};
pub use funding::{FundingConfig, FundingJob};
pub use oracle::{DEFAULT_SNAPSHOT_TTL, HttpPriceOracle, OracleError, OracleJob, PriceOracle};
pub use rollup::RollupJob;
pub use scheduler::{JobSchedule, spawn_jobs};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Invalid data: {0}")]
    Invalid(String),
}

/// What happened to one candidate item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Processed,
    /// Nothing to do now (no price yet, already settled, not due)
    Skipped,
}

/// Counts of one job run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl JobReport {
    pub fn record(&mut self, result: &Result<ItemOutcome, JobError>) {
        match result {
            Ok(ItemOutcome::Processed) => self.processed += 1,
            Ok(ItemOutcome::Skipped) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: JobReport) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.failed
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    /// One pass over the current candidates
    async fn run_once(&self, now: TimestampMs) -> Result<JobReport, JobError>;
}

/// Run `work` over `items` with at most `concurrency` in flight.
/// Failures are logged with the item's label and counted.
pub async fn process_items<T, L, F, Fut>(
    job: &'static str,
    items: Vec<T>,
    concurrency: usize,
    label: L,
    work: F,
) -> JobReport
where
    L: Fn(&T) -> String,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<ItemOutcome, JobError>>,
{
    let mut report = JobReport::default();
    let labelled: Vec<(String, T)> = items.into_iter().map(|t| (label(&t), t)).collect();
    let results: Vec<(String, Result<ItemOutcome, JobError>)> = stream::iter(labelled)
        .map(|(name, item)| {
            let fut = work(item);
            async move { (name, fut.await) }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    for (item, result) in &results {
        if let Err(e) = result {
            tracing::warn!(job, item = %item, error = %e, "Job item failed");
        }
        report.record(result);
    }
    report
}
