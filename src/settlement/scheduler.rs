//! Periodic job runner: one tokio task per job, each on its own interval

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use super::Job;
use crate::core_types::now_ms;

pub struct JobSchedule {
    pub job: Arc<dyn Job>,
    pub every: Duration,
}

impl JobSchedule {
    pub fn new(job: Arc<dyn Job>, every: Duration) -> Self {
        Self { job, every }
    }
}

/// Run one job forever. A failed run is logged; the next tick proceeds.
pub async fn run_job(job: Arc<dyn Job>, every: Duration) {
    let mut tick = interval(every.max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(job = job.name(), every_ms = every.as_millis() as u64, "Job scheduled");
    loop {
        tick.tick().await;
        let started = std::time::Instant::now();
        match job.run_once(now_ms()).await {
            Ok(report) => {
                if report.total() > 0 {
                    info!(
                        job = job.name(),
                        processed = report.processed,
                        skipped = report.skipped,
                        failed = report.failed,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Job run finished"
                    );
                }
            }
            Err(e) => error!(job = job.name(), error = %e, "Job run failed"),
        }
    }
}

pub fn spawn_jobs(schedules: Vec<JobSchedule>) -> Vec<JoinHandle<()>> {
    schedules
        .into_iter()
        .map(|s| tokio::spawn(run_job(s.job, s.every)))
        .collect()
}
