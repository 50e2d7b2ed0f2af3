//! Background Jobs
//!
//! Optimization and retention work runs outside the request path. Callers
//! hand a [`Job`] to a [`JobDispatcher`] and move on; the tokio dispatcher
//! spawns it onto the runtime and logs the outcome. Nothing is awaited or
//! retried by the caller.

pub mod jobs;
pub mod workers;

pub use jobs::{Job, OptimizeTarget};
pub use workers::Worker;

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::{error, info, warn};

pub trait JobDispatcher: Send + Sync {
    /// Fire and forget
    fn dispatch(&self, job: Job);
}

pub struct TokioDispatcher {
    worker: Arc<Worker>,
}

impl TokioDispatcher {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }
}

impl JobDispatcher for TokioDispatcher {
    fn dispatch(&self, job: Job) {
        let worker = self.worker.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.process_job(job).await {
                error!("Job {} failed: {}", job.name(), e);
            }
        });
    }
}

pub fn parse_schedule(expression: &str) -> anyhow::Result<Schedule> {
    Schedule::from_str(expression)
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expression, e))
}

/// First scheduled time strictly after `after`
pub fn next_run(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Dispatch `job` at every tick of `schedule` (UTC) until the task is dropped
pub async fn run_cron(dispatcher: Arc<dyn JobDispatcher>, schedule: Schedule, job: Job) {
    loop {
        let Some(next) = next_run(&schedule, Utc::now()) else {
            warn!("Schedule for {} has no upcoming run, stopping", job.name());
            return;
        };
        info!(
            "Next {} run at {}",
            job.name(),
            next.format("%Y-%m-%d %H:%M:%S UTC")
        );

        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
        dispatcher.dispatch(job);
    }
}
