//! Repeated job invocations

use super::job::{DataSetLoadJob, JobOutcome};
use ccw_common::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Invokes a [`DataSetLoadJob`] once, or on a fixed interval until cancelled.
///
/// Cancellation is only observed between invocations; a running invocation
/// always finishes.
pub struct JobScheduler {
    interval: Option<Duration>,
    cancel: CancellationToken,
}

impl JobScheduler {
    pub fn new(interval: Option<Duration>, cancel: CancellationToken) -> Self {
        Self { interval, cancel }
    }

    pub fn for_job(job: &DataSetLoadJob, cancel: CancellationToken) -> Self {
        Self::new(job.schedule(), cancel)
    }

    /// Run-once mode returns the invocation's error. Interval mode logs errors
    /// and tries again on the next tick.
    pub async fn run(&self, job: &mut DataSetLoadJob) -> Result<()> {
        let Some(interval) = self.interval else {
            info!("Running data set load job once");
            let outcome = job.call().await?;
            info!(?outcome, "Data set load job finished");
            return Ok(());
        };

        info!(interval_secs = interval.as_secs_f64(), "Starting scheduled data set load job");
        let mut invocations = 0u64;

        while !self.cancel.is_cancelled() {
            invocations += 1;
            match job.call().await {
                Ok(JobOutcome::WorkDone) => info!(invocation = invocations, "Data set load job did work"),
                Ok(JobOutcome::NothingToDo) => {},
                Err(e) => error!(invocation = invocations, error = %e, "Data set load job failed"),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {},
            }
        }

        info!(invocations, "Scheduled data set load job stopped");
        Ok(())
    }
}
