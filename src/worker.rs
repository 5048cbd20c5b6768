use std::time::Duration;

use rand::Rng;
use sqlx::SqlitePool;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::errors::Result;
use crate::executor::{self, ExecutionResult};
use crate::schema::Job;
use crate::storage;
use crate::{config, util};

pub(crate) struct Worker {
    pub(crate) pool: SqlitePool,
    pub(crate) worker_id: String,
    pub(crate) stop_when_empty: bool,
    pub(crate) jitter: Duration,
    pub(crate) stopping: CancellationToken,
}

impl Worker {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self, poll_interval: Duration) -> Duration {
        if self.jitter.is_zero() {
            return poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        poll_interval + Duration::from_millis(random_jitter)
    }

    /// Sleep for `duration`, or less if the stop token fires first.
    /// Returns `true` when the worker should exit.
    async fn idle(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stopping.cancelled() => true,
            _ = sleep(duration) => false,
        }
    }

    /// Process jobs until stopped, or until the queue drains if
    /// `stop_when_empty` is set.
    ///
    /// The poll interval is re-read from config at every loop head, so
    /// a live `config_set` takes effect within one iteration.
    pub(crate) async fn run(&self) {
        loop {
            if self.stopping.is_cancelled() {
                debug!("stop requested, worker exiting");
                break;
            }

            let poll_interval = match config::poll_interval(&self.pool).await {
                Ok(seconds) => Duration::from_secs(seconds.unsigned_abs()),
                Err(error) => {
                    error!(%error, "failed to read poll interval");
                    Duration::from_secs(1)
                }
            };

            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.stop_when_empty => {
                    // Drain exits only on a quiescent snapshot: a failing
                    // job about to be rescheduled still counts as live.
                    match storage::live_count(&self.pool).await {
                        Ok(0) => {
                            debug!("queue is quiescent, worker shutting down");
                            break;
                        }
                        Ok(live) => {
                            trace!(live, "queue not quiescent yet, polling again");
                            if self.idle(self.sleep_duration_with_jitter(poll_interval)).await {
                                break;
                            }
                        }
                        Err(error) => {
                            error!(%error, "failed to snapshot queue depth");
                            if self.idle(self.sleep_duration_with_jitter(poll_interval)).await {
                                break;
                            }
                        }
                    }
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter(poll_interval);
                    trace!("no claimable job found, polling again in {sleep_duration:?}");
                    if self.idle(sleep_duration).await {
                        break;
                    }
                }
                Err(error) => {
                    // Leave the row (if any) to the stale-lock sweep.
                    error!(%error, "failed to run job");
                    if self.idle(self.sleep_duration_with_jitter(poll_interval)).await {
                        break;
                    }
                }
            }
        }
    }

    /// Claim and run the next eligible job.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if nothing was claimable
    /// - `Err(...)` on a store error that exhausted internal retries
    async fn run_next_job(&self) -> Result<Option<String>> {
        trace!("looking for a claimable job");

        let Some(job) = storage::claim(&self.pool, &self.worker_id, util::now()).await? else {
            return Ok(None);
        };

        let job_id = job.id.clone();
        let span = info_span!("job", job.id = %job_id, attempt = job.attempts + 1);

        async {
            debug!(command = %job.command, "running job");
            let result = executor::execute(&job).await;
            self.finalize(&job, &result).await
        }
        .instrument(span)
        .await?;

        Ok(Some(job_id))
    }

    /// Apply the retry state machine: success completes, a failure
    /// with retries left reschedules with exponential backoff, an
    /// exhausted failure goes to the DLQ.
    async fn finalize(&self, job: &Job, result: &ExecutionResult) -> Result<()> {
        if result.is_success() {
            let applied =
                storage::finish_success(&self.pool, &job.id, &self.worker_id, 0).await?;
            if applied {
                info!("job completed");
            } else {
                warn!("claim was lost before completion could be recorded");
            }
            return Ok(());
        }

        let new_attempts = job.attempts + 1;
        let message = result.message.as_deref().unwrap_or("attempt failed");

        let applied = if new_attempts <= job.max_retries {
            let base = config::backoff_base(&self.pool).await?;
            let delay = util::backoff_delay(base, new_attempts);
            let applied = storage::finish_retry(
                &self.pool,
                &job.id,
                &self.worker_id,
                result.exit_code,
                message,
                delay,
            )
            .await?;
            if applied {
                warn!(
                    error = message,
                    delay,
                    attempt = new_attempts,
                    max_retries = job.max_retries,
                    "job failed, will retry"
                );
            }
            applied
        } else {
            let applied = storage::finish_dead(
                &self.pool,
                &job.id,
                &self.worker_id,
                result.exit_code,
                message,
            )
            .await?;
            if applied {
                error!(
                    error = message,
                    attempts = new_attempts,
                    "job exhausted its retries, moved to dead letter queue"
                );
            }
            applied
        };

        if !applied {
            warn!("claim was lost before the failure could be recorded");
        }
        Ok(())
    }
}
