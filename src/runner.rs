use std::time::Duration;

use chrono::Duration as ChronoDuration;
use futures_util::future::join_all;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::errors::Result;
use crate::queue::Queue;
use crate::worker::Worker;
use crate::{config, shutdown, storage, util};

const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Supervisor for a pool of job workers.
///
/// Recovers stale locks on start, launches N workers with distinct
/// identities, keeps a periodic stale-lock sweep running, and ties the
/// whole pool to one stop token.
pub struct Runner {
    queue: Queue,
    num_workers: usize,
    jitter: Duration,
    stop_when_empty: bool,
    handle_signals: bool,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("num_workers", &self.num_workers)
            .field("stop_when_empty", &self.stop_when_empty)
            .field("handle_signals", &self.handle_signals)
            .finish()
    }
}

impl Runner {
    /// Create a runner over the given queue with a single worker.
    pub fn new(queue: &Queue) -> Self {
        Self {
            queue: queue.clone(),
            num_workers: 1,
            jitter: DEFAULT_JITTER,
            stop_when_empty: false,
            handle_signals: false,
        }
    }

    /// Set the number of concurrent workers.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    /// Set the maximum random jitter added to poll sleeps.
    ///
    /// Jitter spreads out the moment at which idle workers wake, so a
    /// large pool does not stampede the store in lockstep.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Shut the pool down once the queue is quiescent (no pending and
    /// no processing jobs) instead of polling forever.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.stop_when_empty = true;
        self
    }

    /// Stop the pool gracefully on SIGINT/SIGTERM.
    pub fn handle_signals(mut self) -> Self {
        self.handle_signals = true;
        self
    }

    /// Start the workers.
    ///
    /// Returns a [`RunHandle`] used to wait for (or request) shutdown.
    pub async fn start(&self) -> Result<RunHandle> {
        let pool = self.queue.pool().clone();

        let stale = config::stale_lock_seconds(&pool).await?;
        let threshold = util::now() - ChronoDuration::seconds(stale);
        let reclaimed = storage::recover_stale_locks(&pool, threshold).await?;
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed stale locks from a previous run");
        }

        let stopping = CancellationToken::new();
        if self.handle_signals {
            shutdown::cancel_on_signal(stopping.clone());
        }

        let sweep = tokio::spawn(sweep_stale_locks(pool.clone(), stopping.clone()));

        let mut handles = Vec::new();
        for index in 0..self.num_workers {
            let name = util::worker_id(index);
            info!(worker.name = %name, "starting worker");

            let worker = Worker {
                pool: pool.clone(),
                worker_id: name.clone(),
                stop_when_empty: self.stop_when_empty,
                jitter: self.jitter,
                stopping: stopping.clone(),
            };

            let span = info_span!("worker", worker.name = %name);
            handles.push(tokio::spawn(async move { worker.run().instrument(span).await }));
        }

        Ok(RunHandle {
            stopping,
            handles,
            sweep,
        })
    }
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct RunHandle {
    stopping: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    sweep: JoinHandle<()>,
}

impl RunHandle {
    /// Ask the pool to stop: no new claims, in-flight attempts finish.
    pub fn shutdown(&self) {
        self.stopping.cancel();
    }

    /// Wait for every worker to shut down.
    ///
    /// A panicked worker is logged and skipped; one bad worker never
    /// takes the supervisor with it.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "worker task panicked");
            }
        });

        self.stopping.cancel();
        let _ = self.sweep.await;
    }
}

/// In-process sweep: reclaim abandoned claims every
/// `stale_lock_seconds / 2` while the pool runs, so a crashed worker's
/// job is retried without waiting for the next supervisor start.
async fn sweep_stale_locks(pool: SqlitePool, stopping: CancellationToken) {
    loop {
        let stale = match config::stale_lock_seconds(&pool).await {
            Ok(seconds) => seconds,
            Err(error) => {
                error!(%error, "failed to read stale lock threshold");
                300
            }
        };
        let pause = Duration::from_secs((stale.unsigned_abs() / 2).max(1));

        tokio::select! {
            _ = stopping.cancelled() => break,
            _ = sleep(pause) => {}
        }

        let threshold = util::now() - ChronoDuration::seconds(stale);
        match storage::recover_stale_locks(&pool, threshold).await {
            Ok(0) => {}
            Ok(reclaimed) => warn!(reclaimed, "reclaimed stale locks"),
            Err(error) => error!(%error, "stale lock sweep failed"),
        }
    }
}
