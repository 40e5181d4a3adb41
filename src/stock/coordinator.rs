//! Applies batches of stock deltas through a fixed-size worker pool.

use crate::config::StockConfig;
use crate::stock::error::{BatchError, JobFailure, StockError};
use crate::stock::store::{ProductId, StockLevel, StockStore};
use crate::ws::publisher::Publisher;
use crate::ws::types::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Who to warn, and below which level, when a batch drains a product.
#[derive(Debug, Clone)]
pub struct LowStockAlerts {
    pub publisher: Publisher,
    pub admin_user_id: UserId,
    pub threshold: i64,
}

#[derive(Debug, Clone, Copy)]
struct StockJob {
    product_id: ProductId,
    delta: i64,
}

struct JobOutcome {
    job: StockJob,
    result: Result<StockLevel, StockError>,
}

/// Result of a fully successful batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: Vec<StockLevel>,
}

/// Applies a batch of per-product stock deltas concurrently.
///
/// Each product is one job and each job is one locked unit of work in the
/// store. Jobs are independent: a failed job does not undo the others.
/// Dropping the future returned by [`apply_batch`](Self::apply_batch) aborts
/// every worker; in-flight units of work are rolled back by the store.
///
/// The configured job timeout bounds how long a job waits for its row lock.
/// A job that holds the lock is never cut short, so a timed-out job has
/// written nothing and is safe to retry.
#[derive(Clone)]
pub struct StockCoordinator {
    store: Arc<dyn StockStore>,
    workers: usize,
    job_timeout: Option<Duration>,
    alerts: Option<LowStockAlerts>,
}

impl std::fmt::Debug for StockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StockCoordinator")
            .field("workers", &self.workers)
            .field("job_timeout", &self.job_timeout)
            .field("alerts", &self.alerts.is_some())
            .finish()
    }
}

impl StockCoordinator {
    pub fn new(store: Arc<dyn StockStore>, config: &StockConfig) -> Self {
        Self {
            store,
            workers: config.workers.max(1),
            job_timeout: config.job_timeout,
            alerts: None,
        }
    }

    /// Sends a stock alert to `admin_user_id` whenever a batch decrements a
    /// product to `threshold` or below.
    pub fn with_alerts(mut self, alerts: LowStockAlerts) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn store(&self) -> &Arc<dyn StockStore> {
        &self.store
    }

    #[instrument(skip_all, fields(jobs = updates.len()))]
    pub async fn apply_batch(
        &self,
        updates: HashMap<ProductId, i64>,
    ) -> Result<BatchReport, BatchError> {
        if updates.is_empty() {
            return Err(BatchError::EmptyBatch);
        }
        let total = updates.len();

        let (job_tx, job_rx) = mpsc::channel(total);
        for (&product_id, &delta) in &updates {
            // Capacity equals the job count, so this never waits.
            let _ = job_tx.send(StockJob { product_id, delta }).await;
        }
        drop(job_tx);

        let (results, mut outcomes) = mpsc::unbounded_channel();
        let pool = WorkerPool {
            store: Arc::clone(&self.store),
            jobs: Arc::new(Mutex::new(job_rx)),
            results,
            lock_wait: self.job_timeout,
        };

        let mut workers = JoinSet::new();
        let mut spawned = 0;
        for _ in 0..self.workers.min(total) {
            workers.spawn(pool.clone().run(spawned));
            spawned += 1;
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Stock worker terminated abnormally: {}", e);
                // Queued jobs still need a worker.
                if e.is_panic() {
                    workers.spawn(pool.clone().run(spawned));
                    spawned += 1;
                }
            }
        }
        drop(pool);

        // Every worker has stopped, so every outcome is already queued.
        let mut pending = updates;
        let mut applied = Vec::with_capacity(total);
        let mut failures = Vec::new();
        while let Ok(outcome) = outcomes.try_recv() {
            pending.remove(&outcome.job.product_id);
            match outcome.result {
                Ok(level) => {
                    self.check_low_stock(&level, outcome.job.delta);
                    applied.push(level);
                }
                Err(error) => failures.push(JobFailure {
                    product_id: outcome.job.product_id,
                    delta: outcome.job.delta,
                    error,
                }),
            }
        }
        // A job whose worker panicked never reported an outcome.
        for (product_id, delta) in pending {
            failures.push(JobFailure {
                product_id,
                delta,
                error: StockError::Store("stock worker panicked while applying this job".into()),
            });
        }

        if applied.len() == total {
            info!(count = total, "Batch stock update succeeded.");
            return Ok(BatchReport { applied });
        }

        error!(
            total,
            failed = failures.len(),
            "Batch stock update partially failed."
        );
        Err(BatchError::PartialFailure {
            total,
            applied,
            failures,
        })
    }

    fn check_low_stock(&self, level: &StockLevel, delta: i64) {
        let Some(alerts) = &self.alerts else {
            return;
        };
        if delta < 0 && level.stock <= alerts.threshold {
            alerts.publisher.notify_stock_alert(
                alerts.admin_user_id,
                level.product_id,
                &level.name,
                level.stock,
            );
        }
    }
}

#[derive(Clone)]
struct WorkerPool {
    store: Arc<dyn StockStore>,
    jobs: Arc<Mutex<mpsc::Receiver<StockJob>>>,
    results: mpsc::UnboundedSender<JobOutcome>,
    lock_wait: Option<Duration>,
}

impl WorkerPool {
    /// Pulls jobs until the queue is empty, reporting each outcome as soon as
    /// it is known.
    async fn run(self, worker: usize) {
        loop {
            let next = self.jobs.lock().await.recv().await;
            let Some(job) = next else {
                break;
            };

            let result = self
                .store
                .apply_delta_within(job.product_id, job.delta, self.lock_wait)
                .await;
            match &result {
                Ok(level) => debug!(worker, product_id = job.product_id, stock = level.stock, "Stock job applied."),
                Err(e) => warn!(worker, product_id = job.product_id, delta = job.delta, "Stock job failed: {}", e),
            }
            let _ = self.results.send(JobOutcome { job, result });
        }
    }
}
