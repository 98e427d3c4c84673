//! Task dispatch and run accounting
//!
//! The orchestrator starts the proxy refresher, waits for a usable pool,
//! runs one fetch worker per location with bounded concurrency, and is the
//! only writer of [`RunStatistics`]. Outcomes are consumed in completion
//! order by a single loop, which persists them and updates the counters.

use crate::error::{FetchError, RunError};
use crate::fetch::client::ListingFetcher;
use crate::fetch::retry::RetryPolicy;
use crate::fetch::worker::{FetchOutcome, FetchWorker};
use crate::proxy::pool::ProxyPool;
use crate::refresher::ProxyRefresher;
use crate::sink::PersistenceSink;
use crate::task::LocationTask;
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Knobs of the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Fetch workers running at once
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    /// How long to wait for the first non-empty pool
    pub startup_timeout: Duration,
    /// Random pause before a finished worker's slot is reused
    pub courtesy_delay: RangeInclusive<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(120),
            courtesy_delay: Duration::from_secs(1)..=Duration::from_secs(3),
        }
    }
}

/// Counters for one run.
///
/// Raw fallbacks were answered and persisted, so they count as succeeded and
/// are also tallied on their own. `succeeded + failed == submitted` once the
/// run completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStatistics {
    pub submitted: usize,
    pub succeeded: usize,
    pub raw_fallbacks: usize,
    pub failed: usize,
    /// Failures caused by an empty pool
    pub no_proxy: usize,
    /// Payloads that could not be written; does not change success counts
    pub persist_failures: usize,
    /// Keys of failed tasks, for a targeted re-run
    pub failed_keys: Vec<String>,
}

impl RunStatistics {
    pub fn record(&mut self, key: &str, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Success(_) => self.succeeded += 1,
            FetchOutcome::RawFallback(_) => {
                self.succeeded += 1;
                self.raw_fallbacks += 1;
            }
            FetchOutcome::Failed { error, .. } => {
                self.failed += 1;
                if matches!(error, FetchError::NoProxyAvailable) {
                    self.no_proxy += 1;
                }
                self.failed_keys.push(key.to_string());
            }
        }
    }

    pub fn completed(&self) -> usize {
        self.succeeded + self.failed
    }
}

impl fmt::Display for RunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} submitted: {} succeeded ({} raw), {} failed ({} without proxy)",
            self.submitted, self.succeeded, self.raw_fallbacks, self.failed, self.no_proxy
        )?;
        if self.persist_failures > 0 {
            write!(f, ", {} not saved", self.persist_failures)?;
        }
        Ok(())
    }
}

/// Drives a whole run
pub struct Orchestrator {
    config: OrchestratorConfig,
    pool: Arc<ProxyPool>,
    refresher: ProxyRefresher,
    fetcher: Arc<dyn ListingFetcher>,
    sink: Arc<dyn PersistenceSink>,
    stop: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        refresher: ProxyRefresher,
        fetcher: Arc<dyn ListingFetcher>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        Self {
            config,
            pool: Arc::new(ProxyPool::new()),
            refresher,
            fetcher,
            sink,
            stop: CancellationToken::new(),
        }
    }

    /// Use an existing pool, e.g. one seeded before the first refresh
    pub fn with_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.pool = pool;
        self
    }

    /// External stop signal: halts the refresher and new fetch attempts
    pub fn with_stop_signal(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub async fn run(&self, tasks: Vec<LocationTask>) -> Result<RunStatistics, RunError> {
        let refresher_stop = self.stop.child_token();
        let refresher = self
            .refresher
            .clone()
            .spawn(Arc::clone(&self.pool), refresher_stop.clone());

        if !self.pool.wait_non_empty(self.config.startup_timeout).await {
            error!(
                timeout_secs = self.config.startup_timeout.as_secs(),
                "no usable proxies at startup, aborting run"
            );
            refresher_stop.cancel();
            if let Err(e) = refresher.await {
                warn!(error = %e, "proxy refresher ended abnormally");
            }
            return Err(RunError::NoInitialProxies(self.config.startup_timeout));
        }
        info!(pool_size = self.pool.len(), tasks = tasks.len(), "starting fetch run");

        let stats = self.dispatch(tasks).await;

        refresher_stop.cancel();
        if let Err(e) = refresher.await {
            warn!(error = %e, "proxy refresher ended abnormally");
        }

        info!(
            submitted = stats.submitted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "fetch run completed"
        );
        Ok(stats)
    }

    async fn dispatch(&self, tasks: Vec<LocationTask>) -> RunStatistics {
        let worker = FetchWorker::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.fetcher),
            self.config.retry.clone(),
        )
        .with_request_timeout(self.config.request_timeout)
        .with_stop_signal(self.stop.clone());

        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut running = JoinSet::new();
        let mut pending = HashSet::with_capacity(tasks.len());
        let mut stats = RunStatistics {
            submitted: tasks.len(),
            ..RunStatistics::default()
        };

        for task in tasks {
            pending.insert(task.key().to_string());
            let worker = worker.clone();
            let slots = Arc::clone(&slots);

            running.spawn(async move {
                let permit = slots.acquire_owned().await.ok();
                let outcome = AssertUnwindSafe(worker.fetch(&task))
                    .catch_unwind()
                    .await
                    .unwrap_or(FetchOutcome::Failed {
                        attempts: 0,
                        error: FetchError::WorkerPanicked,
                    });
                (task, outcome, permit)
            });
        }

        while let Some(joined) = running.join_next().await {
            let (task, outcome, permit) = match joined {
                Ok(finished) => finished,
                Err(e) => {
                    error!(error = %e, "fetch task did not complete");
                    continue;
                }
            };
            pending.remove(task.key());
            self.complete(&task, &outcome, &mut stats).await;
            self.release_slot(permit);
        }

        // Tasks whose join failed still need an outcome.
        for key in pending {
            let outcome = FetchOutcome::Failed {
                attempts: 0,
                error: FetchError::WorkerPanicked,
            };
            stats.record(&key, &outcome);
        }

        stats
    }

    async fn complete(&self, task: &LocationTask, outcome: &FetchOutcome, stats: &mut RunStatistics) {
        if outcome.has_payload() {
            if let Err(e) = self.sink.persist(task.key(), outcome).await {
                stats.persist_failures += 1;
                error!(key = %task, error = %e, "failed to persist result");
            }
        }

        stats.record(task.key(), outcome);
        if let FetchOutcome::Failed { attempts, error } = outcome {
            error!(key = %task, attempts, error = %error, "task failed");
        }
        info!(
            completed = stats.completed(),
            total = stats.submitted,
            "progress"
        );
    }

    /// Hold the finished worker's slot for a random courtesy delay
    fn release_slot(&self, permit: Option<OwnedSemaphorePermit>) {
        let Some(permit) = permit else { return };

        let low = self.config.courtesy_delay.start().as_millis() as u64;
        let high = self.config.courtesy_delay.end().as_millis() as u64;
        if high == 0 {
            return;
        }
        let delay = Duration::from_millis(rand::rng().random_range(low.min(high)..=high));

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn test_statistics_record() {
        let mut stats = RunStatistics {
            submitted: 4,
            ..RunStatistics::default()
        };
        stats.record("A", &FetchOutcome::Success(serde_json::json!({})));
        stats.record("B", &FetchOutcome::RawFallback("x".into()));
        stats.record(
            "C",
            &FetchOutcome::Failed {
                attempts: 0,
                error: FetchError::NoProxyAvailable,
            },
        );
        stats.record(
            "D",
            &FetchOutcome::Failed {
                attempts: 3,
                error: FetchError::Transport {
                    proxy: "http://10.0.0.1:80".into(),
                    source: TransportError::Status(503),
                },
            },
        );

        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.raw_fallbacks, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.no_proxy, 1);
        assert_eq!(stats.completed(), stats.submitted);
        assert_eq!(stats.failed_keys, vec!["C".to_string(), "D".to_string()]);
    }

    #[test]
    fn test_statistics_summary() {
        let stats = RunStatistics {
            submitted: 3,
            succeeded: 2,
            raw_fallbacks: 1,
            failed: 1,
            no_proxy: 0,
            persist_failures: 1,
            failed_keys: vec!["X".into()],
        };
        assert_eq!(
            stats.to_string(),
            "3 submitted: 2 succeeded (1 raw), 1 failed (0 without proxy), 1 not saved"
        );
    }
}
