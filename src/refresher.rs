//! Background repopulation of the proxy pool

use crate::proxy::pool::ProxyPool;
use crate::proxy::source::{list_candidates, ProxySource};
use crate::proxy::validator::ProxyValidator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default refresh period in seconds
const DEFAULT_INTERVAL_SECS: u64 = 3600;

/// What one refresh cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub candidates: usize,
    pub valid: usize,
    /// Whether the pool membership was swapped
    pub replaced: bool,
}

impl RefreshReport {
    /// Candidates that failed validation
    pub fn rejected(&self) -> usize {
        self.candidates - self.valid
    }
}

/// Gathers, validates and installs new pool generations on a fixed period
/// and whenever the pool runs dry
#[derive(Clone)]
pub struct ProxyRefresher {
    sources: Vec<Arc<dyn ProxySource>>,
    validator: ProxyValidator,
    interval: Duration,
}

impl ProxyRefresher {
    pub fn new(sources: Vec<Arc<dyn ProxySource>>, validator: ProxyValidator) -> Self {
        Self {
            sources,
            validator,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One cycle. An empty validated set leaves the pool untouched.
    pub async fn refresh_once(&self, pool: &ProxyPool) -> RefreshReport {
        let candidates = list_candidates(&self.sources).await;
        if candidates.is_empty() {
            warn!("no proxy candidates fetched, keeping current pool");
            return RefreshReport {
                candidates: 0,
                valid: 0,
                replaced: false,
            };
        }

        let total = candidates.len();
        let valid = self.validator.validate_all(candidates).await;
        if valid.is_empty() {
            warn!(candidates = total, "no valid proxies found, keeping current pool");
            return RefreshReport {
                candidates: total,
                valid: 0,
                replaced: false,
            };
        }

        let valid_count = valid.len();
        let size = pool.replace(valid);
        info!(pool_size = size, candidates = total, "proxy pool refreshed");
        RefreshReport {
            candidates: total,
            valid: valid_count,
            replaced: true,
        }
    }

    /// Refresh immediately, then every interval, until `stop` fires.
    /// A pool emptied by evictions is refreshed without waiting for the tick.
    pub async fn run(self, pool: Arc<ProxyPool>, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
                _ = pool.drained() => {
                    if !pool.is_empty() {
                        continue;
                    }
                    info!("proxy pool drained, refreshing early");
                    ticker.reset();
                }
            }

            // A cycle in progress is abandoned on stop; the pool keeps its
            // current generation.
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = self.refresh_once(&pool) => {}
            }
        }
        info!("proxy refresher stopped");
    }

    pub fn spawn(self, pool: Arc<ProxyPool>, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(pool, stop))
    }
}
