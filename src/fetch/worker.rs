//! Fetch worker: one task, many proxies, bounded attempts

use crate::error::FetchError;
use crate::fetch::client::{FetchResponse, ListingFetcher};
use crate::fetch::retry::RetryPolicy;
use crate::proxy::pool::ProxyPool;
use crate::task::LocationTask;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default per-request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Terminal result of one location task
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success(Value),
    /// The remote answered, but not with JSON
    RawFallback(String),
    Failed { attempts: u32, error: FetchError },
}

impl FetchOutcome {
    /// Whether the outcome carries something to persist
    pub fn has_payload(&self) -> bool {
        !matches!(self, FetchOutcome::Failed { .. })
    }

    pub fn is_no_proxy(&self) -> bool {
        matches!(
            self,
            FetchOutcome::Failed {
                error: FetchError::NoProxyAvailable,
                ..
            }
        )
    }
}

/// Runs the retry loop for a task against the shared pool
#[derive(Clone)]
pub struct FetchWorker {
    pool: Arc<ProxyPool>,
    fetcher: Arc<dyn ListingFetcher>,
    policy: RetryPolicy,
    request_timeout: Duration,
    stop: CancellationToken,
}

impl FetchWorker {
    pub fn new(pool: Arc<ProxyPool>, fetcher: Arc<dyn ListingFetcher>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            fetcher,
            policy,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            stop: CancellationToken::new(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Stop starting new attempts once `stop` fires. The attempt in flight
    /// when it fires is allowed to finish.
    pub fn with_stop_signal(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn fetch(&self, task: &LocationTask) -> FetchOutcome {
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempt = 0;

        loop {
            if self.stop.is_cancelled() {
                return FetchOutcome::Failed {
                    attempts: attempt,
                    error: FetchError::Cancelled {
                        attempt: attempt + 1,
                    },
                };
            }

            let Some(proxy) = self.pool.pick() else {
                warn!(key = %task, attempt = attempt + 1, "proxy pool is empty");
                return FetchOutcome::Failed {
                    attempts: attempt,
                    error: FetchError::NoProxyAvailable,
                };
            };

            debug!(key = %task, attempt = attempt + 1, max_attempts, proxy = %proxy, "fetching");

            let error = match self.fetcher.fetch(task, &proxy, self.request_timeout).await {
                Ok(FetchResponse::Json(payload)) => {
                    info!(key = %task, attempt = attempt + 1, "fetched listing");
                    return FetchOutcome::Success(payload);
                }
                Ok(FetchResponse::Raw(text)) => {
                    warn!(key = %task, bytes = text.len(), "response is not JSON, keeping raw text");
                    return FetchOutcome::RawFallback(text);
                }
                Err(source) => FetchError::Transport {
                    proxy: proxy.to_string(),
                    source,
                },
            };

            self.pool.evict(&proxy);
            warn!(
                key = %task,
                attempt = attempt + 1,
                pool_size = self.pool.len(),
                error = %error,
                "attempt failed, proxy evicted"
            );

            if !self.policy.should_retry(&error) || self.policy.is_last_attempt(attempt) {
                return FetchOutcome::Failed {
                    attempts: attempt + 1,
                    error,
                };
            }

            let delay = self.policy.jittered_delay_for(attempt);
            debug!(key = %task, delay_ms = delay.as_millis() as u64, "backing off");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.cancelled() => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::proxy::models::{ProxyEndpoint, ProxyScheme};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Instant;

    /// Succeeds only through proxies in `good`; records every call
    struct ScriptedFetcher {
        good: HashSet<ProxyEndpoint>,
        response: FetchResponse,
        calls: Mutex<Vec<(ProxyEndpoint, Instant)>>,
    }

    impl ScriptedFetcher {
        fn new(good: Vec<ProxyEndpoint>) -> Self {
            Self {
                good: good.into_iter().collect(),
                response: FetchResponse::Json(serde_json::json!({"ShowDetails": []})),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl ListingFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _task: &LocationTask,
            proxy: &ProxyEndpoint,
            _timeout: Duration,
        ) -> Result<FetchResponse, TransportError> {
            self.calls.lock().push((proxy.clone(), Instant::now()));
            if self.good.contains(proxy) {
                Ok(self.response.clone())
            } else {
                Err(TransportError::Challenge(403))
            }
        }
    }

    fn endpoint(n: u8) -> ProxyEndpoint {
        ProxyEndpoint::new(format!("10.0.0.{n}"), 8080, ProxyScheme::Http)
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, 2.0).with_backoff_unit(Duration::from_millis(5))
    }

    fn worker(pool: &Arc<ProxyPool>, fetcher: &Arc<ScriptedFetcher>, policy: RetryPolicy) -> FetchWorker {
        FetchWorker::new(Arc::clone(pool), fetcher.clone(), policy)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let pool = Arc::new(ProxyPool::with_members(vec![endpoint(1)]));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![endpoint(1)]));

        let outcome = worker(&pool, &fetcher, fast_policy(3))
            .fetch(&LocationTask::new("L1"))
            .await;
        assert!(matches!(outcome, FetchOutcome::Success(_)));
        assert_eq!(fetcher.call_count(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_proxy_is_evicted_and_good_one_used() {
        let pool = Arc::new(ProxyPool::with_members(vec![endpoint(1), endpoint(2)]));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![endpoint(2)]));

        let outcome = worker(&pool, &fetcher, fast_policy(2))
            .fetch(&LocationTask::new("L1"))
            .await;

        assert!(matches!(outcome, FetchOutcome::Success(_)));
        let calls = fetcher.calls.lock();
        assert_eq!(calls.last().map(|(proxy, _)| proxy.clone()), Some(endpoint(2)));
        if calls.len() == 2 {
            assert_eq!(calls[0].0, endpoint(1));
            assert_eq!(pool.snapshot(), vec![endpoint(2)]);
        } else {
            assert_eq!(calls.len(), 1);
            assert_eq!(pool.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_exactly_max_retries_attempts() {
        let members: Vec<_> = (1..=10).map(endpoint).collect();
        let pool = Arc::new(ProxyPool::with_members(members));
        let fetcher = Arc::new(ScriptedFetcher::new(Vec::new()));

        let outcome = worker(&pool, &fetcher, fast_policy(4))
            .fetch(&LocationTask::new("L1"))
            .await;

        match outcome {
            FetchOutcome::Failed { attempts, error } => {
                assert_eq!(attempts, 4);
                assert!(matches!(
                    error,
                    FetchError::Transport {
                        source: TransportError::Challenge(403),
                        ..
                    }
                ));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(fetcher.call_count(), 4);
        assert_eq!(pool.len(), 6);
    }

    #[tokio::test]
    async fn test_backoff_grows_between_attempts() {
        let members: Vec<_> = (1..=5).map(endpoint).collect();
        let pool = Arc::new(ProxyPool::with_members(members));
        let fetcher = Arc::new(ScriptedFetcher::new(Vec::new()));
        let policy = RetryPolicy::new(4, 2.0).with_backoff_unit(Duration::from_millis(20));

        worker(&pool, &fetcher, policy.clone())
            .fetch(&LocationTask::new("L1"))
            .await;

        let calls = fetcher.calls.lock();
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].1 - w[0].1).collect();
        assert_eq!(gaps.len(), 3);
        for (n, gap) in gaps.iter().enumerate() {
            assert!(*gap >= policy.delay_for(n as u32), "gap {n} was {gap:?}");
        }
    }

    #[tokio::test]
    async fn test_empty_pool_fails_fast_without_network() {
        let pool = Arc::new(ProxyPool::new());
        let fetcher = Arc::new(ScriptedFetcher::new(Vec::new()));
        let policy = RetryPolicy::new(3, 2.0).with_backoff_unit(Duration::from_secs(60));

        let start = Instant::now();
        let outcome = worker(&pool, &fetcher, policy)
            .fetch(&LocationTask::new("L1"))
            .await;

        assert!(outcome.is_no_proxy());
        assert_eq!(fetcher.call_count(), 0);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_pool_drained_mid_task_fails_as_no_proxy() {
        let pool = Arc::new(ProxyPool::with_members(vec![endpoint(1)]));
        let fetcher = Arc::new(ScriptedFetcher::new(Vec::new()));

        let outcome = worker(&pool, &fetcher, fast_policy(5))
            .fetch(&LocationTask::new("L1"))
            .await;

        assert_eq!(
            outcome,
            FetchOutcome::Failed {
                attempts: 1,
                error: FetchError::NoProxyAvailable
            }
        );
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_raw_payload_is_terminal() {
        let pool = Arc::new(ProxyPool::with_members(vec![endpoint(1)]));
        let mut scripted = ScriptedFetcher::new(vec![endpoint(1)]);
        scripted.response = FetchResponse::Raw("<html></html>".into());
        let fetcher = Arc::new(scripted);

        let outcome = worker(&pool, &fetcher, fast_policy(3))
            .fetch(&LocationTask::new("L1"))
            .await;

        assert_eq!(outcome, FetchOutcome::RawFallback("<html></html>".into()));
        assert!(outcome.has_payload());
        assert_eq!(fetcher.call_count(), 1);
        assert!(pool.contains(&endpoint(1)));
    }

    #[tokio::test]
    async fn test_stop_signal_prevents_new_attempts() {
        let pool = Arc::new(ProxyPool::with_members(vec![endpoint(1)]));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![endpoint(1)]));
        let stop = CancellationToken::new();
        stop.cancel();

        let outcome = worker(&pool, &fetcher, fast_policy(3))
            .with_stop_signal(stop)
            .fetch(&LocationTask::new("L1"))
            .await;

        assert!(matches!(
            outcome,
            FetchOutcome::Failed {
                attempts: 0,
                error: FetchError::Cancelled { attempt: 1 }
            }
        ));
        assert_eq!(fetcher.call_count(), 0);
    }
}
