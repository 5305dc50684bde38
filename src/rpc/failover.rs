//! Tiered retry over the endpoint pool.

use super::endpoint::{EndpointPool, EndpointStats, Tier};
use crate::errors::{AppError, Result};
use std::future::Future;
use std::time::Duration;

/// Extra passes over all tiers when every endpoint is merely rate-limited.
const THROTTLE_PASSES: usize = 2;

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Attempts per tier before moving on.
    pub max_retries_per_tier: u32,
    /// Sleep between attempts grows as `retry_backoff * attempt`.
    pub retry_backoff: Duration,
    pub call_timeout: Duration,
    /// Longest the executor will wait for a throttled endpoint to free up.
    pub max_throttle_wait: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_retries_per_tier: 3,
            retry_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(10),
            max_throttle_wait: Duration::from_secs(2),
        }
    }
}

/// Result of probing every endpoint once.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub working: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct FailoverExecutor<C> {
    pool: EndpointPool<C>,
    config: FailoverConfig,
}

impl<C: Clone + Send + Sync> FailoverExecutor<C> {
    pub fn new(pool: EndpointPool<C>, config: FailoverConfig) -> Self {
        tracing::info!(
            endpoints = pool.len(),
            max_retries = config.max_retries_per_tier,
            timeout_ms = config.call_timeout.as_millis() as u64,
            "[RPC] failover executor ready"
        );
        Self { pool, config }
    }

    pub fn pool(&self) -> &EndpointPool<C> {
        &self.pool
    }

    /// Runs `op` against the first endpoint that will take it, primary tier
    /// first. Each failure updates the endpoint's health before the next try.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(C) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = String::from("no eligible endpoint");

        for pass in 0..=THROTTLE_PASSES {
            for tier in Tier::ALL {
                let mut attempts = 0u32;
                while attempts < self.config.max_retries_per_tier {
                    let Some((index, client)) = self.pool.acquire(tier) else {
                        break;
                    };
                    attempts += 1;

                    let outcome = tokio::time::timeout(self.config.call_timeout, op(client)).await;
                    let message = match outcome {
                        Ok(Ok(value)) => {
                            self.pool.record_success(index);
                            return Ok(value);
                        }
                        Ok(Err(e)) => e.to_string(),
                        Err(_) => AppError::TransientNetwork(format!(
                            "request timed out after {:.1}s",
                            self.config.call_timeout.as_secs_f64()
                        ))
                        .to_string(),
                    };

                    let endpoint = &self.pool.endpoints()[index].name;
                    tracing::debug!(
                        operation,
                        %endpoint,
                        %tier,
                        attempts,
                        error = %message,
                        "[RPC] call failed"
                    );
                    self.pool.record_failure(index, &message);
                    last_error = message;

                    if attempts < self.config.max_retries_per_tier {
                        tokio::time::sleep(self.config.retry_backoff * attempts).await;
                    }
                }
            }

            match self.pool.earliest_slot() {
                Some(wait) if pass < THROTTLE_PASSES && wait <= self.config.max_throttle_wait => {
                    tokio::time::sleep(wait).await;
                }
                _ => break,
            }
        }

        let alive = self.pool.alive_count();
        let total = self.pool.len();
        tracing::warn!(
            operation,
            alive,
            total,
            error = %last_error,
            "[RPC] all endpoints exhausted"
        );
        Err(AppError::ExhaustedEndpoints {
            operation: operation.to_string(),
            alive,
            total,
            last_error,
        })
    }

    /// Probes every endpoint once, ignoring rate limits, and feeds the result
    /// into its health state.
    pub async fn health_check<T, F, Fut>(&self, mut probe: F) -> HealthReport
    where
        F: FnMut(C) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut report = HealthReport::default();
        for (index, endpoint) in self.pool.endpoints().iter().enumerate() {
            let client = endpoint.client().clone();
            let outcome = tokio::time::timeout(self.config.call_timeout, probe(client)).await;
            let failure = match outcome {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("health probe timed out".to_string()),
            };
            match failure {
                None => {
                    self.pool.record_success(index);
                    report.working.push(endpoint.name.clone());
                }
                Some(message) => {
                    self.pool.record_failure(index, &message);
                    report.failed.push((endpoint.name.clone(), message));
                }
            }
        }
        tracing::info!(
            working = report.working.len(),
            failed = report.failed.len(),
            "[RPC] health check complete"
        );
        report
    }

    pub fn stats(&self) -> Vec<EndpointStats> {
        self.pool.stats()
    }

    pub fn success_rate(&self) -> f64 {
        self.pool.success_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::endpoint::{Endpoint, PatternClassifier};
    use crate::utils::ManualClock;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake connection: fails the first `failures` calls routed to it.
    #[derive(Clone)]
    struct FakeConn {
        name: &'static str,
        failures: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
        error: &'static str,
    }

    impl FakeConn {
        fn new(name: &'static str, failures: usize, error: &'static str) -> Self {
            Self {
                name,
                failures: Arc::new(AtomicUsize::new(failures)),
                calls: Arc::new(AtomicUsize::new(0)),
                error,
            }
        }

        async fn block_number(&self) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(AppError::TransientNetwork(self.error.to_string()));
            }
            Ok(42)
        }
    }

    fn fast_config() -> FailoverConfig {
        FailoverConfig {
            max_retries_per_tier: 3,
            retry_backoff: Duration::from_millis(1),
            call_timeout: Duration::from_millis(200),
            max_throttle_wait: Duration::ZERO,
        }
    }

    fn executor(conns: Vec<(FakeConn, Tier)>) -> (FailoverExecutor<FakeConn>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_000));
        let endpoints = conns
            .into_iter()
            .map(|(c, tier)| Endpoint::new(c.name, format!("https://{}", c.name), tier, 100, c))
            .collect();
        let classifier = Arc::new(PatternClassifier::default());
        let pool = EndpointPool::new(endpoints, clock.clone(), classifier);
        (FailoverExecutor::new(pool, fast_config()), clock)
    }

    #[tokio::test]
    async fn falls_back_to_secondary_when_primary_fails() {
        let primary = FakeConn::new("primary", usize::MAX, "connection refused");
        let secondary = FakeConn::new("secondary", 0, "");
        let (exec, _clock) = executor(vec![
            (primary.clone(), Tier::Primary),
            (secondary.clone(), Tier::Secondary),
        ]);

        let block = exec
            .execute("block_number", |c| async move { c.block_number().await })
            .await
            .expect("secondary answers");
        assert_eq!(block, 42);
        // primary was tried once, then put into cooldown
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
        let stats = exec.stats();
        assert_eq!(stats[0].consecutive_failures, 1);
        assert_eq!(stats[1].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn exhaustion_reports_alive_and_last_error() {
        let a = FakeConn::new("a", usize::MAX, "boom-a");
        let b = FakeConn::new("b", usize::MAX, "boom-b");
        let (exec, _clock) = executor(vec![(a, Tier::Primary), (b, Tier::Secondary)]);

        let err = exec
            .execute("get_reserves", |c| async move { c.block_number().await })
            .await
            .expect_err("everything fails");
        match err {
            AppError::ExhaustedEndpoints {
                operation,
                alive,
                total,
                last_error,
            } => {
                assert_eq!(operation, "get_reserves");
                assert_eq!(total, 2);
                assert_eq!(alive, 2);
                assert!(last_error.contains("boom-b"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let slow = FakeConn::new("slow", 0, "");
        let (exec, _clock) = executor(vec![(slow, Tier::Primary)]);
        let err = exec
            .execute("slow_call", |_c| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1u8)
            })
            .await
            .expect_err("times out");
        assert!(err.to_string().contains("timed out"));
        assert_eq!(exec.stats()[0].failures, 1);
    }

    #[tokio::test]
    async fn health_check_splits_working_and_failed() {
        let good = FakeConn::new("good", 0, "");
        let bad = FakeConn::new("bad", usize::MAX, "too many requests");
        let (exec, _clock) = executor(vec![(good, Tier::Primary), (bad, Tier::Secondary)]);

        let report = exec
            .health_check(|c| async move { c.block_number().await })
            .await;
        assert_eq!(report.working, vec!["good".to_string()]);
        assert_eq!(report.failed.len(), 1);
        let stats = exec.stats();
        assert!((stats[1].cooldown_remaining_secs - 600.0).abs() < 1e-6);
    }
}
