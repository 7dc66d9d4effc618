//! Concurrent load generator used to exercise pools, monitor and cache together.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::PerfError;
use crate::monitor::QueryMonitor;

#[derive(Debug, Clone)]
pub struct LoadTestConfig {
    /// Label recorded with the query monitor for every request.
    pub statement: String,
    pub concurrency: usize,
    pub requests: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LoadTestReport {
    pub statement: String,
    pub requests: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: f64,
    pub throughput_per_sec: f64,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Nearest-rank percentile over an ascending slice.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

pub struct PerformanceTester {
    monitor: Option<Arc<QueryMonitor>>,
}

impl PerformanceTester {
    /// Record every request with `monitor`.
    pub fn new(monitor: Arc<QueryMonitor>) -> Self {
        Self {
            monitor: Some(monitor),
        }
    }

    /// For operations that already record themselves, such as `AppContext::execute`.
    pub fn without_monitor() -> Self {
        Self { monitor: None }
    }

    /// Run `operation` `config.requests` times across `config.concurrency` workers.
    ///
    /// Each call is observed by the query monitor, if any. Cancellation stops workers before
    /// their next request; the report covers whatever completed.
    pub async fn run<F, Fut>(
        &self,
        config: &LoadTestConfig,
        operation: F,
        cancel: &CancellationToken,
    ) -> LoadTestReport
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PerfError>> + Send + 'static,
    {
        let operation = Arc::new(operation);
        let next = Arc::new(AtomicUsize::new(0));
        let samples = Arc::new(Mutex::new(Vec::with_capacity(config.requests)));
        let failures = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        info!(
            statement = %config.statement,
            concurrency = config.concurrency,
            requests = config.requests,
            "starting load test"
        );

        let workers: Vec<_> = (0..config.concurrency.max(1))
            .map(|_| {
                let operation = Arc::clone(&operation);
                let next = Arc::clone(&next);
                let samples = Arc::clone(&samples);
                let failures = Arc::clone(&failures);
                let monitor = self.monitor.clone();
                let cancel = cancel.clone();
                let statement = config.statement.clone();
                let total = config.requests;
                tokio::spawn(async move {
                    loop {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        if index >= total {
                            break;
                        }
                        let began = Instant::now();
                        let result = match &monitor {
                            Some(monitor) => monitor.observe(&statement, operation(index)).await,
                            None => operation(index).await,
                        };
                        let elapsed = began.elapsed();
                        if result.is_err() {
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                        samples.lock().push(elapsed);
                    }
                })
            })
            .collect();

        for outcome in futures::future::join_all(workers).await {
            if let Err(err) = outcome {
                warn!(error = ?err, "load test worker ended abnormally");
            }
        }

        let elapsed = started.elapsed();
        let samples = std::mem::take(&mut *samples.lock());
        let report = summarize(
            &config.statement,
            &samples,
            failures.load(Ordering::Relaxed),
            elapsed,
        );
        info!(
            requests = report.requests,
            failed = report.failed,
            throughput = report.throughput_per_sec,
            p95_ms = report.p95_ms,
            "load test finished"
        );
        report
    }
}

fn summarize(statement: &str, samples: &[Duration], failed: usize, elapsed: Duration) -> LoadTestReport {
    let mut millis: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1_000.0).collect();
    millis.sort_by(|a, b| a.total_cmp(b));
    let requests = millis.len();
    let elapsed_secs = elapsed.as_secs_f64();

    LoadTestReport {
        statement: statement.to_string(),
        requests,
        succeeded: requests.saturating_sub(failed),
        failed,
        elapsed_ms: elapsed_secs * 1_000.0,
        throughput_per_sec: if elapsed_secs > 0.0 {
            requests as f64 / elapsed_secs
        } else {
            0.0
        },
        min_ms: millis.first().copied().unwrap_or(0.0),
        avg_ms: if requests == 0 {
            0.0
        } else {
            millis.iter().sum::<f64>() / requests as f64
        },
        p50_ms: percentile(&millis, 50.0),
        p95_ms: percentile(&millis, 95.0),
        p99_ms: percentile(&millis, 99.0),
        max_ms: millis.last().copied().unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;

    #[test]
    fn nearest_rank_percentiles() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&values, 50.0), 50.0);
        assert_eq!(percentile(&values, 95.0), 95.0);
        assert_eq!(percentile(&values, 99.0), 99.0);
        assert_eq!(percentile(&[], 99.0), 0.0);
        assert_eq!(percentile(&[7.0], 1.0), 7.0);
    }

    #[tokio::test]
    async fn every_request_is_monitored() {
        let monitor = Arc::new(QueryMonitor::new(&MonitorConfig::default()));
        let tester = PerformanceTester::new(Arc::clone(&monitor));
        let config = LoadTestConfig {
            statement: "SELECT * FROM recipes WHERE id = $1".into(),
            concurrency: 4,
            requests: 40,
        };
        let report = tester
            .run(
                &config,
                |i| async move {
                    if i % 10 == 0 {
                        Err(PerfError::query("SELECT", "boom"))
                    } else {
                        Ok(())
                    }
                },
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.requests, 40);
        assert_eq!(report.failed, 4);
        assert_eq!(report.succeeded, 36);
        let stats = monitor.stats();
        assert_eq!(stats.total_queries, 40);
        assert_eq!(stats.failed_queries, 4);
    }

    #[tokio::test]
    async fn self_recording_operations_are_counted_once() {
        let monitor = Arc::new(QueryMonitor::new(&MonitorConfig::default()));
        let tester = PerformanceTester::without_monitor();
        let config = LoadTestConfig {
            statement: "UPDATE recipes SET views = views + 1 WHERE id = $1".into(),
            concurrency: 3,
            requests: 30,
        };
        let recorder = Arc::clone(&monitor);
        let report = tester
            .run(
                &config,
                move |_| {
                    let recorder = Arc::clone(&recorder);
                    async move {
                        recorder
                            .observe("UPDATE recipes SET views = views + 1 WHERE id = $1", async {
                                Ok::<(), PerfError>(())
                            })
                            .await
                    }
                },
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.requests, 30);
        assert_eq!(monitor.stats().total_queries, 30);
    }

    #[tokio::test]
    async fn cancelled_run_does_nothing() {
        let monitor = Arc::new(QueryMonitor::new(&MonitorConfig::default()));
        let tester = PerformanceTester::new(monitor);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = LoadTestConfig {
            statement: "SELECT 1".into(),
            concurrency: 2,
            requests: 10,
        };
        let report = tester.run(&config, |_| async { Ok(()) }, &cancel).await;
        assert_eq!(report.requests, 0);
        assert_eq!(report.p99_ms, 0.0);
    }
}
