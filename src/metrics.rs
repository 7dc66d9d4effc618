use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::db::PoolSnapshot;

/// Prometheus registry for the performance layer.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Arc<Registry>,
    loops: LoopMetrics,
    pool: PoolMetrics,
    statements: StatementMetrics,
    cache: CacheMetrics,
    dashboard: DashboardMetrics,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("pgperf".into()), None)?);

        let loops = LoopMetrics::register(&registry)?;
        let pool = PoolMetrics::register(&registry)?;
        let statements = StatementMetrics::register(&registry)?;
        let cache = CacheMetrics::register(&registry)?;
        let dashboard = DashboardMetrics::register(&registry)?;

        Ok(Self {
            registry,
            loops,
            pool,
            statements,
            cache,
            dashboard,
        })
    }

    /// Observe the execution duration for a background loop.
    pub fn observe_loop(&self, loop_name: &str, duration: Duration, success: bool) {
        self.loops
            .duration
            .with_label_values(&[loop_name])
            .observe(duration.as_secs_f64());
        if !success {
            self.loops.errors_total.with_label_values(&[loop_name]).inc();
        }
    }

    /// Record a pool sample for the primary or a replica.
    pub fn set_pool_snapshot(&self, pool_name: &str, snapshot: &PoolSnapshot) {
        let labels = &[pool_name];
        self.pool
            .open
            .with_label_values(labels)
            .set(snapshot.open_connections as i64);
        self.pool
            .idle
            .with_label_values(labels)
            .set(snapshot.idle as i64);
        self.pool
            .in_use
            .with_label_values(labels)
            .set(snapshot.in_use as i64);
        self.pool
            .max_open
            .with_label_values(labels)
            .set(snapshot.max_open as i64);
        self.pool
            .wait_count
            .with_label_values(labels)
            .set(snapshot.wait_count as i64);
        self.pool
            .closed_max_lifetime
            .with_label_values(labels)
            .set(snapshot.max_lifetime_closed as i64);
        self.pool
            .closed_max_idle_time
            .with_label_values(labels)
            .set(snapshot.max_idle_time_closed as i64);
    }

    pub fn observe_statement(&self, kind: &str, duration: Duration, success: bool, slow: bool) {
        let outcome = if success { "ok" } else { "error" };
        self.statements
            .total
            .with_label_values(&[kind, outcome])
            .inc();
        self.statements
            .duration
            .with_label_values(&[kind])
            .observe(duration.as_secs_f64());
        if slow {
            self.statements.slow_total.with_label_values(&[kind]).inc();
        }
    }

    pub fn inc_cache_hit(&self) {
        self.cache.hits.inc();
    }

    pub fn inc_cache_miss(&self) {
        self.cache.misses.inc();
    }

    pub fn inc_cache_error(&self, operation: &str) {
        self.cache.errors.with_label_values(&[operation]).inc();
    }

    pub fn add_cache_invalidations(&self, keys: u64) {
        self.cache.invalidated_keys.inc_by(keys);
    }

    pub fn set_health(&self, score: f64, alerts: usize) {
        self.dashboard.health_score.set(score);
        self.dashboard.open_alerts.set(alerts as i64);
    }

    pub fn inc_alert(&self, category: &str, severity: &str) {
        self.dashboard
            .alerts_total
            .with_label_values(&[category, severity])
            .inc();
    }

    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct LoopMetrics {
    duration: HistogramVec,
    errors_total: IntCounterVec,
}

impl LoopMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let duration = HistogramVec::new(
            HistogramOpts::new("loop_duration_seconds", "Background loop iteration duration"),
            &["loop"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("loop_errors_total", "Failed background loop iterations"),
            &["loop"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            duration,
            errors_total,
        })
    }
}

#[derive(Clone)]
struct PoolMetrics {
    open: IntGaugeVec,
    idle: IntGaugeVec,
    in_use: IntGaugeVec,
    max_open: IntGaugeVec,
    wait_count: IntGaugeVec,
    closed_max_lifetime: IntGaugeVec,
    closed_max_idle_time: IntGaugeVec,
}

impl PoolMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let gauge = |name: &str, help: &str| -> Result<IntGaugeVec> {
            let vec = IntGaugeVec::new(Opts::new(name, help), &["pool"])?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        Ok(Self {
            open: gauge("pool_open_connections", "Open connections")?,
            idle: gauge("pool_idle_connections", "Idle connections")?,
            in_use: gauge("pool_in_use_connections", "Connections checked out")?,
            max_open: gauge("pool_max_open_connections", "Configured pool ceiling")?,
            wait_count: gauge("pool_wait_count", "Acquires that had to wait")?,
            closed_max_lifetime: gauge(
                "pool_closed_max_lifetime",
                "Connections closed for exceeding their lifetime",
            )?,
            closed_max_idle_time: gauge(
                "pool_closed_max_idle_time",
                "Connections closed for idling too long or above the idle ceiling",
            )?,
        })
    }
}

#[derive(Clone)]
struct StatementMetrics {
    total: IntCounterVec,
    slow_total: IntCounterVec,
    duration: HistogramVec,
}

impl StatementMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let total = IntCounterVec::new(
            Opts::new("statements_total", "Executed statements by kind and outcome"),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(total.clone()))?;

        let slow_total = IntCounterVec::new(
            Opts::new("slow_statements_total", "Statements above the slow threshold"),
            &["kind"],
        )?;
        registry.register(Box::new(slow_total.clone()))?;

        let duration = HistogramVec::new(
            HistogramOpts::new("statement_duration_seconds", "Statement execution time")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
            &["kind"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            total,
            slow_total,
            duration,
        })
    }
}

#[derive(Clone)]
struct CacheMetrics {
    hits: IntCounter,
    misses: IntCounter,
    errors: IntCounterVec,
    invalidated_keys: IntCounter,
}

impl CacheMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let hits = IntCounter::new("cache_hits_total", "Query cache hits")?;
        registry.register(Box::new(hits.clone()))?;
        let misses = IntCounter::new("cache_misses_total", "Query cache misses")?;
        registry.register(Box::new(misses.clone()))?;
        let errors = IntCounterVec::new(
            Opts::new("cache_errors_total", "Cache store failures by operation"),
            &["operation"],
        )?;
        registry.register(Box::new(errors.clone()))?;
        let invalidated_keys = IntCounter::new(
            "cache_invalidated_keys_total",
            "Keys removed by tag invalidation",
        )?;
        registry.register(Box::new(invalidated_keys.clone()))?;

        Ok(Self {
            hits,
            misses,
            errors,
            invalidated_keys,
        })
    }
}

#[derive(Clone)]
struct DashboardMetrics {
    health_score: Gauge,
    open_alerts: IntGauge,
    alerts_total: IntCounterVec,
}

impl DashboardMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let health_score = Gauge::new("health_score", "Composite health score (0-100)")?;
        registry.register(Box::new(health_score.clone()))?;
        let open_alerts = IntGauge::new("open_alerts", "Alerts raised by the latest report")?;
        registry.register(Box::new(open_alerts.clone()))?;
        let alerts_total = IntCounterVec::new(
            Opts::new("alerts_total", "Emitted alerts grouped by category and severity"),
            &["category", "severity"],
        )?;
        registry.register(Box::new(alerts_total.clone()))?;

        Ok(Self {
            health_score,
            open_alerts,
            alerts_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_snapshot_exports_gauges() {
        let metrics = AppMetrics::new().expect("metrics");
        let snapshot = PoolSnapshot {
            max_open: 10,
            open_connections: 6,
            idle: 2,
            in_use: 4,
            wait_count: 3,
            wait_duration_ms: 12.0,
            max_lifetime_closed: 1,
            max_idle_time_closed: 0,
        };
        metrics.set_pool_snapshot("primary", &snapshot);
        let output = metrics.encode().expect("encode");
        assert!(output.contains("pgperf_pool_in_use_connections{pool=\"primary\"} 4"));
        assert!(output.contains("pgperf_pool_max_open_connections{pool=\"primary\"} 10"));
    }

    #[test]
    fn statement_counters_split_by_outcome() {
        let metrics = AppMetrics::new().expect("metrics");
        metrics.observe_statement("select", Duration::from_millis(5), true, false);
        metrics.observe_statement("select", Duration::from_millis(500), false, true);
        let output = metrics.encode().expect("encode");
        assert!(output.contains("pgperf_statements_total{kind=\"select\",outcome=\"ok\"} 1"));
        assert!(output.contains("pgperf_statements_total{kind=\"select\",outcome=\"error\"} 1"));
        assert!(output.contains("pgperf_slow_statements_total{kind=\"select\"} 1"));
    }

    #[test]
    fn health_gauge_is_exported() {
        let metrics = AppMetrics::new().expect("metrics");
        metrics.set_health(72.5, 2);
        let output = metrics.encode().expect("encode");
        assert!(output.contains("pgperf_health_score 72.5"));
        assert!(output.contains("pgperf_open_alerts 2"));
    }
}
