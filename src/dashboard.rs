use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::{CacheStats, QueryCache};
use crate::db::{ConnectionManager, PoolSnapshot};
use crate::index::{IndexAnalysis, IndexOptimizer};
use crate::metrics::AppMetrics;
use crate::monitor::{QueryAnalysis, QueryMonitor, SlowQueryRecord};

pub const MONITOR_LOOP: &str = "dashboard";
const RECENT_SLOW_QUERIES: usize = 10;

const CONN_CRITICAL_PCT: f64 = 90.0;
const CONN_WARNING_PCT: f64 = 80.0;
const CONN_UNDERUSED_PCT: f64 = 10.0;
const FAILURE_RATE_PCT: f64 = 1.0;
const SLOW_RATIO_CRITICAL_PCT: f64 = 10.0;
const SLOW_RATIO_WARNING_PCT: f64 = 5.0;
const CACHE_CRITICAL_PCT: f64 = 70.0;
const CACHE_WARNING_PCT: f64 = 85.0;
const CACHE_TARGET_PCT: f64 = 90.0;
const INDEX_CRITICAL_SCORE: f64 = 50.0;
const INDEX_WARNING_SCORE: f64 = 75.0;

/// Anything that can report current pool usage.
pub trait PoolStatsSource: Send + Sync {
    fn pool_snapshot(&self) -> PoolSnapshot;
}

impl PoolStatsSource for ConnectionManager {
    fn pool_snapshot(&self) -> PoolSnapshot {
        ConnectionManager::pool_snapshot(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score < 50.0 {
            HealthStatus::Critical
        } else if score < 75.0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertCategory {
    Connection,
    Query,
    Cache,
    Index,
}

impl AlertCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertCategory::Connection => "connection",
            AlertCategory::Query => "query",
            AlertCategory::Cache => "cache",
            AlertCategory::Index => "index",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Planned,
    Soon,
    Immediate,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecommendedAction {
    pub action: String,
    pub urgency: Urgency,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DashboardAlert {
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    /// Most urgent first.
    pub actions: Vec<RecommendedAction>,
}

/// Condensed view of the latest index analysis.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndexSummary {
    pub analyzed_at: DateTime<Utc>,
    pub health_score: f64,
    pub unused_indexes: usize,
    pub missing_indexes: usize,
    pub high_priority_missing: usize,
    pub index_usage_ratio: f64,
    pub recommendations: Vec<String>,
}

impl From<&IndexAnalysis> for IndexSummary {
    fn from(analysis: &IndexAnalysis) -> Self {
        Self {
            analyzed_at: analysis.analyzed_at,
            health_score: analysis.health_score,
            unused_indexes: analysis.unused_indexes.len(),
            missing_indexes: analysis.missing_indexes.len(),
            high_priority_missing: analysis.high_priority_missing().count(),
            index_usage_ratio: analysis.index_usage_ratio,
            recommendations: analysis.recommendations.clone(),
        }
    }
}

/// Everything the dashboard knows about pool, statement, cache and index health.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub pool: Option<PoolSnapshot>,
    pub queries: QueryAnalysis,
    pub cache: Option<CacheStats>,
    pub indexes: Option<IndexSummary>,
}

impl ConnectionMetrics {
    /// In-use connections over the pool ceiling, in percent.
    pub fn connection_efficiency(&self) -> Option<f64> {
        self.pool
            .as_ref()
            .filter(|pool| pool.max_open > 0)
            .map(PoolSnapshot::efficiency)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SectionError {
    pub section: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct ScoreBreakdown {
    pub connection_penalty: f64,
    pub query_penalty: f64,
    pub cache_penalty: f64,
    pub index_penalty: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.connection_penalty + self.query_penalty + self.cache_penalty + self.index_penalty
    }
}

/// Snapshots gathered from the components before scoring.
#[derive(Debug, Clone)]
pub struct DashboardInputs {
    pub pool: Option<PoolSnapshot>,
    pub queries: QueryAnalysis,
    pub slow_queries: Vec<SlowQueryRecord>,
    pub cache: Option<CacheStats>,
    pub indexes: Option<IndexSummary>,
    pub section_errors: Vec<SectionError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardReport {
    pub generated_at: DateTime<Utc>,
    pub health_score: f64,
    pub status: HealthStatus,
    pub score_breakdown: ScoreBreakdown,
    pub metrics: ConnectionMetrics,
    pub connection_efficiency: Option<f64>,
    pub alerts: Vec<DashboardAlert>,
    pub recommendations: Vec<String>,
    pub recent_slow_queries: Vec<SlowQueryRecord>,
    /// Sections that could not be collected; they are left out of the score.
    pub section_errors: Vec<SectionError>,
}

impl DashboardReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Plain-text report for terminals and logs.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Database performance report ({})", self.generated_at.to_rfc3339());
        let _ = writeln!(
            out,
            "Health: {:.1}/100 [{}]",
            self.health_score,
            self.status.as_str().to_uppercase()
        );
        let b = &self.score_breakdown;
        let _ = writeln!(
            out,
            "Penalties: connections -{:.1}, queries -{:.1}, cache -{:.1}, indexes -{:.1}",
            b.connection_penalty, b.query_penalty, b.cache_penalty, b.index_penalty
        );

        out.push_str("\nConnections\n");
        match &self.metrics.pool {
            Some(pool) => {
                let _ = writeln!(
                    out,
                    "  in use {}/{} ({:.1}%), idle {}, waits {} (avg {:.1}ms)",
                    pool.in_use,
                    pool.max_open,
                    pool.efficiency(),
                    pool.idle,
                    pool.wait_count,
                    pool.average_wait_ms()
                );
                let _ = writeln!(
                    out,
                    "  closed: {} by lifetime, {} by idle time",
                    pool.max_lifetime_closed, pool.max_idle_time_closed
                );
            }
            None => out.push_str("  unavailable\n"),
        }

        let q = &self.metrics.queries;
        out.push_str("\nQueries\n");
        let _ = writeln!(
            out,
            "  total {}, slow {} ({:.1}%), failed {} ({:.1}%), avg {:.1}ms",
            q.stats.total_queries,
            q.stats.slow_queries,
            q.slow_query_ratio,
            q.stats.failed_queries,
            q.failure_rate,
            q.stats.average_duration_ms
        );

        out.push_str("\nCache\n");
        match &self.metrics.cache {
            Some(cache) => {
                let _ = writeln!(
                    out,
                    "  hits {}, misses {}, hit ratio {:.1}%, errors {}",
                    cache.hits, cache.misses, cache.hit_ratio, cache.errors
                );
            }
            None => out.push_str("  unavailable\n"),
        }

        out.push_str("\nIndexes\n");
        match &self.metrics.indexes {
            Some(idx) => {
                let _ = writeln!(
                    out,
                    "  health {:.1}, usage {:.1}%, unused {}, missing {} ({} high priority)",
                    idx.health_score,
                    idx.index_usage_ratio,
                    idx.unused_indexes,
                    idx.missing_indexes,
                    idx.high_priority_missing
                );
            }
            None => out.push_str("  unavailable\n"),
        }

        if !self.alerts.is_empty() {
            out.push_str("\nAlerts\n");
            for alert in &self.alerts {
                let _ = writeln!(
                    out,
                    "  [{}] {}: {} (value {:.1}, threshold {:.1})",
                    alert.severity.as_str().to_uppercase(),
                    alert.category.as_str(),
                    alert.message,
                    alert.value,
                    alert.threshold
                );
                for action in &alert.actions {
                    let _ = writeln!(out, "    - ({:?}) {}", action.urgency, action.action);
                }
            }
        }

        if !self.recommendations.is_empty() {
            out.push_str("\nRecommendations\n");
            for rec in &self.recommendations {
                let _ = writeln!(out, "  - {rec}");
            }
        }

        if !self.section_errors.is_empty() {
            out.push_str("\nUnavailable sections\n");
            for err in &self.section_errors {
                let _ = writeln!(out, "  {}: {}", err.section, err.message);
            }
        }
        out
    }
}

fn action(text: &str, urgency: Urgency) -> RecommendedAction {
    RecommendedAction {
        action: text.to_string(),
        urgency,
    }
}

fn connection_assessment(efficiency: f64) -> (f64, Option<DashboardAlert>) {
    let alert = |severity, threshold, message: String, actions| DashboardAlert {
        severity,
        category: AlertCategory::Connection,
        metric: "connection_efficiency".into(),
        value: efficiency,
        threshold,
        message,
        actions,
    };
    if efficiency > CONN_CRITICAL_PCT {
        (
            25.0,
            Some(alert(
                AlertSeverity::Critical,
                CONN_CRITICAL_PCT,
                format!("Connection pool {efficiency:.1}% utilized"),
                vec![
                    action("Raise pool.max_open or shed load", Urgency::Immediate),
                    action("Look for long-held connections and slow transactions", Urgency::Soon),
                ],
            )),
        )
    } else if efficiency > CONN_WARNING_PCT {
        (
            15.0,
            Some(alert(
                AlertSeverity::Warning,
                CONN_WARNING_PCT,
                format!("Connection pool {efficiency:.1}% utilized"),
                vec![
                    action("Plan pool.max_open headroom before peak traffic", Urgency::Soon),
                    action("Route read traffic to replicas", Urgency::Planned),
                ],
            )),
        )
    } else if efficiency < CONN_UNDERUSED_PCT {
        (
            10.0,
            Some(alert(
                AlertSeverity::Info,
                CONN_UNDERUSED_PCT,
                format!("Connection pool only {efficiency:.1}% utilized"),
                vec![action("Lower pool.max_idle to release idle backends", Urgency::Planned)],
            )),
        )
    } else {
        (0.0, None)
    }
}

fn query_assessment(queries: &QueryAnalysis) -> (f64, Vec<DashboardAlert>) {
    let mut alerts = Vec::new();
    let mut penalty = 0.0;

    if queries.failure_rate > FAILURE_RATE_PCT {
        penalty = 30.0;
        alerts.push(DashboardAlert {
            severity: AlertSeverity::Critical,
            category: AlertCategory::Query,
            metric: "failure_rate".into(),
            value: queries.failure_rate,
            threshold: FAILURE_RATE_PCT,
            message: format!("{:.1}% of queries are failing", queries.failure_rate),
            actions: vec![
                action("Inspect recent query errors in the slow-query log", Urgency::Immediate),
                action("Check for lock timeouts and constraint violations", Urgency::Soon),
            ],
        });
    }

    let slow = queries.slow_query_ratio;
    let slow_alert = if slow > SLOW_RATIO_CRITICAL_PCT {
        Some((AlertSeverity::Critical, SLOW_RATIO_CRITICAL_PCT, 25.0))
    } else if slow > SLOW_RATIO_WARNING_PCT {
        Some((AlertSeverity::Warning, SLOW_RATIO_WARNING_PCT, 15.0))
    } else {
        None
    };
    if let Some((severity, threshold, slow_penalty)) = slow_alert {
        if penalty == 0.0 {
            penalty = slow_penalty;
        }
        alerts.push(DashboardAlert {
            severity,
            category: AlertCategory::Query,
            metric: "slow_query_ratio".into(),
            value: slow,
            threshold,
            message: format!("{slow:.1}% of queries exceed the slow threshold"),
            actions: vec![
                action("Add indexes for the slowest query patterns", Urgency::Soon),
                action("Cache hot read paths", Urgency::Planned),
            ],
        });
    }
    (penalty, alerts)
}

fn cache_assessment(cache: &CacheStats) -> (f64, Option<DashboardAlert>) {
    if cache.lookups() == 0 {
        return (0.0, None);
    }
    let ratio = cache.hit_ratio;
    let (penalty, severity, threshold) = if ratio < CACHE_CRITICAL_PCT {
        (25.0, AlertSeverity::Critical, CACHE_CRITICAL_PCT)
    } else if ratio < CACHE_WARNING_PCT {
        (15.0, AlertSeverity::Warning, CACHE_WARNING_PCT)
    } else if ratio < CACHE_TARGET_PCT {
        (10.0, AlertSeverity::Info, CACHE_TARGET_PCT)
    } else {
        return (0.0, None);
    };
    (
        penalty,
        Some(DashboardAlert {
            severity,
            category: AlertCategory::Cache,
            metric: "cache_hit_ratio".into(),
            value: ratio,
            threshold,
            message: format!("Cache hit ratio {ratio:.1}% is below {threshold:.0}%"),
            actions: vec![
                action("Raise TTLs for read-mostly queries", Urgency::Soon),
                action("Narrow invalidation to the tables actually written", Urgency::Planned),
            ],
        }),
    )
}

fn index_assessment(index: &IndexSummary) -> (f64, Option<DashboardAlert>) {
    let penalty = (100.0 - index.health_score).max(0.0) * 0.2;
    let severity = if index.health_score < INDEX_CRITICAL_SCORE {
        AlertSeverity::Critical
    } else if index.health_score < INDEX_WARNING_SCORE {
        AlertSeverity::Warning
    } else {
        return (penalty, None);
    };
    let threshold = if severity == AlertSeverity::Critical {
        INDEX_CRITICAL_SCORE
    } else {
        INDEX_WARNING_SCORE
    };
    let mut actions = Vec::new();
    if index.high_priority_missing > 0 {
        actions.push(action(
            "Apply the high-priority CREATE INDEX CONCURRENTLY statements",
            Urgency::Soon,
        ));
    }
    if index.unused_indexes > 0 {
        actions.push(action(
            "Review unused indexes in the optimization script",
            Urgency::Planned,
        ));
    }
    (
        penalty,
        Some(DashboardAlert {
            severity,
            category: AlertCategory::Index,
            metric: "index_health_score".into(),
            value: index.health_score,
            threshold,
            message: format!("Index health score {:.1}", index.health_score),
            actions,
        }),
    )
}

fn cache_recommendation(cache: &CacheStats) -> Option<String> {
    (cache.lookups() > 0 && cache.hit_ratio < CACHE_TARGET_PCT).then(|| {
        format!(
            "Cache hit ratio is {:.1}%; target is {CACHE_TARGET_PCT:.0}% or better",
            cache.hit_ratio
        )
    })
}

/// Score, alert and recommend from already-collected snapshots.
pub fn build_report(inputs: DashboardInputs) -> DashboardReport {
    let DashboardInputs {
        pool,
        queries,
        slow_queries,
        cache,
        indexes,
        section_errors,
    } = inputs;

    let metrics = ConnectionMetrics {
        pool,
        queries,
        cache,
        indexes,
    };
    let efficiency = metrics.connection_efficiency();

    let mut breakdown = ScoreBreakdown::default();
    let mut alerts = Vec::new();

    if let Some(efficiency) = efficiency {
        let (penalty, alert) = connection_assessment(efficiency);
        breakdown.connection_penalty = penalty;
        alerts.extend(alert);
    }

    let (query_penalty, query_alerts) = query_assessment(&metrics.queries);
    breakdown.query_penalty = query_penalty;
    alerts.extend(query_alerts);

    if let Some(cache) = &metrics.cache {
        let (penalty, alert) = cache_assessment(cache);
        breakdown.cache_penalty = penalty;
        alerts.extend(alert);
    }

    if let Some(index) = &metrics.indexes {
        let (penalty, alert) = index_assessment(index);
        breakdown.index_penalty = penalty;
        alerts.extend(alert);
    }

    alerts.sort_by(|a, b| b.severity.cmp(&a.severity));
    for alert in &mut alerts {
        alert.actions.sort_by(|a, b| b.urgency.cmp(&a.urgency));
    }

    let health_score = (100.0 - breakdown.total()).clamp(0.0, 100.0);

    let mut seen = HashSet::new();
    let recommendations: Vec<String> = metrics
        .queries
        .recommendations
        .iter()
        .cloned()
        .chain(metrics.cache.as_ref().and_then(cache_recommendation))
        .chain(
            metrics
                .indexes
                .iter()
                .flat_map(|idx| idx.recommendations.iter().cloned()),
        )
        .filter(|rec| seen.insert(rec.clone()))
        .collect();

    let mut recent_slow_queries = slow_queries;
    if recent_slow_queries.len() > RECENT_SLOW_QUERIES {
        recent_slow_queries.drain(..recent_slow_queries.len() - RECENT_SLOW_QUERIES);
    }

    DashboardReport {
        generated_at: Utc::now(),
        health_score,
        status: HealthStatus::from_score(health_score),
        score_breakdown: breakdown,
        metrics,
        connection_efficiency: efficiency,
        alerts,
        recommendations,
        recent_slow_queries,
        section_errors,
    }
}

/// Read model over the live components. Holds no state of its own.
pub struct PerformanceDashboard {
    pools: Option<Arc<dyn PoolStatsSource>>,
    monitor: Arc<QueryMonitor>,
    cache: Option<Arc<QueryCache>>,
    indexes: Option<Arc<IndexOptimizer>>,
    metrics: Option<AppMetrics>,
}

impl PerformanceDashboard {
    pub fn new(monitor: Arc<QueryMonitor>) -> Self {
        Self {
            pools: None,
            monitor,
            cache: None,
            indexes: None,
            metrics: None,
        }
    }

    pub fn with_pools(mut self, pools: Arc<dyn PoolStatsSource>) -> Self {
        self.pools = Some(pools);
        self
    }

    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_indexes(mut self, indexes: Arc<IndexOptimizer>) -> Self {
        self.indexes = Some(indexes);
        self
    }

    pub fn with_metrics(mut self, metrics: AppMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Collect every section; failures are recorded on the report instead of propagated.
    pub async fn collect_inputs(&self) -> DashboardInputs {
        let mut section_errors = Vec::new();

        let pool = self.pools.as_ref().map(|pools| pools.pool_snapshot());
        if pool.is_none() {
            section_errors.push(SectionError {
                section: "connections".into(),
                message: "no connection manager attached".into(),
            });
        }

        let cache = match &self.cache {
            Some(cache) => match cache.ping().await {
                Ok(()) => Some(cache.stats()),
                Err(err) => {
                    section_errors.push(SectionError {
                        section: "cache".into(),
                        message: format!("cache backend unreachable: {err}"),
                    });
                    None
                }
            },
            None => None,
        };

        let indexes = match &self.indexes {
            Some(optimizer) => match optimizer.latest_analysis() {
                Some(analysis) => Some(IndexSummary::from(&analysis)),
                None => {
                    section_errors.push(SectionError {
                        section: "indexes".into(),
                        message: "index analysis has not run yet".into(),
                    });
                    None
                }
            },
            None => None,
        };

        DashboardInputs {
            pool,
            queries: self.monitor.analysis(),
            slow_queries: self.monitor.slow_queries(),
            cache,
            indexes,
            section_errors,
        }
    }

    pub async fn report(&self) -> DashboardReport {
        let report = build_report(self.collect_inputs().await);
        if let Some(metrics) = &self.metrics {
            metrics.set_health(report.health_score, report.alerts.len());
        }
        report
    }

    /// Periodically build a report and log it at a level matching its status.
    pub fn start_monitoring(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let dashboard = Arc::clone(self);
        tokio::spawn(async move {
            info!(loop_name = MONITOR_LOOP, interval = ?interval, "starting dashboard loop");
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        let report = dashboard.report().await;
                        dashboard.log_report(&report);
                        if let Some(metrics) = &dashboard.metrics {
                            metrics.observe_loop(MONITOR_LOOP, started.elapsed(), true);
                        }
                    }
                }
            }
            info!(loop_name = MONITOR_LOOP, "dashboard loop stopped");
        })
    }

    fn log_report(&self, report: &DashboardReport) {
        if let Some(metrics) = &self.metrics {
            for alert in &report.alerts {
                metrics.inc_alert(alert.category.as_str(), alert.severity.as_str());
            }
        }
        match report.status {
            HealthStatus::Healthy => info!(
                health_score = report.health_score,
                alerts = report.alerts.len(),
                "database performance healthy"
            ),
            HealthStatus::Warning => warn!(
                health_score = report.health_score,
                alerts = report.alerts.len(),
                "database performance degraded"
            ),
            HealthStatus::Critical => error!(
                health_score = report.health_score,
                alerts = report.alerts.len(),
                recommendations = ?report.recommendations,
                "database performance critical"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;

    fn empty_queries() -> QueryAnalysis {
        QueryMonitor::new(&MonitorConfig::default()).analysis()
    }

    fn inputs() -> DashboardInputs {
        DashboardInputs {
            pool: None,
            queries: empty_queries(),
            slow_queries: Vec::new(),
            cache: None,
            indexes: None,
            section_errors: Vec::new(),
        }
    }

    fn pool(in_use: u32, max_open: u32) -> PoolSnapshot {
        PoolSnapshot {
            max_open,
            open_connections: in_use,
            in_use,
            ..PoolSnapshot::default()
        }
    }

    #[test]
    fn status_bands() {
        assert_eq!(HealthStatus::from_score(49.9), HealthStatus::Critical);
        assert_eq!(HealthStatus::from_score(50.0), HealthStatus::Warning);
        assert_eq!(HealthStatus::from_score(75.0), HealthStatus::Healthy);
    }

    #[test]
    fn ninety_percent_pool_is_a_warning() {
        let report = build_report(DashboardInputs {
            pool: Some(pool(9, 10)),
            ..inputs()
        });
        assert_eq!(report.connection_efficiency, Some(90.0));
        assert_eq!(report.score_breakdown.connection_penalty, 15.0);
        let alert = &report.alerts[0];
        assert_eq!(alert.category, AlertCategory::Connection);
        assert_eq!(alert.severity, AlertSeverity::Warning);
    }

    #[test]
    fn saturated_pool_is_critical() {
        let report = build_report(DashboardInputs {
            pool: Some(pool(10, 10)),
            ..inputs()
        });
        assert_eq!(report.score_breakdown.connection_penalty, 25.0);
        assert_eq!(report.alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(report.alerts[0].actions[0].urgency, Urgency::Immediate);
    }

    #[test]
    fn cache_without_lookups_is_not_penalized() {
        let report = build_report(DashboardInputs {
            cache: Some(CacheStats::default()),
            ..inputs()
        });
        assert_eq!(report.score_breakdown.cache_penalty, 0.0);
        assert!(report.alerts.is_empty());
    }

    #[test]
    fn poor_cache_ratio_costs_twenty_five() {
        let report = build_report(DashboardInputs {
            cache: Some(CacheStats {
                hits: 60,
                misses: 40,
                hit_ratio: 60.0,
                ..CacheStats::default()
            }),
            ..inputs()
        });
        assert_eq!(report.score_breakdown.cache_penalty, 25.0);
        assert_eq!(report.health_score, 75.0);
        assert!(report.recommendations.iter().any(|r| r.contains("60.0%")));
    }

    #[test]
    fn index_penalty_scales_with_health() {
        let report = build_report(DashboardInputs {
            indexes: Some(IndexSummary {
                analyzed_at: Utc::now(),
                health_score: 60.0,
                unused_indexes: 2,
                missing_indexes: 3,
                high_priority_missing: 3,
                index_usage_ratio: 95.0,
                recommendations: vec!["a".into(), "a".into()],
            }),
            ..inputs()
        });
        assert!((report.score_breakdown.index_penalty - 8.0).abs() < 1e-9);
        assert_eq!(report.recommendations, vec!["a".to_string()]);
        assert_eq!(report.alerts[0].severity, AlertSeverity::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_loop_stops_when_cancelled() {
        let metrics = AppMetrics::new().expect("metrics");
        let dashboard = Arc::new(
            PerformanceDashboard::new(Arc::new(QueryMonitor::new(&MonitorConfig::default())))
                .with_metrics(metrics.clone()),
        );
        let cancel = CancellationToken::new();
        let handle = dashboard.start_monitoring(Duration::from_secs(60), cancel.clone());

        time::sleep(Duration::from_secs(150)).await;
        cancel.cancel();
        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop stops promptly")
            .expect("loop exits cleanly");

        let output = metrics.encode().expect("encode");
        assert!(output.contains("pgperf_loop_duration_seconds_count{loop=\"dashboard\"} 3"));
    }

    #[test]
    fn text_report_lists_unavailable_sections() {
        let report = build_report(DashboardInputs {
            section_errors: vec![SectionError {
                section: "cache".into(),
                message: "cache backend unreachable".into(),
            }],
            ..inputs()
        });
        let text = report.to_text();
        assert!(text.contains("Health: 100.0/100 [HEALTHY]"));
        assert!(text.contains("cache: cache backend unreachable"));
    }
}
