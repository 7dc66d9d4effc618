use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::metrics::AppMetrics;
use crate::sql::{self, StatementKind};

const SLOW_RATIO_WARN: f64 = 5.0;
const SLOW_RATIO_CRIT: f64 = 10.0;
const FAILURE_RATE_WARN: f64 = 1.0;
const AVERAGE_DURATION_WARN_MS: f64 = 50.0;

/// A statement that exceeded the slow-query threshold.
#[derive(Debug, Clone, Serialize)]
pub struct SlowQueryRecord {
    pub sql: String,
    pub duration_ms: f64,
    pub recorded_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Fixed-capacity FIFO backed by a preallocated slot arena.
#[derive(Debug)]
pub struct SlowQueryLog {
    slots: Vec<Option<SlowQueryRecord>>,
    head: usize,
    len: usize,
}

impl SlowQueryLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a record, returning the evicted oldest record when full.
    pub fn push(&mut self, record: SlowQueryRecord) -> Option<SlowQueryRecord> {
        let capacity = self.capacity();
        if self.len < capacity {
            let tail = (self.head + self.len) % capacity;
            self.slots[tail] = Some(record);
            self.len += 1;
            None
        } else {
            let evicted = self.slots[self.head].replace(record);
            self.head = (self.head + 1) % capacity;
            evicted
        }
    }

    /// Records oldest first.
    pub fn to_vec(&self) -> Vec<SlowQueryRecord> {
        let capacity = self.capacity();
        (0..self.len)
            .filter_map(|offset| self.slots[(self.head + offset) % capacity].clone())
            .collect()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryPattern {
    pub kind: StatementKind,
    pub table: String,
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub last_seen: DateTime<Utc>,
}

impl QueryPattern {
    fn new(kind: StatementKind, table: String, duration_ms: f64, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            table,
            count: 1,
            total_ms: duration_ms,
            min_ms: duration_ms,
            max_ms: duration_ms,
            avg_ms: duration_ms,
            last_seen: now,
        }
    }

    fn observe(&mut self, duration_ms: f64, now: DateTime<Utc>) {
        self.count += 1;
        self.total_ms += duration_ms;
        self.min_ms = self.min_ms.min(duration_ms);
        self.max_ms = self.max_ms.max(duration_ms);
        self.avg_ms = self.total_ms / self.count as f64;
        self.last_seen = now;
    }
}

/// Point-in-time copy of the monitor counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryStats {
    pub total_queries: u64,
    pub slow_queries: u64,
    pub failed_queries: u64,
    pub average_duration_ms: f64,
    pub slow_query_threshold_ms: f64,
}

impl QueryStats {
    pub fn slow_query_ratio(&self) -> f64 {
        percentage(self.slow_queries, self.total_queries)
    }

    pub fn failure_rate(&self) -> f64 {
        percentage(self.failed_queries, self.total_queries)
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 * 100.0 / whole as f64).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryAnalysis {
    pub stats: QueryStats,
    pub slow_query_ratio: f64,
    pub failure_rate: f64,
    pub top_patterns: Vec<QueryPattern>,
    pub recommendations: Vec<String>,
}

#[derive(Debug)]
struct MonitorState {
    total: u64,
    slow: u64,
    failed: u64,
    average_ms: f64,
    slow_log: SlowQueryLog,
    patterns: HashMap<(StatementKind, String), QueryPattern>,
}

/// Records the outcome of every statement passing through the pools.
pub struct QueryMonitor {
    threshold: Duration,
    top_patterns: usize,
    metrics: Option<AppMetrics>,
    state: RwLock<MonitorState>,
}

impl QueryMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            threshold: config.slow_query_threshold,
            top_patterns: config.top_patterns,
            metrics: None,
            state: RwLock::new(MonitorState {
                total: 0,
                slow: 0,
                failed: 0,
                average_ms: 0.0,
                slow_log: SlowQueryLog::with_capacity(config.slow_log_capacity),
                patterns: HashMap::new(),
            }),
        }
    }

    pub fn with_metrics(mut self, metrics: AppMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Time `fut` and record its outcome against `sql`.
    pub async fn observe<T, E, F>(&self, sql: &str, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();
        match &result {
            Ok(_) => self.record(sql, elapsed, None),
            Err(err) => self.record(sql, elapsed, Some(&err.to_string())),
        }
        result
    }

    /// Record a finished statement.
    pub fn record(&self, sql: &str, duration: Duration, error: Option<&str>) {
        let kind = sql::statement_kind(sql);
        let table = sql::table_hint(sql).unwrap_or_else(|| "-".to_string());
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        let is_slow = duration > self.threshold;
        let now = Utc::now();

        {
            let mut state = self.state.write();
            state.total += 1;
            if error.is_some() {
                state.failed += 1;
            }
            state.average_ms += (duration_ms - state.average_ms) / state.total as f64;

            if is_slow {
                state.slow += 1;
                let record = SlowQueryRecord {
                    sql: sql::sanitize(sql),
                    duration_ms,
                    recorded_at: now,
                    error: error.map(str::to_string),
                };
                if state.slow_log.push(record).is_some() {
                    debug!("slow query log full; evicted oldest entry");
                }
            }

            state
                .patterns
                .entry((kind, table.clone()))
                .and_modify(|pattern| pattern.observe(duration_ms, now))
                .or_insert_with(|| QueryPattern::new(kind, table.clone(), duration_ms, now));
        }

        if let Some(metrics) = &self.metrics {
            metrics.observe_statement(kind.as_str(), duration, error.is_none(), is_slow);
        }
        if is_slow {
            warn!(
                kind = kind.as_str(),
                table = %table,
                duration_ms,
                failed = error.is_some(),
                "slow query"
            );
        }
    }

    pub fn stats(&self) -> QueryStats {
        let state = self.state.read();
        QueryStats {
            total_queries: state.total,
            slow_queries: state.slow,
            failed_queries: state.failed,
            average_duration_ms: state.average_ms,
            slow_query_threshold_ms: self.threshold.as_secs_f64() * 1_000.0,
        }
    }

    /// Slow queries, oldest first.
    pub fn slow_queries(&self) -> Vec<SlowQueryRecord> {
        self.state.read().slow_log.to_vec()
    }

    pub fn slow_query_ratio(&self) -> f64 {
        self.stats().slow_query_ratio()
    }

    pub fn analysis(&self) -> QueryAnalysis {
        let (stats, mut patterns) = {
            let state = self.state.read();
            let stats = QueryStats {
                total_queries: state.total,
                slow_queries: state.slow,
                failed_queries: state.failed,
                average_duration_ms: state.average_ms,
                slow_query_threshold_ms: self.threshold.as_secs_f64() * 1_000.0,
            };
            (stats, state.patterns.values().cloned().collect::<Vec<_>>())
        };

        patterns.sort_by(|a, b| {
            b.total_ms
                .partial_cmp(&a.total_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        patterns.truncate(self.top_patterns);

        let slow_query_ratio = stats.slow_query_ratio();
        let failure_rate = stats.failure_rate();
        let recommendations = query_recommendations(&stats, &patterns);

        QueryAnalysis {
            stats,
            slow_query_ratio,
            failure_rate,
            top_patterns: patterns,
            recommendations,
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.write();
        state.total = 0;
        state.slow = 0;
        state.failed = 0;
        state.average_ms = 0.0;
        state.slow_log.clear();
        state.patterns.clear();
    }
}

fn query_recommendations(stats: &QueryStats, patterns: &[QueryPattern]) -> Vec<String> {
    let mut out = Vec::new();
    let slow_ratio = stats.slow_query_ratio();
    if slow_ratio > SLOW_RATIO_CRIT {
        out.push(format!(
            "Slow query ratio is {slow_ratio:.1}% (>{SLOW_RATIO_CRIT}%): review the slowest patterns and add indexes for their filters"
        ));
    } else if slow_ratio > SLOW_RATIO_WARN {
        out.push(format!(
            "Slow query ratio is {slow_ratio:.1}% (>{SLOW_RATIO_WARN}%): consider caching hot reads or adding indexes"
        ));
    }

    let failure_rate = stats.failure_rate();
    if failure_rate > FAILURE_RATE_WARN {
        out.push(format!(
            "Query failure rate is {failure_rate:.1}% (>{FAILURE_RATE_WARN}%): inspect application errors and lock timeouts"
        ));
    }

    if stats.average_duration_ms > AVERAGE_DURATION_WARN_MS {
        out.push(format!(
            "Average query duration is {:.1}ms (>{AVERAGE_DURATION_WARN_MS}ms): check pool saturation and missing indexes",
            stats.average_duration_ms
        ));
    }

    if let Some(worst) = patterns.first() {
        if worst.avg_ms > stats.slow_query_threshold_ms && worst.count > 1 {
            out.push(format!(
                "{} statements on `{}` average {:.1}ms over {} executions",
                worst.kind.as_str().to_uppercase(),
                worst.table,
                worst.avg_ms,
                worst.count
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(threshold_ms: u64, capacity: usize) -> QueryMonitor {
        QueryMonitor::new(&MonitorConfig {
            slow_query_threshold: Duration::from_millis(threshold_ms),
            slow_log_capacity: capacity,
            top_patterns: 5,
        })
    }

    fn record(sql: &str) -> SlowQueryRecord {
        SlowQueryRecord {
            sql: sql.into(),
            duration_ms: 1.0,
            recorded_at: Utc::now(),
            error: None,
        }
    }

    #[test]
    fn ring_buffer_evicts_oldest_first() {
        let mut log = SlowQueryLog::with_capacity(3);
        for i in 0..3 {
            assert!(log.push(record(&format!("q{i}"))).is_none());
        }
        let evicted = log.push(record("q3")).expect("evicted");
        assert_eq!(evicted.sql, "q0");
        let sqls: Vec<_> = log.to_vec().into_iter().map(|r| r.sql).collect();
        assert_eq!(sqls, vec!["q1", "q2", "q3"]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn slow_counter_moves_only_above_threshold() {
        let m = monitor(50, 10);
        m.record("SELECT 1", Duration::from_millis(50), None);
        assert_eq!(m.stats().slow_queries, 0);
        m.record("SELECT 1", Duration::from_millis(51), None);
        assert_eq!(m.stats().slow_queries, 1);
        m.record("SELECT 1", Duration::from_millis(10), None);
        assert_eq!(m.stats().slow_queries, 1);
        assert_eq!(m.stats().total_queries, 3);
    }

    #[test]
    fn running_average_and_failures() {
        let m = monitor(1_000, 10);
        m.record("SELECT 1", Duration::from_millis(10), None);
        m.record("SELECT 1", Duration::from_millis(30), Some("boom"));
        let stats = m.stats();
        assert!((stats.average_duration_ms - 20.0).abs() < 1e-6);
        assert_eq!(stats.failed_queries, 1);
        assert!((stats.failure_rate() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn slow_records_are_sanitized() {
        let m = monitor(1, 10);
        m.record(
            "SELECT * FROM users WHERE email = 'a@b.c'",
            Duration::from_millis(5),
            Some("timeout"),
        );
        let slow = m.slow_queries();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].sql, "SELECT * FROM users WHERE email = ?");
        assert_eq!(slow[0].error.as_deref(), Some("timeout"));
    }

    #[test]
    fn patterns_aggregate_by_kind_and_table() {
        let m = monitor(1_000, 10);
        m.record("SELECT * FROM recipes WHERE id = $1", Duration::from_millis(10), None);
        m.record("select title from recipes", Duration::from_millis(30), None);
        m.record("UPDATE recipes SET title = $1", Duration::from_millis(5), None);
        let analysis = m.analysis();
        let select = analysis
            .top_patterns
            .iter()
            .find(|p| p.kind == StatementKind::Select)
            .expect("select pattern");
        assert_eq!(select.table, "recipes");
        assert_eq!(select.count, 2);
        assert!((select.min_ms - 10.0).abs() < 1e-6);
        assert!((select.max_ms - 30.0).abs() < 1e-6);
        assert!((select.avg_ms - 20.0).abs() < 1e-6);
        assert_eq!(analysis.top_patterns[0].kind, StatementKind::Select);
    }

    #[test]
    fn stats_are_copies() {
        let m = monitor(1, 10);
        m.record("SELECT 1", Duration::from_millis(5), None);
        let before = m.slow_queries();
        m.record("SELECT 2", Duration::from_millis(5), None);
        assert_eq!(before.len(), 1);
        assert_eq!(m.slow_queries().len(), 2);
    }

    #[tokio::test]
    async fn observe_records_errors() {
        let m = monitor(1_000, 10);
        let result: Result<(), String> = m
            .observe("DELETE FROM sessions WHERE id = $1", async {
                Err("deadlock detected".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(m.stats().failed_queries, 1);
    }
}
