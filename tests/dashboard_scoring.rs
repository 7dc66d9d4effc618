use std::sync::Arc;

use pgperf::cache::{MemoryStore, QueryCache};
use pgperf::config::{CacheConfig, MonitorConfig};
use pgperf::dashboard::{
    AlertCategory, AlertSeverity, HealthStatus, PerformanceDashboard, PoolStatsSource,
};
use pgperf::db::PoolSnapshot;
use pgperf::monitor::QueryMonitor;

struct FixedPool {
    in_use: u32,
    max_open: u32,
}

impl PoolStatsSource for FixedPool {
    fn pool_snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            max_open: self.max_open,
            open_connections: self.in_use,
            in_use: self.in_use,
            ..PoolSnapshot::default()
        }
    }
}

fn monitor() -> Arc<QueryMonitor> {
    Arc::new(QueryMonitor::new(&MonitorConfig::default()))
}

#[tokio::test]
async fn nine_of_ten_connections_is_a_warning() {
    let dashboard = PerformanceDashboard::new(monitor()).with_pools(Arc::new(FixedPool {
        in_use: 9,
        max_open: 10,
    }));

    let report = dashboard.report().await;
    assert_eq!(report.connection_efficiency, Some(90.0));
    assert_eq!(report.score_breakdown.connection_penalty, 15.0);
    assert_eq!(report.health_score, 85.0);
    assert_eq!(report.status, HealthStatus::Healthy);

    let alert = report
        .alerts
        .iter()
        .find(|a| a.category == AlertCategory::Connection)
        .expect("connection alert");
    assert_eq!(alert.severity, AlertSeverity::Warning);
    assert!(report.section_errors.is_empty());
}

#[tokio::test]
async fn missing_sections_are_reported_not_scored() {
    let store = Arc::new(MemoryStore::new());
    store.set_offline(true);
    let cache = Arc::new(QueryCache::new(store, &CacheConfig::default()));
    for id in 0..10 {
        let miss: Option<i64> = cache.get("SELECT * FROM users WHERE id = $1", &[id]).await;
        assert!(miss.is_none());
    }
    assert_eq!(cache.stats().misses, 10);
    let dashboard = PerformanceDashboard::new(monitor()).with_cache(cache);

    let report = dashboard.report().await;
    let sections: Vec<&str> = report
        .section_errors
        .iter()
        .map(|e| e.section.as_str())
        .collect();
    assert!(sections.contains(&"connections"));
    assert!(sections.contains(&"cache"));
    assert_eq!(report.score_breakdown.cache_penalty, 0.0);
    assert!(report.metrics.cache.is_none());
    assert!(report.alerts.iter().all(|a| a.category != AlertCategory::Cache));
    assert_eq!(report.health_score, 100.0);
    assert!(report.to_text().contains("cache"));
}
