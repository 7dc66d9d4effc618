use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{QueryCache, RedisStore};
use crate::catalog::PgCatalog;
use crate::config::AppConfig;
use crate::dashboard::PerformanceDashboard;
use crate::db::ConnectionManager;
use crate::error::PerfError;
use crate::index::IndexOptimizer;
use crate::metrics::AppMetrics;
use crate::migration::MigrationOptimizer;
use crate::monitor::QueryMonitor;

/// Every performance component, built once by the entry point and shared with handlers.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub metrics: AppMetrics,
    pub connections: Arc<ConnectionManager>,
    pub monitor: Arc<QueryMonitor>,
    pub cache: Option<Arc<QueryCache>>,
    pub catalog: Arc<PgCatalog>,
    pub indexes: Arc<IndexOptimizer>,
    pub migrations: Arc<MigrationOptimizer>,
    pub dashboard: Arc<PerformanceDashboard>,
    shutdown: CancellationToken,
}

impl AppContext {
    /// Connect to Postgres (fatal on failure) and Redis (cache disabled on failure).
    pub async fn build(config: AppConfig) -> Result<Self> {
        let metrics = AppMetrics::new()?;
        let connections = ConnectionManager::connect(&config, metrics.clone())
            .await
            .context("failed to connect to the primary database")?;

        let monitor = Arc::new(QueryMonitor::new(&config.monitor).with_metrics(metrics.clone()));

        let cache = match &config.redis_url {
            Some(url) => match RedisStore::connect(url, config.timeouts.ping).await {
                Ok(store) => Some(Arc::new(
                    QueryCache::new(Arc::new(store), &config.cache).with_metrics(metrics.clone()),
                )),
                Err(err) => {
                    warn!(error = %err, "Redis unavailable; query cache disabled");
                    None
                }
            },
            None => {
                info!("PGPERF_REDIS_URL not set; query cache disabled");
                None
            }
        };

        let catalog = Arc::new(PgCatalog::new(connections.primary().clone()));
        let indexes = Arc::new(IndexOptimizer::new(
            catalog.clone(),
            catalog.clone(),
            &config.indexes,
        ));
        let migrations = Arc::new(MigrationOptimizer::new(
            catalog.clone(),
            &config.migrations,
            config.indexes.catalog_timeout,
        ));

        let mut dashboard = PerformanceDashboard::new(monitor.clone())
            .with_pools(connections.clone())
            .with_indexes(indexes.clone())
            .with_metrics(metrics.clone());
        if let Some(cache) = &cache {
            dashboard = dashboard.with_cache(cache.clone());
        }

        Ok(Self {
            config: Arc::new(config),
            metrics,
            connections,
            monitor,
            cache,
            catalog,
            indexes,
            migrations,
            dashboard: Arc::new(dashboard),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the pool collector and the dashboard loop.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.connections.spawn_collector(&self.shutdown);
        let dashboard = self
            .dashboard
            .start_monitoring(self.config.dashboard.interval, self.shutdown.child_token());
        vec![dashboard]
    }

    /// Cancel background work, wait for it, then close the pools.
    pub async fn stop(&self, handles: Vec<JoinHandle<()>>) {
        self.shutdown.cancel();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = ?err, "background task ended abnormally");
            }
        }
        self.connections.close().await;
    }

    /// Run a statement on the pool its kind routes to, monitoring it and invalidating
    /// cached reads of every table a write touches.
    pub async fn execute(&self, statement: &str) -> Result<u64, PerfError> {
        let pool = self.connections.pool_for(statement);
        let rows = self
            .monitor
            .observe(statement, async {
                sqlx::query(statement)
                    .execute(pool)
                    .await
                    .map(|done| done.rows_affected())
                    .map_err(|err| PerfError::query(statement, err))
            })
            .await?;

        if let Some(cache) = &self.cache {
            if let Err(err) = cache.invalidate_for_statement(statement).await {
                warn!(error = %err, "cache invalidation after write failed");
            }
        }
        Ok(rows)
    }
}
