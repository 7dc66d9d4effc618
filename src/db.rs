use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, PoolConfig, ReplicaPolicy};
use crate::error::{PerfError, with_timeout};
use crate::metrics::AppMetrics;
use crate::sql;

pub const COLLECTOR_LOOP: &str = "pool_stats";

/// Acquires slower than this count as a wait.
const WAIT_THRESHOLD: Duration = Duration::from_millis(1);

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PoolSnapshot {
    pub max_open: u32,
    pub open_connections: u32,
    pub idle: u32,
    pub in_use: u32,
    pub wait_count: u64,
    pub wait_duration_ms: f64,
    pub max_lifetime_closed: u64,
    pub max_idle_time_closed: u64,
}

impl PoolSnapshot {
    /// Share of the pool ceiling currently checked out, in percent.
    pub fn efficiency(&self) -> f64 {
        if self.max_open == 0 {
            return 0.0;
        }
        (self.in_use as f64 * 100.0 / self.max_open as f64).clamp(0.0, 100.0)
    }

    pub fn average_wait_ms(&self) -> f64 {
        if self.wait_count == 0 {
            0.0
        } else {
            self.wait_duration_ms / self.wait_count as f64
        }
    }

    fn merge(&mut self, other: &PoolSnapshot) {
        self.max_open += other.max_open;
        self.open_connections += other.open_connections;
        self.idle += other.idle;
        self.in_use += other.in_use;
        self.wait_count += other.wait_count;
        self.wait_duration_ms += other.wait_duration_ms;
        self.max_lifetime_closed += other.max_lifetime_closed;
        self.max_idle_time_closed += other.max_idle_time_closed;
    }
}

/// Counters fed by the pool hooks and the acquire wrapper.
#[derive(Debug, Default)]
struct PoolCounters {
    wait_count: AtomicU64,
    wait_micros: AtomicU64,
    closed_lifetime: AtomicU64,
    closed_idle: AtomicU64,
}

/// Handle the release hook uses to read the pool's own idle count.
///
/// Set once the pool is built and cleared on close, which breaks the
/// pool -> hook -> pool reference cycle.
#[derive(Default)]
struct IdleGauge(Mutex<Option<PgPool>>);

impl IdleGauge {
    fn attach(&self, pool: &PgPool) {
        *self.0.lock() = Some(pool.clone());
    }

    fn detach(&self) {
        self.0.lock().take();
    }

    fn idle(&self) -> usize {
        self.0.lock().as_ref().map_or(0, PgPool::num_idle)
    }
}

/// Decide whether a connection coming back from use may stay in the pool.
///
/// `idle_now` excludes the connection being released. Concurrent releases can
/// overshoot `max_idle` by the number of racing returns.
fn keep_after_release(
    counters: &PoolCounters,
    age: Duration,
    max_lifetime: Duration,
    max_idle: u32,
    idle_now: usize,
) -> bool {
    if age >= max_lifetime {
        counters.closed_lifetime.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    if idle_now >= max_idle as usize {
        counters.closed_idle.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    true
}

/// Decide whether an idle connection may be handed out.
fn keep_before_acquire(
    counters: &PoolCounters,
    age: Duration,
    idle_for: Duration,
    max_lifetime: Duration,
    max_idle_time: Duration,
) -> bool {
    if age >= max_lifetime {
        counters.closed_lifetime.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    if idle_for >= max_idle_time {
        counters.closed_idle.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    true
}

/// A pool plus the counters its hooks maintain.
pub struct InstrumentedPool {
    name: String,
    pool: PgPool,
    counters: Arc<PoolCounters>,
    idle_gauge: Arc<IdleGauge>,
    max_open: u32,
}

impl InstrumentedPool {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let open = self.pool.size();
        let idle = (self.pool.num_idle() as u32).min(open);
        PoolSnapshot {
            max_open: self.max_open,
            open_connections: open,
            idle,
            in_use: open - idle,
            wait_count: self.counters.wait_count.load(Ordering::Relaxed),
            wait_duration_ms: self.counters.wait_micros.load(Ordering::Relaxed) as f64 / 1_000.0,
            max_lifetime_closed: self.counters.closed_lifetime.load(Ordering::Relaxed),
            max_idle_time_closed: self.counters.closed_idle.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) {
        self.idle_gauge.detach();
        self.pool.close().await;
    }

    async fn acquire(&self) -> Result<PoolConnection<Postgres>, PerfError> {
        let started = Instant::now();
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| PerfError::Connection(format!("{}: {err}", self.name)))?;
        let waited = started.elapsed();
        if waited > WAIT_THRESHOLD {
            self.counters.wait_count.fetch_add(1, Ordering::Relaxed);
            self.counters
                .wait_micros
                .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        }
        Ok(conn)
    }

    async fn ping(&self, limit: Duration) -> Result<Duration, PerfError> {
        let started = Instant::now();
        with_timeout(&format!("ping {}", self.name), limit, async {
            let mut conn = self.acquire().await?;
            sqlx::query("SELECT 1")
                .execute(&mut *conn)
                .await
                .map_err(|err| PerfError::Connection(format!("{}: {err}", self.name)))?;
            Ok(())
        })
        .await?;
        Ok(started.elapsed())
    }
}

/// Build a pool with the sizing policy and lifetime hooks installed.
async fn create_pool(
    name: &str,
    dsn: &str,
    policy: &PoolConfig,
    read_only: bool,
) -> Result<InstrumentedPool, PerfError> {
    let connect_options = PgConnectOptions::from_str(dsn)
        .map_err(|err| PerfError::Config(format!("invalid DSN for {name}: {err}")))?
        .application_name("pgperf");

    let counters = Arc::new(PoolCounters::default());
    let max_lifetime = policy.conn_max_lifetime;
    let max_idle_time = policy.conn_max_idle_time;
    let max_idle = policy.max_idle;

    let idle_gauge = Arc::new(IdleGauge::default());

    let release_counters = counters.clone();
    let release_gauge = idle_gauge.clone();
    let acquire_counters = counters.clone();

    // Lifetime and idle limits are enforced by the hooks below so that every
    // closure is counted; sqlx's own reaper stays disabled.
    let pool = PgPoolOptions::new()
        .max_connections(policy.max_open)
        .min_connections(0)
        .acquire_timeout(policy.acquire_timeout)
        .max_lifetime(None::<Duration>)
        .idle_timeout(None::<Duration>)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if read_only {
                    sqlx::query("SET default_transaction_read_only = on")
                        .execute(&mut *conn)
                        .await
                        .map_err(|err| {
                            error!(error = ?err, "failed to enforce read-only replica session");
                            err
                        })?;
                }
                Ok(())
            })
        })
        .before_acquire(move |_conn, meta| {
            let keep = keep_before_acquire(
                &acquire_counters,
                meta.age,
                meta.idle_for,
                max_lifetime,
                max_idle_time,
            );
            Box::pin(async move { Ok(keep) })
        })
        .after_release(move |_conn, meta| {
            let keep = keep_after_release(
                &release_counters,
                meta.age,
                max_lifetime,
                max_idle,
                release_gauge.idle(),
            );
            Box::pin(async move { Ok(keep) })
        })
        .connect_with(connect_options)
        .await
        .map_err(|err| PerfError::Connection(format!("failed to connect to {name}: {err}")))?;
    idle_gauge.attach(&pool);

    Ok(InstrumentedPool {
        name: name.to_string(),
        pool,
        counters,
        idle_gauge,
        max_open: policy.max_open,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaHealth {
    pub name: String,
    pub healthy: bool,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub primary_latency_ms: f64,
    pub replicas: Vec<ReplicaHealth>,
}

/// Pick a replica slot for a read.
fn pick_replica(policy: ReplicaPolicy, cursor: usize, in_use: &[u32]) -> usize {
    let len = in_use.len();
    debug_assert!(len > 0);
    match policy {
        ReplicaPolicy::RoundRobin => cursor % len,
        ReplicaPolicy::Random => rand::thread_rng().gen_range(0..len),
        ReplicaPolicy::Auto => in_use
            .iter()
            .enumerate()
            .min_by_key(|(idx, load)| (**load, (*idx + len - cursor % len) % len))
            .map(|(idx, _)| idx)
            .unwrap_or(0),
    }
}

/// Locking reads must see the primary.
fn needs_primary(statement: &str) -> bool {
    if !sql::statement_kind(statement).is_read() {
        return true;
    }
    let lower = sql::normalize(statement);
    lower.contains(" for update") || lower.contains(" for share") || lower.contains("nextval(")
}

/// Owns the primary and replica pools.
pub struct ConnectionManager {
    primary: InstrumentedPool,
    replicas: Vec<InstrumentedPool>,
    policy: ReplicaPolicy,
    cursor: AtomicUsize,
    ping_timeout: Duration,
    stats_interval: Duration,
    metrics: AppMetrics,
    latest: Mutex<Option<PoolSnapshot>>,
    collector: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ConnectionManager {
    /// Connect the primary (fatal on failure) and every reachable replica.
    pub async fn connect(config: &AppConfig, metrics: AppMetrics) -> Result<Arc<Self>, PerfError> {
        let primary = create_pool("primary", &config.dsn, &config.pool, false).await?;
        primary.ping(config.timeouts.ping).await.map_err(|err| {
            PerfError::Connection(format!("primary unreachable at startup: {err}"))
        })?;

        let mut replicas = Vec::with_capacity(config.replica_dsns.len());
        for (idx, dsn) in config.replica_dsns.iter().enumerate() {
            let name = format!("replica-{idx}");
            match create_pool(&name, dsn, &config.pool, true).await {
                Ok(pool) => replicas.push(pool),
                Err(err) => warn!(replica = %name, error = %err, "replica unavailable; reads fall back to primary"),
            }
        }

        info!(
            name = %config.name,
            replicas = replicas.len(),
            max_open = config.pool.max_open,
            "connected to primary"
        );

        Ok(Arc::new(Self {
            primary,
            replicas,
            policy: config.pool.replica_policy,
            cursor: AtomicUsize::new(0),
            ping_timeout: config.timeouts.ping,
            stats_interval: config.pool.stats_interval,
            metrics,
            latest: Mutex::new(None),
            collector: Mutex::new(None),
        }))
    }

    /// Shared handle to the primary pool.
    pub fn primary(&self) -> &PgPool {
        self.primary.pool()
    }

    /// Pool for an explicit read, chosen by the replica policy.
    pub fn reader(&self) -> &PgPool {
        if self.replicas.is_empty() {
            return self.primary.pool();
        }
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        let loads: Vec<u32> = self
            .replicas
            .iter()
            .map(|replica| replica.snapshot().in_use)
            .collect();
        let idx = pick_replica(self.policy, cursor, &loads);
        self.replicas[idx].pool()
    }

    /// Pool for `statement`: writes and locking reads go to the primary.
    pub fn pool_for(&self, statement: &str) -> &PgPool {
        if needs_primary(statement) {
            self.primary.pool()
        } else {
            self.reader()
        }
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Acquire a primary connection, timing any wait.
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>, PerfError> {
        self.primary.acquire().await
    }

    /// Ping the primary (errors propagate) and replicas (errors are logged).
    pub async fn health_check(&self) -> Result<HealthReport, PerfError> {
        let primary_latency = self.primary.ping(self.ping_timeout).await?;

        let mut replicas = Vec::with_capacity(self.replicas.len());
        for replica in &self.replicas {
            match replica.ping(self.ping_timeout).await {
                Ok(latency) => replicas.push(ReplicaHealth {
                    name: replica.name().to_string(),
                    healthy: true,
                    latency_ms: Some(latency.as_secs_f64() * 1_000.0),
                    error: None,
                }),
                Err(err) => {
                    warn!(replica = replica.name(), error = %err, "replica health check failed");
                    replicas.push(ReplicaHealth {
                        name: replica.name().to_string(),
                        healthy: false,
                        latency_ms: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        Ok(HealthReport {
            checked_at: Utc::now(),
            primary_latency_ms: primary_latency.as_secs_f64() * 1_000.0,
            replicas,
        })
    }

    /// Primary pool statistics sampled right now.
    pub fn primary_snapshot(&self) -> PoolSnapshot {
        self.primary.snapshot()
    }

    /// Latest collector sample across all pools, or a live sample before the first tick.
    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.latest
            .lock()
            .clone()
            .unwrap_or_else(|| self.sample_all())
    }

    fn sample_all(&self) -> PoolSnapshot {
        let mut total = self.primary.snapshot();
        self.metrics.set_pool_snapshot(self.primary.name(), &total);
        for replica in &self.replicas {
            let snapshot = replica.snapshot();
            self.metrics.set_pool_snapshot(replica.name(), &snapshot);
            total.merge(&snapshot);
        }
        total
    }

    /// Start the background pool-stat collector. It stops on `shutdown` or [`Self::close`].
    pub fn spawn_collector(self: &Arc<Self>, shutdown: &CancellationToken) {
        let token = shutdown.child_token();
        let manager = Arc::clone(self);
        let loop_token = token.clone();
        let interval = self.stats_interval;

        let handle = tokio::spawn(async move {
            info!(loop_name = COLLECTOR_LOOP, interval = ?interval, "starting collector loop");
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        let snapshot = manager.sample_all();
                        debug!(
                            open = snapshot.open_connections,
                            in_use = snapshot.in_use,
                            efficiency = snapshot.efficiency(),
                            "sampled pool statistics"
                        );
                        *manager.latest.lock() = Some(snapshot);
                        manager.metrics.observe_loop(COLLECTOR_LOOP, started.elapsed(), true);
                    }
                }
            }
            info!(loop_name = COLLECTOR_LOOP, "collector loop stopped");
        });

        if let Some((old_token, old_handle)) = self.collector.lock().replace((token, handle)) {
            old_token.cancel();
            old_handle.abort();
        }
    }

    /// Stop the collector and close every pool.
    pub async fn close(&self) {
        let collector = self.collector.lock().take();
        if let Some((token, handle)) = collector {
            token.cancel();
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = ?err, "collector task ended abnormally");
                }
            }
        }
        for replica in &self.replicas {
            replica.close().await;
        }
        self.primary.close().await;
        info!("connection pools closed");
    }
}
