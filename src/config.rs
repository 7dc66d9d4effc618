use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "/config/pgperf.yaml";

/// Top-level configuration for the performance layer.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "AppConfig::default_name")]
    pub name: String,
    /// Primary DSN. Only ever populated from `PGPERF_DSN`.
    #[serde(default)]
    pub dsn: String,
    /// Read replica DSNs. Only ever populated from `PGPERF_REPLICA_DSNS`.
    #[serde(default)]
    pub replica_dsns: Vec<String>,
    /// Redis URL. Only ever populated from `PGPERF_REDIS_URL`.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub indexes: IndexConfig,
    #[serde(default)]
    pub migrations: MigrationConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl AppConfig {
    fn default_name() -> String {
        "local".into()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            dsn: String::new(),
            replica_dsns: Vec::new(),
            redis_url: None,
            pool: PoolConfig::default(),
            monitor: MonitorConfig::default(),
            cache: CacheConfig::default(),
            indexes: IndexConfig::default(),
            migrations: MigrationConfig::default(),
            dashboard: DashboardConfig::default(),
            http: HttpConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

/// How reads are spread over replicas.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPolicy {
    #[default]
    RoundRobin,
    Random,
    /// Send each read to the replica with the fewest connections in use.
    /// Ties rotate with the round-robin cursor.
    Auto,
}

/// Pool sizing policy applied to the primary and every replica.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "PoolConfig::default_max_open")]
    pub max_open: u32,
    #[serde(default = "PoolConfig::default_max_idle")]
    pub max_idle: u32,
    #[serde(
        default = "PoolConfig::default_conn_max_lifetime",
        with = "humantime_serde"
    )]
    pub conn_max_lifetime: Duration,
    #[serde(
        default = "PoolConfig::default_conn_max_idle_time",
        with = "humantime_serde"
    )]
    pub conn_max_idle_time: Duration,
    #[serde(
        default = "PoolConfig::default_acquire_timeout",
        with = "humantime_serde"
    )]
    pub acquire_timeout: Duration,
    /// Pool statistics sampling interval.
    #[serde(
        default = "PoolConfig::default_stats_interval",
        with = "humantime_serde"
    )]
    pub stats_interval: Duration,
    #[serde(default)]
    pub replica_policy: ReplicaPolicy,
}

impl PoolConfig {
    const fn default_max_open() -> u32 {
        100
    }

    const fn default_max_idle() -> u32 {
        25
    }

    const fn default_conn_max_lifetime() -> Duration {
        Duration::from_secs(30 * 60)
    }

    const fn default_conn_max_idle_time() -> Duration {
        Duration::from_secs(5 * 60)
    }

    const fn default_acquire_timeout() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_stats_interval() -> Duration {
        Duration::from_secs(15)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: Self::default_max_open(),
            max_idle: Self::default_max_idle(),
            conn_max_lifetime: Self::default_conn_max_lifetime(),
            conn_max_idle_time: Self::default_conn_max_idle_time(),
            acquire_timeout: Self::default_acquire_timeout(),
            stats_interval: Self::default_stats_interval(),
            replica_policy: ReplicaPolicy::default(),
        }
    }
}

/// Statement monitoring thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(
        default = "MonitorConfig::default_slow_query_threshold",
        with = "humantime_serde"
    )]
    pub slow_query_threshold: Duration,
    #[serde(default = "MonitorConfig::default_slow_log_capacity")]
    pub slow_log_capacity: usize,
    #[serde(default = "MonitorConfig::default_top_patterns")]
    pub top_patterns: usize,
}

impl MonitorConfig {
    const fn default_slow_query_threshold() -> Duration {
        Duration::from_millis(50)
    }

    const fn default_slow_log_capacity() -> usize {
        1_000
    }

    const fn default_top_patterns() -> usize {
        10
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: Self::default_slow_query_threshold(),
            slow_log_capacity: Self::default_slow_log_capacity(),
            top_patterns: Self::default_top_patterns(),
        }
    }
}

/// Query result cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_prefix")]
    pub prefix: String,
    #[serde(default = "CacheConfig::default_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Extra lifetime given to tag index sets beyond the entry TTL.
    #[serde(default = "CacheConfig::default_tag_ttl_grace", with = "humantime_serde")]
    pub tag_ttl_grace: Duration,
    /// Upper bound for a single round trip to the cache store.
    #[serde(default = "CacheConfig::default_op_timeout", with = "humantime_serde")]
    pub op_timeout: Duration,
}

impl CacheConfig {
    fn default_prefix() -> String {
        "pgperf:qc".to_string()
    }

    const fn default_ttl() -> Duration {
        Duration::from_secs(5 * 60)
    }

    const fn default_tag_ttl_grace() -> Duration {
        Duration::from_secs(60)
    }

    const fn default_op_timeout() -> Duration {
        Duration::from_millis(250)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: Self::default_prefix(),
            default_ttl: Self::default_ttl(),
            tag_ttl_grace: Self::default_tag_ttl_grace(),
            op_timeout: Self::default_op_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Indexes scanned fewer times than this are reported as unused.
    #[serde(default = "IndexConfig::default_unused_scan_threshold")]
    pub unused_scan_threshold: i64,
    #[serde(
        default = "IndexConfig::default_catalog_timeout",
        with = "humantime_serde"
    )]
    pub catalog_timeout: Duration,
    /// Upper bound for a single non-blocking index build.
    #[serde(
        default = "IndexConfig::default_build_timeout",
        with = "humantime_serde"
    )]
    pub build_timeout: Duration,
}

impl IndexConfig {
    const fn default_unused_scan_threshold() -> i64 {
        10
    }

    const fn default_catalog_timeout() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_build_timeout() -> Duration {
        Duration::from_secs(30 * 60)
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            unused_scan_threshold: Self::default_unused_scan_threshold(),
            catalog_timeout: Self::default_catalog_timeout(),
            build_timeout: Self::default_build_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Upper bound for each statement or phase of a migration.
    #[serde(
        default = "MigrationConfig::default_statement_timeout",
        with = "humantime_serde"
    )]
    pub statement_timeout: Duration,
}

impl MigrationConfig {
    const fn default_statement_timeout() -> Duration {
        Duration::from_secs(15 * 60)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            statement_timeout: Self::default_statement_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "DashboardConfig::default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl DashboardConfig {
    const fn default_interval() -> Duration {
        Duration::from_secs(60)
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            interval: Self::default_interval(),
        }
    }
}

/// HTTP listener configuration (bind address).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_bind")]
    pub bind: String,
}

impl HttpConfig {
    fn default_bind() -> String {
        "0.0.0.0:8282".to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    #[serde(default = "Timeouts::default_ping", with = "humantime_serde")]
    pub ping: Duration,
}

impl Timeouts {
    const fn default_ping() -> Duration {
        Duration::from_secs(2)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ping: Self::default_ping(),
        }
    }
}

/// Load configuration from YAML disk file, falling back to defaults + env overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("PGPERF_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    enforce_yaml_policy(&config)?;
    apply_env_overrides(&mut config)?;
    validate(&config)?;
    Ok(config)
}

/// Parse a YAML document into a configuration without touching the environment.
pub fn parse_yaml(raw: &str) -> Result<AppConfig> {
    let config: AppConfig = serde_yaml::from_str(raw).context("failed to parse YAML config")?;
    enforce_yaml_policy(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let cfg = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse YAML config at {}", path.display()))?;
            Ok(Some(cfg))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

fn enforce_yaml_policy(config: &AppConfig) -> Result<()> {
    if !config.dsn.trim().is_empty() || !config.replica_dsns.is_empty() {
        bail!(
            "Remove connection strings from the YAML config; set PGPERF_DSN and PGPERF_REPLICA_DSNS in the environment instead."
        );
    }
    if config.redis_url.is_some() {
        bail!("Remove `redis_url` from the YAML config; set PGPERF_REDIS_URL instead.");
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(name) = env::var("PGPERF_NAME") {
        if !name.is_empty() {
            config.name = name;
        }
    }

    match env::var("PGPERF_DSN") {
        Ok(dsn) => {
            if dsn.trim().is_empty() {
                bail!("Environment variable PGPERF_DSN is set but empty.");
            }
            config.dsn = dsn;
        }
        Err(env::VarError::NotPresent) => {}
        Err(err) => return Err(err.into()),
    };

    if let Ok(replicas) = env::var("PGPERF_REPLICA_DSNS") {
        config.replica_dsns = split_dsn_list(&replicas);
    }

    if let Ok(url) = env::var("PGPERF_REDIS_URL") {
        if !url.trim().is_empty() {
            config.redis_url = Some(url);
        }
    }

    Ok(())
}

fn split_dsn_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|dsn| !dsn.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.dsn.trim().is_empty() {
        bail!("Missing Postgres DSN. Set the PGPERF_DSN environment variable.");
    }
    if config.pool.max_open == 0 {
        bail!("pool.max_open must be greater than zero");
    }
    if config.pool.max_idle > config.pool.max_open {
        bail!(
            "pool.max_idle ({}) exceeds pool.max_open ({})",
            config.pool.max_idle,
            config.pool.max_open
        );
    }
    if config.monitor.slow_log_capacity == 0 {
        bail!("monitor.slow_log_capacity must be greater than zero");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pool_policy() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.pool.max_open, 100);
        assert_eq!(cfg.pool.max_idle, 25);
        assert_eq!(cfg.pool.conn_max_lifetime, Duration::from_secs(1800));
        assert_eq!(cfg.pool.conn_max_idle_time, Duration::from_secs(300));
        assert_eq!(cfg.monitor.slow_query_threshold, Duration::from_millis(50));
        assert_eq!(cfg.monitor.slow_log_capacity, 1_000);
        assert_eq!(cfg.indexes.unused_scan_threshold, 10);
    }

    #[test]
    fn yaml_overrides_use_humantime() {
        let cfg = parse_yaml(
            r#"
name: recipes
pool:
  max_open: 40
  conn_max_lifetime: 10m
  replica_policy: auto
monitor:
  slow_query_threshold: 100ms
cache:
  default_ttl: 2m
"#,
        )
        .expect("config");
        assert_eq!(cfg.name, "recipes");
        assert_eq!(cfg.pool.max_open, 40);
        assert_eq!(cfg.pool.max_idle, 25);
        assert_eq!(cfg.pool.conn_max_lifetime, Duration::from_secs(600));
        assert_eq!(cfg.pool.replica_policy, ReplicaPolicy::Auto);
        assert_eq!(cfg.monitor.slow_query_threshold, Duration::from_millis(100));
        assert_eq!(cfg.cache.default_ttl, Duration::from_secs(120));
    }

    #[test]
    fn yaml_must_not_carry_secrets() {
        assert!(parse_yaml("dsn: postgres://u:p@localhost/db\n").is_err());
        assert!(parse_yaml("redis_url: redis://localhost\n").is_err());
    }

    #[test]
    fn replica_list_splits_and_trims() {
        assert_eq!(
            split_dsn_list(" postgres://a , ,postgres://b"),
            vec!["postgres://a".to_string(), "postgres://b".to_string()]
        );
    }

    #[test]
    fn idle_ceiling_cannot_exceed_open() {
        let mut cfg = AppConfig::default();
        cfg.dsn = "postgres://localhost/db".into();
        cfg.pool.max_open = 10;
        cfg.pool.max_idle = 20;
        assert!(validate(&cfg).is_err());
    }
}
