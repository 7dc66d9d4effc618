//! Redis backend for the query cache.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use super::store::CacheStore;
use crate::error::{PerfError, with_timeout};

const SCAN_BATCH: usize = 500;

pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server answers PING within `connect_timeout`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, PerfError> {
        let client = Client::open(url)
            .map_err(|e| PerfError::Cache(format!("invalid Redis URL: {e}")))?;
        let manager = with_timeout("redis connect", connect_timeout, async {
            ConnectionManager::new(client)
                .await
                .map_err(|e| PerfError::Cache(format!("failed to connect to Redis: {e}")))
        })
        .await?;
        let store = Self { manager };
        with_timeout("redis ping", connect_timeout, store.ping()).await?;
        info!("connected to Redis cache backend");
        Ok(store)
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, PerfError> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PerfError> {
        let mut conn = self.conn();
        let _: () = conn.set_ex(key, value, ttl_seconds(ttl)).await?;
        Ok(())
    }

    async fn overwrite(&self, key: &str, value: &str) -> Result<bool, PerfError> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<(), PerfError> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .sadd(key, member)
            .ignore()
            .expire(key, ttl_seconds(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, PerfError> {
        let mut conn = self.conn();
        Ok(conn.smembers(key).await?)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, PerfError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let removed: u64 = conn.del(keys).await?;
        debug!(requested = keys.len(), removed, "deleted cache keys");
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PerfError> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), PerfError> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(PerfError::Cache(format!("unexpected PING reply: {pong}")))
        }
    }
}
