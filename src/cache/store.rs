use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::PerfError;

/// Minimal key-value surface the query cache needs from its backend.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, PerfError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PerfError>;

    /// Replace the value of a live key, keeping its TTL. Returns false if the key is gone.
    async fn overwrite(&self, key: &str, value: &str) -> Result<bool, PerfError>;

    /// Add `member` to the set at `key` and (re)arm the set's TTL.
    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<(), PerfError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, PerfError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, PerfError>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PerfError>;

    async fn ping(&self) -> Result<(), PerfError>;
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process store with lazy expiry, used in tests and when no Redis URL is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
    offline: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate backend unavailability: every call fails while offline.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<(), PerfError> {
        if *self.offline.lock() {
            Err(PerfError::Cache("memory store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, PerfError> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.is_live(now) => match &slot.value {
                Value::Text(text) => Ok(Some(text.clone())),
                Value::Set(_) => Err(PerfError::Cache(format!("{key} holds a set"))),
            },
            Some(_) => {
                slots.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PerfError> {
        self.check_online()?;
        self.slots.lock().insert(
            key.to_string(),
            Slot {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn overwrite(&self, key: &str, value: &str) -> Result<bool, PerfError> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();
        match slots.get_mut(key) {
            Some(slot) if slot.is_live(now) => {
                slot.value = Value::Text(value.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<(), PerfError> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(key.to_string())
            .and_modify(|slot| {
                if !slot.is_live(now) {
                    slot.value = Value::Set(HashSet::new());
                }
            })
            .or_insert_with(|| Slot {
                value: Value::Set(HashSet::new()),
                expires_at: None,
            });
        match &mut slot.value {
            Value::Set(members) => {
                members.insert(member.to_string());
            }
            Value::Text(_) => return Err(PerfError::Cache(format!("{key} holds a string"))),
        }
        slot.expires_at = Some(now + ttl);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, PerfError> {
        self.check_online()?;
        let now = Instant::now();
        let slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.is_live(now) => match &slot.value {
                Value::Set(members) => Ok(members.iter().cloned().collect()),
                Value::Text(_) => Err(PerfError::Cache(format!("{key} holds a string"))),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, PerfError> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let mut removed = 0;
        for key in keys {
            if let Some(slot) = slots.remove(key) {
                if slot.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PerfError> {
        self.check_online()?;
        let now = Instant::now();
        Ok(self
            .slots
            .lock()
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && slot.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), PerfError> {
        self.check_online()
    }
}
