//! Key-value storage port.
//!
//! The real deployment talks to an external TTL-keyed blob store; everything
//! in this crate goes through the [`KvStore`] trait so the engine stays
//! storage-agnostic. [`MemoryStore`] backs local runs and tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::catalog::Service;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
}

/// TTL-keyed blob store with a compare-and-set primitive.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Writes `value` only if the current value still equals `expected`
    /// (`None` meaning the key must be absent). Returns whether the write
    /// happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

pub fn credential_key(service: Service, user_id: i64) -> String {
    format!("credential:{}:{}", service, user_id)
}

pub fn playlist_cache_key(service: Service, resolved_id: &str) -> String {
    format!("cache:{}_playlist:{}", service, resolved_id)
}

pub fn report_key(chat_id: i64) -> String {
    format!("report:{}", chat_id)
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process [`KvStore`] with per-key TTL. Expired entries are dropped
/// lazily on access.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
    let now = Instant::now();
    match entries.get(key) {
        Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
        Some(_) => {
            entries.remove(key);
            None
        }
        None => None,
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        Ok(live_value(&mut entries, key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        let current = live_value(&mut entries, key);
        if current.as_deref() != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }
}
