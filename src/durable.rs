//! Durable cache tier
//!
//! Best-effort persistence for cache entries so they survive restarts and
//! can be shared between sessions. Never a system of record: concurrent
//! writers are last-write-wins and every failure is absorbed by the cache.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::DurableError;

/// String key/value store backing the durable tier.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, DurableError>;

    /// Store `value`; the store may drop it once `ttl` has passed.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DurableError>;

    /// Remove `key`. Returns whether it was present.
    async fn delete(&self, key: &str) -> Result<bool, DurableError>;

    /// All keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, DurableError>;
}

/// Redis-backed durable tier.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn new(redis_client: redis::Client) -> Result<Self, redis::RedisError> {
        let conn = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self { conn })
    }

    pub fn from_manager(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DurableError> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DurableError> {
        let mut conn = self.conn.clone();
        // SETEX rejects a zero expiry
        let ttl_seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, DurableError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, DurableError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", glob_escape(prefix));
        let mut cursor = 0u64;
        let mut keys = Vec::new();
        loop {
            let (next, batch) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// Process-local durable tier, for tests and memory-only deployments.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>, DurableError> {
        self.entries
            .lock()
            .map_err(|_| DurableError::Unavailable("memory store lock poisoned".to_owned()))
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DurableError> {
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DurableError> {
        self.lock()?
            .insert(key.to_owned(), (value.to_owned(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, DurableError> {
        Ok(self.lock()?.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, DurableError> {
        let mut keys: Vec<String> = self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_escape() {
        assert_eq!(glob_escape("qcache:"), "qcache:");
        assert_eq!(glob_escape("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_prefix_scan() {
        let store = MemoryStore::new();
        store.set("q:a", "1", Duration::from_secs(60)).await.unwrap();
        store.set("q:b", "2", Duration::from_secs(60)).await.unwrap();
        store.set("other", "3", Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get("q:a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.keys("q:").await.unwrap(), vec!["q:a", "q:b"]);

        assert!(store.delete("q:a").await.unwrap());
        assert!(!store.delete("q:a").await.unwrap());
        assert_eq!(store.get("q:a").await.unwrap(), None);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_expires_entries() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }
}
