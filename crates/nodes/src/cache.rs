//! Key-value cache with TTL.
//!
//! Used by the API proxy to cache GET responses. The trait is the seam for a
//! shared cache service; [`MemoryCache`] is the in-process implementation.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;

    async fn set(&self, key: &str, value: Value, ttl: Duration);

    async fn delete(&self, key: &str);
}

/// Concurrent in-process cache. Expired entries are dropped lazily on read.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (Value, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Some(entry.0.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) {
        self.entries
            .insert(key.to_owned(), (value, Instant::now() + ttl));
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = MemoryCache::new();
        cache.set("k", json!({ "v": 1 }), Duration::from_secs(10)).await;
        assert_eq!(cache.get("k").await, Some(json!({ "v": 1 })));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty());
    }
}
