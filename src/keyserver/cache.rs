//! Read-through cache for public key lookups.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::keys::PublicKey;

/// Pluggable cache backend for `(issuer, kid)` lookups.
#[async_trait]
pub trait KeyCache: Send + Sync {
    async fn get(&self, issuer: &str, kid: &str) -> Option<PublicKey>;
    async fn set(&self, issuer: &str, kid: &str, key: PublicKey);
    async fn stop(&self);
}

struct CachedKey {
    key: PublicKey,
    cached_at: Instant,
}

impl CachedKey {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// Default in-memory backend: LRU with a fixed entry TTL.
pub struct InMemoryKeyCache {
    entries: Mutex<LruCache<(String, String), CachedKey>>,
    ttl: Duration,
}

impl InMemoryKeyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(128).unwrap());
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }
}

impl Default for InMemoryKeyCache {
    fn default() -> Self {
        Self::new(128, Duration::from_secs(300))
    }
}

#[async_trait]
impl KeyCache for InMemoryKeyCache {
    async fn get(&self, issuer: &str, kid: &str) -> Option<PublicKey> {
        let lookup = (issuer.to_string(), kid.to_string());
        let mut entries = self.entries.lock().await;
        match entries.get(&lookup) {
            Some(cached) if cached.is_expired(self.ttl) => {
                debug!(issuer, kid, "cached key expired");
                entries.pop(&lookup);
                None
            }
            Some(cached) => Some(cached.key.clone()),
            None => None,
        }
    }

    async fn set(&self, issuer: &str, kid: &str, key: PublicKey) {
        let mut entries = self.entries.lock().await;
        entries.put(
            (issuer.to_string(), kid.to_string()),
            CachedKey {
                key,
                cached_at: Instant::now(),
            },
        );
    }

    async fn stop(&self) {
        self.entries.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;

    #[tokio::test]
    async fn test_cache_hit_and_miss() {
        let cache = InMemoryKeyCache::default();
        let key = PrivateKey::generate().unwrap().public_key();

        assert!(cache.get("svc", key.kid()).await.is_none());
        cache.set("svc", key.kid(), key.clone()).await;
        assert_eq!(cache.get("svc", key.kid()).await, Some(key.clone()));

        // Same kid under another issuer is a distinct entry.
        assert!(cache.get("other", key.kid()).await.is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = InMemoryKeyCache::new(16, Duration::from_millis(10));
        let key = PrivateKey::generate().unwrap().public_key();

        cache.set("svc", key.kid(), key.clone()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("svc", key.kid()).await.is_none());
    }
}
