use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: String,
    expires_at: u64,
}

impl CacheEntry {
    fn new(data: String, ttl_seconds: u64) -> Self {
        Self {
            data,
            expires_at: now_secs() + ttl_seconds,
        }
    }

    fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }
}

/// In-memory TTL cache for API tokens and URL conversions. Lives for the
/// process lifetime only.
pub struct ResponseCache {
    cache: RwLock<HashMap<String, CacheEntry>>,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(default_ttl_seconds: u64) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            default_ttl: Duration::from_secs(default_ttl_seconds),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.data.clone())
    }

    pub async fn set(&self, key: String, value: String) {
        self.set_with_ttl(key, value, self.default_ttl.as_secs()).await;
    }

    pub async fn set_with_ttl(&self, key: String, value: String, ttl_seconds: u64) {
        let mut cache = self.cache.write().await;
        // opportunistic sweep keeps the map from growing without bound
        cache.retain(|_, entry| !entry.is_expired());
        cache.insert(key, CacheEntry::new(value, ttl_seconds));
    }

    pub async fn size(&self) -> usize {
        let cache = self.cache.read().await;
        cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_entries_are_invisible_and_swept() {
        let cache = ResponseCache::new(3600);
        cache.set("token".to_string(), "abc".to_string()).await;
        cache.set_with_ttl("stale".to_string(), "old".to_string(), 0).await;

        assert_eq!(cache.get("token").await.as_deref(), Some("abc"));
        assert_eq!(cache.get("stale").await, None);

        cache.set("other".to_string(), "x".to_string()).await;
        assert_eq!(cache.size().await, 2);
    }
}
