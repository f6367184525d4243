//! Short-lived suppression of duplicate webhook deliveries

use async_trait::async_trait;
use common::cache::RedisPool;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

const REDIS_KEY_PREFIX: &str = "calendar:webhook:";

/// Remembers recently processed notification keys
#[async_trait]
pub trait NotificationDedup: Send + Sync {
    async fn seen_recently(&self, key: &str) -> bool;

    async fn mark_seen(&self, key: &str);

    /// Mark the key and report whether this caller was the first to see it
    async fn claim(&self, key: &str) -> bool {
        if self.seen_recently(key).await {
            return false;
        }
        self.mark_seen(key).await;
        true
    }
}

/// Process-local dedup with wall-clock expiry
pub struct InMemoryDedup {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl InMemoryDedup {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn evict_expired(&self, seen: &mut HashMap<String, Instant>, now: Instant) {
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);
    }
}

#[async_trait]
impl NotificationDedup for InMemoryDedup {
    async fn seen_recently(&self, key: &str) -> bool {
        let mut seen = self.seen.lock().await;
        self.evict_expired(&mut seen, Instant::now());
        seen.contains_key(key)
    }

    async fn mark_seen(&self, key: &str) {
        self.seen
            .lock()
            .await
            .insert(key.to_string(), Instant::now());
    }

    async fn claim(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        self.evict_expired(&mut seen, now);
        if seen.contains_key(key) {
            return false;
        }
        seen.insert(key.to_string(), now);
        true
    }
}

/// Dedup shared between replicas through Redis
///
/// Redis failures are logged and treated as "not seen", so a cache outage
/// never drops a notification.
pub struct RedisDedup {
    redis: RedisPool,
    ttl_secs: u64,
}

impl RedisDedup {
    pub fn new(redis: RedisPool, ttl: Duration) -> Self {
        Self {
            redis,
            ttl_secs: ttl.as_secs().max(1),
        }
    }

    fn key(key: &str) -> String {
        format!("{REDIS_KEY_PREFIX}{key}")
    }
}

#[async_trait]
impl NotificationDedup for RedisDedup {
    async fn seen_recently(&self, key: &str) -> bool {
        match self.redis.exists(&Self::key(key)).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Dedup lookup failed, treating {} as new: {}", key, e);
                false
            }
        }
    }

    async fn mark_seen(&self, key: &str) {
        if let Err(e) = self
            .redis
            .set_if_absent(&Self::key(key), "1", self.ttl_secs)
            .await
            .map(|_| ())
        {
            warn!("Failed to record {} as seen: {}", key, e);
        }
    }

    async fn claim(&self, key: &str) -> bool {
        match self
            .redis
            .set_if_absent(&Self::key(key), "1", self.ttl_secs)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("Dedup claim failed, processing {} anyway: {}", key, e);
                true
            }
        }
    }
}
