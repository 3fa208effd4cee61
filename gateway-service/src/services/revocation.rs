//! TTL key-value store backing every piece of security state: blacklisted
//! token hashes, CSRF tokens, brute-force counters and IP blocks.
//!
//! Two interchangeable backends, selected once at startup: a shared Redis
//! instance (the normal case, visible to every gateway process behind the
//! load balancer) and a per-process map used as fallback when no Redis URL
//! is configured.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[async_trait]
pub trait RevocationStore: Send + Sync {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), anyhow::Error>;
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    async fn delete(&self, key: &str) -> Result<(), anyhow::Error>;
    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error>;

    /// Atomic set-if-absent. Returns true when this call created the entry.
    /// Two concurrent callers presenting the same key see exactly one true.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error>;

    /// Atomic increment that re-arms the TTL on every call, so the window
    /// slides with the latest attempt. A plain get-then-set would let two
    /// concurrent requests both observe the pre-increment count.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, anyhow::Error>;

    /// Remaining lifetime of an entry, if one exists.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisRevocationStore {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisRevocationStore {
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %url, "Connecting to Redis");
        let client = Client::open(url)?;

        // ConnectionManager reconnects on its own after transient failures.
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl RevocationStore for RedisRevocationStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", key, e))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", key, e))
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete {}: {}", key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check {}: {}", key, e))
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to conditionally write {}: {}", key, e))?;
        Ok(reply.is_some())
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<u64, anyhow::Error> {
        let mut conn = self.manager.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window.as_millis().max(1) as u64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to increment {}: {}", key, e))?;
        Ok(count)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read ttl of {}: {}", key, e))?;
        if millis < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(millis as u64)))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// Per-process fallback backend. Shares the trait's atomicity guarantees
/// within one process via DashMap's per-entry locking, but entries written
/// here are invisible to sibling instances behind the load balancer.
#[derive(Clone, Default)]
pub struct MemoryRevocationStore {
    entries: Arc<DashMap<String, MemoryEntry>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Periodically discard expired entries so the map does not grow without
    /// bound. Reads already treat expired entries as absent; this only
    /// reclaims memory and must never be relied on for correctness.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let now = Instant::now();
                let before = entries.len();
                entries.retain(|_, entry| entry.expires_at > now);
                let swept = before.saturating_sub(entries.len());
                if swept > 0 {
                    tracing::debug!(swept, "Swept expired in-memory security entries");
                }
            }
        })
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), anyhow::Error> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries
            .remove_if(key, |_, entry| entry.expires_at <= Instant::now());
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error> {
        Ok(self.get(key).await?.is_some())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Ok(false);
                }
                occupied.insert(MemoryEntry {
                    value: value.to_string(),
                    expires_at: now + ttl,
                });
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry {
                    value: value.to_string(),
                    expires_at: now + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<u64, anyhow::Error> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(MemoryEntry {
            value: "0".to_string(),
            expires_at: now + window,
        });
        let mut count: u64 = if entry.expires_at > now {
            entry.value.parse().unwrap_or(0)
        } else {
            0
        };
        count += 1;
        entry.value = count.to_string();
        entry.expires_at = now + window;
        Ok(count)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, anyhow::Error> {
        if let Some(entry) = self.entries.get(key) {
            let now = Instant::now();
            if entry.expires_at > now {
                return Ok(Some(entry.expires_at - now));
            }
        }
        Ok(None)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = MemoryRevocationStore::new();
        store
            .put("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.exists("k").await.unwrap());

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let store = MemoryRevocationStore::new();
        store
            .put("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.ttl("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_if_absent_is_one_shot() {
        let store = MemoryRevocationStore::new();
        assert!(store
            .put_if_absent("k", "first", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .put_if_absent("k", "second", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn put_if_absent_succeeds_after_expiry() {
        let store = MemoryRevocationStore::new();
        assert!(store
            .put_if_absent("k", "first", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store
            .put_if_absent("k", "second", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn increment_counts_and_slides_the_window() {
        let store = MemoryRevocationStore::new();
        assert_eq!(store.increment("c", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(store.increment("c", Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(store.increment("c", Duration::from_secs(60)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn increment_restarts_after_window_elapses() {
        let store = MemoryRevocationStore::new();
        assert_eq!(
            store.increment("c", Duration::from_millis(10)).await.unwrap(),
            1
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            store.increment("c", Duration::from_millis(10)).await.unwrap(),
            1
        );
    }
}
