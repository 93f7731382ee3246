//! Storage capabilities behind admission control and query caching.
//!
//! `CounterStore` is the "atomic increment with TTL" capability the admission
//! controller consumes; `KeyValueStore` is the cache namespace that read-model
//! synchronizers invalidate. Both have a Redis implementation shared across
//! processes and a `moka`-backed one that lives inside a single process.

use async_trait::async_trait;
use moka::{future::Cache, Expiry};
use std::time::{Duration, Instant};

use crate::{
    error::Result,
    redis::{RedisClient, WindowCount},
};

/// Atomic fixed-window counter with blocked-until markers
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short label for logs and metrics
    fn name(&self) -> &'static str;

    /// Remaining block duration for a marker key, if one is active
    async fn blocked_for(&self, block_key: &str) -> Result<Option<Duration>>;

    /// Increment the counter in one atomic operation. The window TTL is
    /// armed by the increment that creates the key and never extended.
    async fn increment(&self, counter_key: &str, window: Duration) -> Result<WindowCount>;

    /// Install a block marker and reset the counter
    async fn block(&self, block_key: &str, counter_key: &str, duration: Duration) -> Result<()>;

    async fn health_check(&self) -> Result<()>;
}

/// String cache with per-entry TTL and prefix invalidation
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Delete every key in a namespace
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;
}

/// Redis-backed store shared by every process in the cluster
#[derive(Clone)]
pub struct RedisStore {
    client: RedisClient,
}

impl RedisStore {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn blocked_for(&self, block_key: &str) -> Result<Option<Duration>> {
        self.client.ttl(block_key).await
    }

    async fn increment(&self, counter_key: &str, window: Duration) -> Result<WindowCount> {
        self.client.increment_window(counter_key, window).await
    }

    async fn block(&self, block_key: &str, counter_key: &str, duration: Duration) -> Result<()> {
        self.client.block(block_key, counter_key, duration).await
    }

    async fn health_check(&self) -> Result<()> {
        self.client.health_check().await
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.client.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.client.set_ex(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.client.del(keys).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.client.delete_prefix(prefix).await
    }
}

/// Values that carry their own time-to-live
trait Lifetime {
    fn lifetime(&self) -> Duration;
}

#[derive(Clone, Debug)]
struct WindowEntry {
    consumed: u64,
    started: Instant,
    window: Duration,
}

impl Lifetime for WindowEntry {
    fn lifetime(&self) -> Duration {
        self.window
    }
}

#[derive(Clone, Debug)]
struct BlockEntry {
    until: Instant,
    duration: Duration,
}

impl Lifetime for BlockEntry {
    fn lifetime(&self) -> Duration {
        self.duration
    }
}

#[derive(Clone, Debug)]
struct CachedValue {
    value: String,
    ttl: Duration,
}

impl Lifetime for CachedValue {
    fn lifetime(&self) -> Duration {
        self.ttl
    }
}

/// Expire entries after their own lifetime. Updates keep the original
/// deadline, which is what makes the window fixed.
struct LifetimeExpiry;

impl<V: Lifetime> Expiry<String, V> for LifetimeExpiry {
    fn expire_after_create(&self, _key: &String, value: &V, _created_at: Instant) -> Option<Duration> {
        Some(value.lifetime())
    }
}

/// Volatile per-process counters, used as the insurance store
#[derive(Clone)]
pub struct MemoryCounterStore {
    counters: Cache<String, WindowEntry>,
    blocks: Cache<String, BlockEntry>,
}

impl MemoryCounterStore {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            counters: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(LifetimeExpiry)
                .build(),
            blocks: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(LifetimeExpiry)
                .build(),
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn blocked_for(&self, block_key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .blocks
            .get(block_key)
            .await
            .map(|entry| entry.until.saturating_duration_since(now))
            .filter(|remaining| !remaining.is_zero()))
    }

    async fn increment(&self, counter_key: &str, window: Duration) -> Result<WindowCount> {
        // The entry API serializes concurrent upserts on the same key.
        let entry = self
            .counters
            .entry(counter_key.to_string())
            .and_upsert_with(|existing| {
                let next = match existing {
                    Some(entry) => {
                        let mut current = entry.into_value();
                        current.consumed += 1;
                        current
                    }
                    None => WindowEntry {
                        consumed: 1,
                        started: Instant::now(),
                        window,
                    },
                };
                std::future::ready(next)
            })
            .await;

        let current = entry.into_value();
        Ok(WindowCount {
            consumed: current.consumed,
            resets_in: current.window.saturating_sub(current.started.elapsed()),
        })
    }

    async fn block(&self, block_key: &str, counter_key: &str, duration: Duration) -> Result<()> {
        self.blocks
            .insert(
                block_key.to_string(),
                BlockEntry {
                    until: Instant::now() + duration,
                    duration,
                },
            )
            .await;
        self.counters.invalidate(counter_key).await;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Process-local cache namespace
#[derive(Clone)]
pub struct MemoryKeyValueStore {
    entries: Cache<String, CachedValue>,
}

impl MemoryKeyValueStore {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(LifetimeExpiry)
                .build(),
        }
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).await.map(|cached| cached.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(
                key.to_string(),
                CachedValue {
                    value: value.to_string(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for key in keys {
            if self.entries.remove(key).await.is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.to_string())
            .collect();

        self.delete(&matching).await
    }
}
