use redis::{aio::ConnectionManager, RedisResult, Script};
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::{
    config::RedisSettings,
    error::{GateError, Result},
};

/// Increment a window counter, arming its TTL only when the key has none.
/// Returns the post-increment count and the remaining TTL in milliseconds.
const INCREMENT_WINDOW_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {current, ttl}
"#;

/// Keys fetched per SCAN round trip during prefix invalidation
const SCAN_BATCH: usize = 200;

/// Minimum gap between connection attempts while Redis is unreachable
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&RedisSettings> for RedisConfig {
    fn from(settings: &RedisSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
            command_timeout: Duration::from_millis(settings.command_timeout_ms),
        }
    }
}

/// Post-increment state of a fixed-window counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub consumed: u64,
    pub resets_in: Duration,
}

/// Redis client wrapper shared by the counter and cache stores.
///
/// The `ConnectionManager` is created on first successful contact and
/// reconnects on its own afterwards. Until then every command fails fast
/// with `StoreUnavailable`, retrying the initial connection at most once
/// per `RECONNECT_INTERVAL`.
#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
    connection: Arc<OnceCell<ConnectionManager>>,
    last_failed_attempt: Arc<Mutex<Option<Instant>>>,
    config: RedisConfig,
    increment_script: Arc<Script>,
}

impl RedisClient {
    /// Create a new Redis client and verify it with PING
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let redis_client = Self::lazy(config)?;
        redis_client.health_check().await?;

        info!("Redis client initialized successfully");
        Ok(redis_client)
    }

    /// Create a client that tolerates Redis being down. Only an invalid URL
    /// is an error; an unreachable server is logged and retried on use.
    pub async fn connect_lazy(config: RedisConfig) -> Result<Self> {
        let redis_client = Self::lazy(config)?;
        match redis_client.health_check().await {
            Ok(()) => info!("Redis client initialized successfully"),
            Err(e) => warn!(
                error = %e,
                "Redis unreachable at startup, serving with insurance limits until it returns"
            ),
        }
        Ok(redis_client)
    }

    fn lazy(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            GateError::Redis(e)
        })?;

        Ok(Self {
            client,
            connection: Arc::new(OnceCell::new()),
            last_failed_attempt: Arc::new(Mutex::new(None)),
            config,
            increment_script: Arc::new(Script::new(INCREMENT_WINDOW_SCRIPT)),
        })
    }

    /// The shared connection manager, establishing it if needed
    async fn connection(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.connection.get() {
            return Ok(conn.clone());
        }

        // Another caller is already connecting; do not queue behind it
        let Ok(mut last_failed_attempt) = self.last_failed_attempt.try_lock() else {
            return Err(GateError::StoreUnavailable(
                "Redis connection in progress".to_string(),
            ));
        };
        if let Some(conn) = self.connection.get() {
            return Ok(conn.clone());
        }
        if let Some(at) = *last_failed_attempt {
            if at.elapsed() < RECONNECT_INTERVAL {
                return Err(GateError::StoreUnavailable(
                    "Redis unreachable, waiting before reconnecting".to_string(),
                ));
            }
        }

        match self.establish().await {
            Ok(conn) => {
                *last_failed_attempt = None;
                let _ = self.connection.set(conn.clone());
                Ok(conn)
            }
            Err(e) => {
                *last_failed_attempt = Some(Instant::now());
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<ConnectionManager> {
        let connection_result = tokio::time::timeout(
            self.config.connection_timeout,
            self.client.get_connection_manager(),
        )
        .await;

        match connection_result {
            Ok(Ok(conn)) => {
                info!("Connection manager established successfully");
                Ok(conn)
            }
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                Err(GateError::StoreUnavailable(format!(
                    "Redis connection failed: {}",
                    e
                )))
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}ms)",
                    self.config.connection_timeout.as_millis()
                );
                Err(GateError::StoreUnavailable(
                    "Timeout while creating Redis connection manager".to_string(),
                ))
            }
        }
    }

    /// Run one command under the configured command timeout. An elapsed
    /// timeout is reported as the store being unavailable.
    async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GateError::Redis(e)),
            Err(_) => Err(GateError::StoreUnavailable(format!(
                "Redis {} timed out after {}ms",
                operation,
                self.config.command_timeout.as_millis()
            ))),
        }
    }

    /// Atomically increment a window counter; the TTL is set only when the
    /// window starts
    pub async fn increment_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let mut conn = self.connection().await?;
        let script = self.increment_script.clone();
        let window_ms = window.as_millis().max(1) as u64;

        let (consumed, ttl_ms): (i64, i64) = self
            .run("increment_window", async move {
                let values: Vec<i64> = script
                    .key(key)
                    .arg(window_ms)
                    .invoke_async(&mut conn)
                    .await?;
                match values.as_slice() {
                    [count, ttl] => Ok((*count, *ttl)),
                    _ => Err(redis::RedisError::from((
                        redis::ErrorKind::TypeError,
                        "Expected [count, ttl] from window script",
                    ))),
                }
            })
            .await?;

        Ok(WindowCount {
            consumed: consumed.max(0) as u64,
            resets_in: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }

    /// Set the blocked-until marker and drop the counter in one transaction
    pub async fn block(&self, block_key: &str, counter_key: &str, duration: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let block_ms = duration.as_millis().max(1) as u64;

        self.run("block", async move {
            redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(block_key)
                .arg(1)
                .arg("PX")
                .arg(block_ms)
                .ignore()
                .cmd("DEL")
                .arg(counter_key)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    /// Remaining lifetime of a key, or None when it is absent or persistent
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection().await?;
        let ttl_ms: i64 = self
            .run("pttl", async move {
                redis::cmd("PTTL").arg(key).query_async(&mut conn).await
            })
            .await?;

        Ok((ttl_ms > 0).then(|| Duration::from_millis(ttl_ms as u64)))
    }

    /// Get a string value
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        self.run("get", async move {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    /// Set a string value with an expiry
    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let ttl_secs = ttl.as_secs().max(1);
        self.run("set_ex", async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    /// Delete keys, returning how many existed
    pub async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection().await?;
        self.run("del", async move {
            redis::cmd("DEL").arg(keys).query_async(&mut conn).await
        })
        .await
    }

    /// SCAN for every key starting with `prefix` and delete it in batches
    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut deleted = 0;

        loop {
            let mut conn = self.connection().await?;
            let pattern = pattern.as_str();
            let (next, keys): (u64, Vec<String>) = self
                .run("scan", async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            deleted += self.del(&keys).await?;
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!(prefix = %prefix, deleted, "Deleted keys by prefix");
        Ok(deleted)
    }

    /// Check if the connection is healthy
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        self.run("ping", async move {
            redis::cmd("PING").query_async::<_, ()>(&mut conn).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_default() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.command_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_redis_config_from_settings() {
        let settings = RedisSettings {
            url: "redis://cache:6380".to_string(),
            connection_timeout_ms: 2_500,
            command_timeout_ms: 250,
        };

        let config = RedisConfig::from(&settings);
        assert_eq!(config.url, "redis://cache:6380");
        assert_eq!(config.connection_timeout, Duration::from_millis(2_500));
        assert_eq!(config.command_timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_lazy_client_survives_unreachable_server() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_millis(250),
        };

        let client = RedisClient::connect_lazy(config).await.unwrap();

        // The failed startup attempt arms the reconnect interval
        let started = Instant::now();
        let err = client.increment_window("k", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, GateError::StoreUnavailable(_)));
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_strict_client_rejects_unreachable_server() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_millis(250),
        };

        assert!(RedisClient::new(config).await.is_err());
    }

    #[test]
    fn test_lazy_client_rejects_invalid_url() {
        let config = RedisConfig {
            url: "not a url".to_string(),
            ..RedisConfig::default()
        };

        assert!(matches!(RedisClient::lazy(config), Err(GateError::Redis(_))));
    }

    #[test]
    fn test_window_script_arms_ttl_once() {
        assert!(INCREMENT_WINDOW_SCRIPT.contains("if ttl < 0 then"));
        assert!(INCREMENT_WINDOW_SCRIPT.contains("PEXPIRE"));
    }
}
