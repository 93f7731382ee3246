// Step-by-step connectivity probe for the stores and broker the service needs
// Run this with: cargo run --bin debug_startup

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_eventgate::{
    bus::{BrokerConfig, BrokerConnection},
    config::{load_settings, MessagingType, Settings, StoreType},
    redis::{RedisClient, RedisConfig},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with more verbose output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting debug startup test...");

    let start_time = Instant::now();
    let config_path = std::env::var("CONFIG_PATH").ok();
    let settings = load_settings(config_path.as_deref())?;
    info!("✅ Settings loaded (store: {:?}, messaging: {:?})", settings.store.store_type, settings.messaging.messaging_type);

    settings.policies.compile()?;
    info!("✅ Rate limit policies compiled");

    // Test each component step by step with timeouts
    test_redis_connection(&settings).await?;
    test_broker_connection(&settings).await?;

    info!("✅ All tests completed successfully in {:?}", start_time.elapsed());
    Ok(())
}

async fn test_redis_connection(settings: &Settings) -> Result<()> {
    if settings.store.store_type == StoreType::Memory {
        warn!("⏭️  Store type is memory, skipping Redis");
        return Ok(());
    }

    info!("🔍 Testing Redis connection...");
    info!("Using Redis URL: {}", settings.redis.url);

    let redis_config = RedisConfig::from(&settings.redis);

    let connection_start = Instant::now();
    info!("Creating Redis client with 10 second timeout...");

    let result = tokio::time::timeout(Duration::from_secs(10), RedisClient::new(redis_config)).await;

    match result {
        Ok(Ok(client)) => {
            info!("✅ Redis client created successfully in {:?}", connection_start.elapsed());

            info!("Testing window increment...");
            let increment_start = Instant::now();
            let key = format!("debug_startup:{}", uuid::Uuid::new_v4());
            match client.increment_window(&key, Duration::from_secs(5)).await {
                Ok(count) => {
                    info!(
                        "✅ Increment returned {} (resets in {:?}) in {:?}",
                        count.consumed,
                        count.resets_in,
                        increment_start.elapsed()
                    );
                }
                Err(e) => {
                    error!("❌ Window increment failed: {}", e);
                    return Err(e.into());
                }
            }
            client.del(&[key]).await?;
        }
        Ok(Err(e)) => {
            error!("❌ Redis client creation failed: {}", e);
            return Err(e.into());
        }
        Err(_) => {
            error!("❌ Redis client creation timed out after 10 seconds");
            error!("This suggests a network connectivity issue or Redis server is not responding");
            return Err(anyhow::anyhow!("Redis connection timeout"));
        }
    }

    Ok(())
}

async fn test_broker_connection(settings: &Settings) -> Result<()> {
    if settings.messaging.messaging_type == MessagingType::Channel {
        warn!("⏭️  Messaging type is channel, skipping broker");
        return Ok(());
    }

    info!("🔍 Testing broker connection...");
    info!("Using broker URL: {} (exchange: {})", settings.messaging.url, settings.messaging.exchange);

    let config = BrokerConfig::from(&settings.messaging);
    let budget = config.retry_delay * config.connect_retries as u32 + Duration::from_secs(10);
    let connection = BrokerConnection::new(config);

    let connection_start = Instant::now();
    match tokio::time::timeout(budget, connection.connect()).await {
        Ok(Ok(())) => {
            info!("✅ Broker connected in {:?}", connection_start.elapsed());

            let channel_start = Instant::now();
            connection.channel().await?;
            info!("✅ Channel opened in {:?}", channel_start.elapsed());
            connection.close().await;
        }
        Ok(Err(e)) => {
            error!("❌ Broker connection failed: {}", e);
            return Err(e.into());
        }
        Err(_) => {
            error!("❌ Broker connection timed out after {:?}", budget);
            return Err(anyhow::anyhow!("Broker connection timeout"));
        }
    }

    Ok(())
}
