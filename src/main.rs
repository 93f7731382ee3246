use anyhow::{anyhow, Context, Result};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_eventgate::{
    auth::HeaderAuthenticator,
    bus::{
        AmqpEventBus, BrokerConfig, BrokerConnection, ChannelEventBus, EventBus, EventHandler,
        SubscriptionHandle,
    },
    cache::QueryCache,
    config::{load_policies_from_file, load_settings, MessagingType, Settings, StoreType},
    events::{POST_CREATED, POST_DELETED},
    http::{router, AppContext},
    limiter::AdmissionController,
    metrics::Metrics,
    redis::{RedisClient, RedisConfig},
    repository::{
        InMemoryMediaRepository, InMemoryObjectStorage, InMemoryPostRepository, InMemorySearchIndex,
    },
    service::{MediaService, PostService, SearchService},
    store::{CounterStore, KeyValueStore, MemoryCounterStore, MemoryKeyValueStore, RedisStore},
    sync::{MediaSynchronizer, SearchSynchronizer},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_eventgate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rust Event Gate");

    let config_path = std::env::var("CONFIG_PATH").ok();
    let mut settings = load_settings(config_path.as_deref())?;
    if let Ok(policies_path) = std::env::var("POLICIES_PATH") {
        info!("Loading rate limit policies from: {}", policies_path);
        settings.policies = load_policies_from_file(&policies_path)?;
    }
    let metrics = Arc::new(Metrics::new()?);

    let (counters, cache_store) = create_stores(&settings).await?;
    let controller = Arc::new(AdmissionController::new(counters, metrics.clone()));
    let policies = settings.policies.compile()?;
    let cache = QueryCache::new(cache_store, metrics.clone());

    let (bus, broker) = create_bus(&settings, metrics.clone()).await?;

    let mut subscriptions = Vec::new();

    let posts = settings.roles.posts.then(|| {
        Arc::new(PostService::new(
            Arc::new(InMemoryPostRepository::new()),
            cache.clone(),
            bus.clone(),
        ))
    });

    let search = if settings.roles.search {
        let index = Arc::new(InMemorySearchIndex::new());
        let synchronizer: Arc<dyn EventHandler> =
            Arc::new(SearchSynchronizer::new(index.clone(), cache.clone()));
        for routing_key in [POST_CREATED, POST_DELETED] {
            subscriptions.push(bus.subscribe(routing_key, synchronizer.clone()).await?);
        }
        Some(Arc::new(SearchService::new(index, cache.clone())))
    } else {
        None
    };

    let media = if settings.roles.media {
        let records = Arc::new(InMemoryMediaRepository::new());
        let storage = Arc::new(InMemoryObjectStorage::default());
        let synchronizer: Arc<dyn EventHandler> = Arc::new(MediaSynchronizer::new(
            records.clone(),
            storage.clone(),
            cache.clone(),
        ));
        subscriptions.push(bus.subscribe(POST_DELETED, synchronizer).await?);
        Some(Arc::new(MediaService::new(records, storage, cache.clone())))
    } else {
        None
    };

    let app = router(AppContext {
        controller,
        policies,
        authenticator: Arc::new(HeaderAuthenticator::default()),
        metrics,
        bus,
        posts,
        search,
        media,
    });

    let http_addr = settings.http_addr()?;
    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    let http_server = async {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server error")
    };

    // A consumer only stops when the broker is gone for good. Running on
    // without it would silently stop syncing read models.
    let outcome = tokio::select! {
        result = http_server => result,
        failure = supervise(subscriptions) => Err(failure),
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    if let Some(broker) = broker {
        broker.close().await;
    }

    match &outcome {
        Ok(()) => info!("Service stopped"),
        Err(e) => error!("Service stopped: {:#}", e),
    }
    outcome
}

async fn create_stores(
    settings: &Settings,
) -> Result<(Arc<dyn CounterStore>, Arc<dyn KeyValueStore>)> {
    match settings.store.store_type {
        StoreType::Redis => {
            // An unreachable Redis is not fatal; admission falls back to
            // insurance limits until the client connects.
            let client = RedisClient::connect_lazy(RedisConfig::from(&settings.redis))
                .await
                .context("Invalid Redis configuration")?;
            let store = Arc::new(RedisStore::new(client));
            let counters: Arc<dyn CounterStore> = store.clone();
            let cache: Arc<dyn KeyValueStore> = store;
            Ok((counters, cache))
        }
        StoreType::Memory => {
            warn!("Using process-local stores; limits and caches are not shared");
            let counters: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::default());
            let cache: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::default());
            Ok((counters, cache))
        }
    }
}

async fn create_bus(
    settings: &Settings,
    metrics: Arc<Metrics>,
) -> Result<(Arc<dyn EventBus>, Option<Arc<BrokerConnection>>)> {
    match settings.messaging.messaging_type {
        MessagingType::Amqp => {
            let connection = Arc::new(BrokerConnection::new(BrokerConfig::from(
                &settings.messaging,
            )));

            if let Err(e) = connection.connect().await {
                if settings.roles.depends_on_bus() {
                    return Err(anyhow!(e).context("Broker is required by the search and media roles"));
                }
                // Publishing is best-effort; the connection retries on first use
                warn!(error = %e, "Broker unavailable, events will not be published until it returns");
            }

            let bus: Arc<dyn EventBus> = Arc::new(AmqpEventBus::new(connection.clone(), metrics));
            Ok((bus, Some(connection)))
        }
        MessagingType::Channel => {
            info!("Using in-process event bus");
            let bus: Arc<dyn EventBus> = Arc::new(ChannelEventBus::new(metrics));
            Ok((bus, None))
        }
    }
}

/// Resolve when the first subscription stops
async fn supervise(subscriptions: Vec<SubscriptionHandle>) -> anyhow::Error {
    if subscriptions.is_empty() {
        return std::future::pending().await;
    }

    let waits = subscriptions.into_iter().map(|handle| {
        Box::pin(async move {
            let routing_key = handle.routing_key().to_string();
            (routing_key, handle.wait().await)
        })
    });

    let ((routing_key, result), _, _) = futures::future::select_all(waits).await;
    match result {
        Ok(()) => anyhow!("Subscription for '{}' stopped", routing_key),
        Err(e) => anyhow!(e).context(format!("Subscription for '{}' failed", routing_key)),
    }
}
