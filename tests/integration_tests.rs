use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use rust_eventgate::{
    auth::{HeaderAuthenticator, USER_ID_HEADER},
    bus::{ChannelEventBus, EventBus, EventHandler},
    cache::{CacheKey, QueryCache},
    config::{PolicySet, RateLimitPolicy},
    error::{GateError, Result},
    events::{DomainEvent, PostCreated, PostDeleted, POST_CREATED, POST_DELETED},
    http::{router, AppContext},
    limiter::{Admission, AdmissionController},
    metrics::Metrics,
    redis::{RedisClient, RedisConfig, WindowCount},
    repository::{
        InMemoryMediaRepository, InMemoryObjectStorage, InMemoryPostRepository, InMemorySearchIndex,
        MediaRepository,
    },
    service::{CreatePost, MediaService, PostService, SearchService, Upload},
    store::{CounterStore, KeyValueStore, MemoryCounterStore, MemoryKeyValueStore, RedisStore},
    sync::{MediaSynchronizer, SearchSynchronizer},
    utils::ClientKey,
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::sleep;
use tower::ServiceExt;

/// Counter store whose every call fails as if Redis were down
struct UnreachableStore;

#[async_trait]
impl CounterStore for UnreachableStore {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    async fn blocked_for(&self, _block_key: &str) -> Result<Option<Duration>> {
        Err(GateError::StoreUnavailable("connection refused".to_string()))
    }

    async fn increment(&self, _counter_key: &str, _window: Duration) -> Result<WindowCount> {
        Err(GateError::StoreUnavailable("connection refused".to_string()))
    }

    async fn block(&self, _block_key: &str, _counter_key: &str, _duration: Duration) -> Result<()> {
        Err(GateError::StoreUnavailable("connection refused".to_string()))
    }

    async fn health_check(&self) -> Result<()> {
        Err(GateError::StoreUnavailable("connection refused".to_string()))
    }
}

/// One process hosting every role over the in-process bus
struct Cluster {
    bus: Arc<ChannelEventBus>,
    cache_store: Arc<MemoryKeyValueStore>,
    index: Arc<InMemorySearchIndex>,
    media_records: Arc<InMemoryMediaRepository>,
    storage: Arc<InMemoryObjectStorage>,
    posts: Arc<PostService>,
    search: Arc<SearchService>,
    media: Arc<MediaService>,
}

impl Cluster {
    async fn start() -> Self {
        let metrics = Arc::new(Metrics::new().unwrap());
        let bus = Arc::new(ChannelEventBus::new(metrics.clone()));
        let cache_store = Arc::new(MemoryKeyValueStore::default());
        let cache = QueryCache::new(cache_store.clone(), metrics);

        let index = Arc::new(InMemorySearchIndex::new());
        let media_records = Arc::new(InMemoryMediaRepository::new());
        let storage = Arc::new(InMemoryObjectStorage::default());

        let search_sync: Arc<dyn EventHandler> =
            Arc::new(SearchSynchronizer::new(index.clone(), cache.clone()));
        bus.subscribe(POST_CREATED, search_sync.clone()).await.unwrap();
        bus.subscribe(POST_DELETED, search_sync).await.unwrap();
        bus.subscribe(
            POST_DELETED,
            Arc::new(MediaSynchronizer::new(
                media_records.clone(),
                storage.clone(),
                cache.clone(),
            )),
        )
        .await
        .unwrap();

        let posts = Arc::new(PostService::new(
            Arc::new(InMemoryPostRepository::new()),
            cache.clone(),
            bus.clone(),
        ));
        let search = Arc::new(SearchService::new(index.clone(), cache.clone()));
        let media = Arc::new(MediaService::new(
            media_records.clone(),
            storage.clone(),
            cache,
        ));

        Self {
            bus,
            cache_store,
            index,
            media_records,
            storage,
            posts,
            search,
            media,
        }
    }

    async fn upload(&self, name: &str) -> String {
        self.media
            .upload(
                "u1",
                Upload {
                    file_name: name.to_string(),
                    mime_type: "image/png".to_string(),
                    bytes: vec![0xde, 0xad],
                },
            )
            .await
            .unwrap()
            .id
    }
}

/// Poll until the condition holds; consumers apply events asynchronously
async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 1s");
}

fn created_event(id: &str, content: &str) -> DomainEvent {
    DomainEvent::new(&PostCreated {
        post_id: id.to_string(),
        user_id: "u1".to_string(),
        content: content.to_string(),
        created_at: "2024-05-01T10:00:00Z".parse().unwrap(),
    })
    .unwrap()
}

#[tokio::test]
async fn test_created_post_is_served_from_read_model() {
    let cluster = Cluster::start().await;

    cluster.bus.publish(&created_event("p1", "hi")).await.unwrap();

    let search = cluster.search.clone();
    eventually(|| {
        let search = search.clone();
        async move { search.get_post("p1").await.is_ok() }
    })
    .await;

    // No primary store is consulted: the search role only has its index
    let document = cluster.search.get_post("p1").await.unwrap();
    assert_eq!(document.content, "hi");
    assert_eq!(document.user_id, "u1");

    // The lookup populated the derived-record cache entry
    cluster
        .cache_store
        .get(&CacheKey::search_post("p1").render())
        .await
        .unwrap()
        .expect("entry cached");
}

#[tokio::test]
async fn test_duplicate_created_delivery_yields_one_record() {
    let cluster = Cluster::start().await;
    let event = created_event("p1", "hi");

    cluster.bus.publish(&event).await.unwrap();
    cluster.bus.publish(&event).await.unwrap();
    cluster.bus.publish(&created_event("p2", "marker")).await.unwrap();

    let index = cluster.index.clone();
    eventually(|| {
        let index = index.clone();
        async move { index.len().await == 2 }
    })
    .await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.index.len().await, 2);
}

#[tokio::test]
async fn test_deleted_post_cascades_to_media_and_listing_cache() {
    let cluster = Cluster::start().await;
    let m1 = cluster.upload("a.png").await;
    let m2 = cluster.upload("b.png").await;
    let public_ids: Vec<String> = cluster
        .media_records
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.public_id)
        .collect();

    // Warm the listing caches
    assert_eq!(cluster.media.list().await.unwrap().len(), 2);
    assert!(cluster
        .cache_store
        .get(&CacheKey::MediaListing.render())
        .await
        .unwrap()
        .is_some());

    cluster
        .bus
        .publish(
            &DomainEvent::new(&PostDeleted {
                post_id: "p1".to_string(),
                user_id: "u1".to_string(),
                media_ids: vec![m1.clone(), m2.clone()],
            })
            .unwrap(),
        )
        .await
        .unwrap();

    let (records, cache_store) = (cluster.media_records.clone(), cluster.cache_store.clone());
    eventually(|| {
        let (records, cache_store) = (records.clone(), cache_store.clone());
        async move {
            records.list().await.unwrap().is_empty()
                && cache_store
                    .get(&CacheKey::MediaListing.render())
                    .await
                    .unwrap()
                    .is_none()
        }
    })
    .await;

    assert!(cluster.media_records.get(&m1).await.unwrap().is_none());
    assert!(cluster.media_records.get(&m2).await.unwrap().is_none());
    for public_id in &public_ids {
        assert!(!cluster.storage.contains(public_id).await);
    }
    assert!(cluster
        .cache_store
        .get(&CacheKey::MediaListing.render())
        .await
        .unwrap()
        .is_none());
    assert!(cluster.media.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_post_lifecycle_end_to_end() {
    let cluster = Cluster::start().await;
    let m1 = cluster.upload("cat.png").await;

    let post = cluster
        .posts
        .create_post(
            "u1",
            CreatePost {
                content: "Rust event gates".to_string(),
                media_ids: vec![m1.clone()],
            },
        )
        .await
        .unwrap();

    let index = cluster.index.clone();
    eventually(|| {
        let index = index.clone();
        async move { index.len().await == 1 }
    })
    .await;

    let results = cluster.search.search("rust").await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].post_id, post.id);

    cluster.posts.delete_post("u1", &post.id).await.unwrap();

    let (index, records) = (cluster.index.clone(), cluster.media_records.clone());
    let cache_store = cluster.cache_store.clone();
    let search_key = CacheKey::search("rust").render();
    eventually(|| {
        let (index, records, cache_store) = (index.clone(), records.clone(), cache_store.clone());
        let (m1, search_key) = (m1.clone(), search_key.clone());
        async move {
            index.is_empty().await
                && records.get(&m1).await.unwrap().is_none()
                && cache_store.get(&search_key).await.unwrap().is_none()
        }
    })
    .await;

    // The cached search result was invalidated by the delete
    assert!(cluster.search.search("rust").await.unwrap().is_empty());
    assert!(matches!(
        cluster.search.get_post(&post.id).await,
        Err(GateError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_poison_message_is_dropped() {
    let cluster = Cluster::start().await;

    cluster.bus.publish_raw(POST_CREATED, b"\x00\x01not json".to_vec()).unwrap();
    cluster
        .bus
        .publish_raw(POST_CREATED, br#"{"routingKey":"post.created"}"#.to_vec())
        .unwrap();
    cluster.bus.publish(&created_event("p1", "after poison")).await.unwrap();

    let index = cluster.index.clone();
    eventually(|| {
        let index = index.clone();
        async move { index.len().await == 1 }
    })
    .await;
}

#[tokio::test]
async fn test_store_outage_applies_insurance_limits_over_http() {
    let metrics = Arc::new(Metrics::new().unwrap());
    let bus: Arc<dyn EventBus> = Arc::new(ChannelEventBus::new(metrics.clone()));
    let cache = QueryCache::new(Arc::new(MemoryKeyValueStore::default()), metrics.clone());
    let app = router(AppContext {
        controller: Arc::new(AdmissionController::new(
            Arc::new(UnreachableStore),
            metrics.clone(),
        )),
        policies: PolicySet::default().compile().unwrap(),
        authenticator: Arc::new(HeaderAuthenticator::default()),
        metrics,
        bus: bus.clone(),
        posts: Some(Arc::new(PostService::new(
            Arc::new(InMemoryPostRepository::new()),
            cache,
            bus,
        ))),
        search: None,
        media: None,
    });

    let request = || {
        Request::builder()
            .method("POST")
            .uri("/api/posts/create-post")
            .header(header::CONTENT_TYPE, "application/json")
            .header(USER_ID_HEADER, "u1")
            .body(Body::from(r#"{"content":"hello"}"#))
            .unwrap()
    };

    // create_post insurance allows 2 per minute in each process
    for _ in 0..2 {
        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    let response = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let health = app
        .oneshot(Request::builder().uri("/healthcheck").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(health.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["store"], "down");
}

#[tokio::test]
async fn test_unreachable_redis_at_startup_admits_under_insurance() {
    let client = RedisClient::connect_lazy(RedisConfig {
        url: "redis://127.0.0.1:1".to_string(),
        connection_timeout: Duration::from_millis(500),
        command_timeout: Duration::from_millis(250),
    })
    .await
    .unwrap();
    let store = Arc::new(RedisStore::new(client));
    assert!(store.health_check().await.is_err());

    let controller = AdmissionController::new(store, Arc::new(Metrics::new().unwrap()));
    let policy = RateLimitPolicy::new("global", 20, 60, 60, 2, 1).unwrap();
    let client_key = ClientKey::from("u1");

    assert!(controller.admit(&policy, &client_key).await.is_allowed());
    assert!(controller.admit(&policy, &client_key).await.is_allowed());
    assert!(!controller.admit(&policy, &client_key).await.is_allowed());

    // No block under insurance; the next window admits again
    sleep(Duration::from_millis(1100)).await;
    assert!(controller.admit(&policy, &client_key).await.is_allowed());
}

#[tokio::test]
async fn test_concurrent_admission_never_exceeds_points() {
    let controller = Arc::new(AdmissionController::new(
        Arc::new(MemoryCounterStore::default()),
        Arc::new(Metrics::new().unwrap()),
    ));
    let policy = Arc::new(RateLimitPolicy::new("burst", 5, 60, 0, 1, 60).unwrap());

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let controller = controller.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                controller
                    .admit(&policy, &ClientKey::from("same-client"))
                    .await
            })
        })
        .collect();

    let mut allowed = 0;
    for task in tasks {
        if task.await.unwrap().is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_redis_admission_and_cache() {
    use testcontainers::{clients::Cli, core::WaitFor, GenericImage};

    let docker = Cli::default();
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    let container = docker.run(image);
    let port = container.get_host_port_ipv4(6379);

    let client = RedisClient::new(RedisConfig {
        url: format!("redis://localhost:{}", port),
        ..Default::default()
    })
    .await
    .unwrap();
    let store = Arc::new(RedisStore::new(client));

    let controller = AdmissionController::new(store.clone(), Arc::new(Metrics::new().unwrap()));
    let policy = RateLimitPolicy::new("api", 2, 60, 1, 1, 60).unwrap();
    let client_key = ClientKey::from("c1");

    assert!(controller.admit(&policy, &client_key).await.is_allowed());
    assert!(controller.admit(&policy, &client_key).await.is_allowed());
    match controller.admit(&policy, &client_key).await {
        Admission::Denied { retry_after_secs } => assert_eq!(retry_after_secs, 1),
        other => panic!("expected denial, got {:?}", other),
    }

    // The block lapses and the window starts over
    sleep(Duration::from_millis(1100)).await;
    assert!(controller.admit(&policy, &client_key).await.is_allowed());

    // A client key shaped like a marker only touches its own counter
    let victim = ClientKey::from("victim");
    for _ in 0..2 {
        controller.admit(&policy, &ClientKey::from("b:victim")).await;
    }
    assert!(controller.admit(&policy, &victim).await.is_allowed());

    store
        .set("posts:1:10", "[]", Duration::from_secs(300))
        .await
        .unwrap();
    store
        .set("posts:2:10", "[]", Duration::from_secs(300))
        .await
        .unwrap();
    store
        .set("post:p1", "{}", Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(store.delete_prefix("posts:").await.unwrap(), 2);
    assert_eq!(store.get("post:p1").await.unwrap(), Some("{}".to_string()));
}
