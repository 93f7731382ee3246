//! HTTP surface: role routers, admission middleware and operational
//! endpoints.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, FromRef, FromRequestParts, Path, Query, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use async_trait::async_trait;
use prometheus::TextEncoder;
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};

use crate::{
    auth::{Authenticator, USER_ID_HEADER},
    bus::EventBus,
    config::{Policies, RateLimitPolicy},
    error::GateError,
    limiter::AdmissionController,
    metrics::Metrics,
    service::{CreatePost, MediaService, PostService, SearchService, Upload},
    utils::ClientKey,
};

const DENIED_MESSAGE: &str = "Too many requests";
const CREATE_DENIED_MESSAGE: &str = "Too many posts created, please try again later";
const FILE_NAME_HEADER: &str = "x-file-name";

/// A chain of policies guarding one route
#[derive(Clone)]
pub struct AdmissionGate {
    controller: Arc<AdmissionController>,
    chain: Vec<Arc<RateLimitPolicy>>,
    message: &'static str,
}

impl AdmissionGate {
    pub fn new(
        controller: Arc<AdmissionController>,
        chain: Vec<Arc<RateLimitPolicy>>,
        message: &'static str,
    ) -> Self {
        Self {
            controller,
            chain,
            message,
        }
    }
}

/// Identify the caller and run the gate before the handler
pub async fn admit(State(gate): State<AdmissionGate>, request: Request, next: Next) -> Response {
    let headers = request.headers();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client_key = ClientKey::resolve(
        headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()),
        headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()),
        peer,
    );

    match gate
        .controller
        .check(&gate.chain, &client_key, gate.message)
        .await
    {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

/// Authenticated caller
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<dyn Authenticator>: FromRef<S>,
{
    type Rejection = GateError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let authenticator = Arc::<dyn Authenticator>::from_ref(state);
        authenticator.authenticate(&parts.headers).await.map(AuthUser)
    }
}

/// State shared by the routes of one role
pub struct RoleState<S> {
    service: Arc<S>,
    authenticator: Arc<dyn Authenticator>,
}

impl<S> Clone for RoleState<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            authenticator: self.authenticator.clone(),
        }
    }
}

impl<S> FromRef<RoleState<S>> for Arc<dyn Authenticator> {
    fn from_ref(state: &RoleState<S>) -> Self {
        state.authenticator.clone()
    }
}

/// Everything the router needs; absent services leave their routes
/// unmounted
pub struct AppContext {
    pub controller: Arc<AdmissionController>,
    pub policies: Policies,
    pub authenticator: Arc<dyn Authenticator>,
    pub metrics: Arc<Metrics>,
    pub bus: Arc<dyn EventBus>,
    pub posts: Option<Arc<PostService>>,
    pub search: Option<Arc<SearchService>>,
    pub media: Option<Arc<MediaService>>,
}

impl AppContext {
    fn gate(&self, chain: Vec<Arc<RateLimitPolicy>>, message: &'static str) -> AdmissionGate {
        AdmissionGate::new(self.controller.clone(), chain, message)
    }

    fn role<S>(&self, service: &Arc<S>) -> RoleState<S> {
        RoleState {
            service: service.clone(),
            authenticator: self.authenticator.clone(),
        }
    }
}

pub fn router(context: AppContext) -> Router {
    let global = context.gate(vec![context.policies.global.clone()], DENIED_MESSAGE);
    let sensitive = context.gate(
        vec![context.policies.global.clone(), context.policies.sensitive.clone()],
        DENIED_MESSAGE,
    );
    let create = context.gate(
        vec![context.policies.global.clone(), context.policies.create_post.clone()],
        CREATE_DENIED_MESSAGE,
    );

    let mut app = Router::new();

    if let Some(posts) = &context.posts {
        let routes = Router::new()
            .route(
                "/api/posts/create-post",
                post(create_post).route_layer(middleware::from_fn_with_state(create, admit)),
            )
            .route(
                "/api/posts/view-posts",
                get(list_posts).route_layer(middleware::from_fn_with_state(global.clone(), admit)),
            )
            .route(
                "/api/posts/:id",
                get(get_post)
                    .delete(delete_post)
                    .route_layer(middleware::from_fn_with_state(global.clone(), admit)),
            )
            .with_state(context.role(posts));
        app = app.merge(routes);
    }

    if let Some(search) = &context.search {
        let routes = Router::new()
            .route(
                "/api/search/posts",
                get(search_posts).route_layer(middleware::from_fn_with_state(global.clone(), admit)),
            )
            .route(
                "/api/search/posts/:id",
                get(search_post).route_layer(middleware::from_fn_with_state(sensitive.clone(), admit)),
            )
            .with_state(context.role(search));
        app = app.merge(routes);
    }

    if let Some(media) = &context.media {
        let routes = Router::new()
            .route(
                "/api/media/upload",
                post(upload_media).route_layer(middleware::from_fn_with_state(sensitive, admit)),
            )
            .route(
                "/api/media",
                get(list_media).route_layer(middleware::from_fn_with_state(global, admit)),
            )
            .with_state(context.role(media));
        app = app.merge(routes);
    }

    let ops = OpsState {
        controller: context.controller.clone(),
        bus: context.bus.clone(),
        metrics: context.metrics.clone(),
    };
    app.merge(
        Router::new()
            .route("/healthcheck", get(health_check))
            .route("/metrics", get(metrics_handler))
            .with_state(ops),
    )
    .layer(middleware::from_fn_with_state(context.metrics, track_duration))
}

async fn track_duration(State(metrics): State<Arc<Metrics>>, request: Request, next: Next) -> Response {
    let _timer = metrics.start_request_timer();
    next.run(request).await
}

async fn create_post(
    State(state): State<RoleState<PostService>>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<CreatePost>,
) -> Result<impl IntoResponse, GateError> {
    let post = state.service.create_post(&user_id, request).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Post created successfully",
            "post": post,
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

async fn list_posts(
    State(state): State<RoleState<PostService>>,
    AuthUser(_): AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, GateError> {
    let page = state.service.list_posts(query.page, query.limit).await?;
    Ok(Json(page))
}

async fn get_post(
    State(state): State<RoleState<PostService>>,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GateError> {
    let post = state.service.get_post(&id).await?;
    Ok(Json(post))
}

async fn delete_post(
    State(state): State<RoleState<PostService>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GateError> {
    state.service.delete_post(&user_id, &id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Post deleted successfully",
    })))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    query: String,
}

async fn search_posts(
    State(state): State<RoleState<SearchService>>,
    AuthUser(_): AuthUser,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, GateError> {
    let results = state.service.search(&query.query).await?;
    Ok(Json(results))
}

async fn search_post(
    State(state): State<RoleState<SearchService>>,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GateError> {
    let document = state.service.get_post(&id).await?;
    Ok(Json(document))
}

async fn upload_media(
    State(state): State<RoleState<MediaService>>,
    AuthUser(user_id): AuthUser,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, GateError> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let upload = Upload {
        file_name: header_value(FILE_NAME_HEADER).unwrap_or_default(),
        mime_type: header_value(header::CONTENT_TYPE.as_str())
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        bytes: body.to_vec(),
    };

    let media = state.service.upload(&user_id, upload).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "mediaId": media.id,
            "url": media.url,
        })),
    ))
}

async fn list_media(
    State(state): State<RoleState<MediaService>>,
    AuthUser(_): AuthUser,
) -> Result<impl IntoResponse, GateError> {
    let media = state.service.list().await?;
    Ok(Json(media))
}

#[derive(Clone)]
struct OpsState {
    controller: Arc<AdmissionController>,
    bus: Arc<dyn EventBus>,
    metrics: Arc<Metrics>,
}

async fn health_check(State(state): State<OpsState>) -> Response {
    let store = state.controller.health_check().await;
    let broker = state.bus.health_check().await;

    let status = |ok: bool| if ok { "up" } else { "down" };
    let body = Json(json!({
        "status": if store.is_ok() && broker.is_ok() { "healthy" } else { "degraded" },
        "store": status(store.is_ok()),
        "broker": status(broker.is_ok()),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }));

    // Admission keeps working on insurance limits, so a store outage
    // degrades the service without taking it down
    if broker.is_ok() {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

async fn metrics_handler(State(state): State<OpsState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    encoder
        .encode_to_string(&metric_families)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
