use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    bus::EventBus,
    cache::{CacheKey, CacheNamespace, QueryCache},
    error::{GateError, Result},
    events::{DomainEvent, PostCreated, PostDeleted},
    repository::{
        Media, MediaRepository, ObjectStorage, Post, PostRepository, SearchDocument, SearchIndex,
    },
    utils::TimeSource,
};

pub const MAX_CONTENT_LENGTH: usize = 5000;
pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const MAX_SEARCH_RESULTS: usize = 10;

/// Publish a domain event without letting a broker failure reach the
/// caller. The primary write has already committed when this runs.
pub async fn publish_best_effort(bus: &dyn EventBus, event: Result<DomainEvent>) {
    let event = match event {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Failed to build event, not publishing");
            return;
        }
    };

    if let Err(e) = bus.publish(&event).await {
        warn!(
            routing_key = %event.routing_key(),
            entity_id = %event.entity_id(),
            error = %e,
            "Failed to publish event"
        );
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePost {
    pub content: String,
    #[serde(default)]
    pub media_ids: Vec<String>,
}

/// One page of the post listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub current_page: u32,
    pub total_pages: u32,
    pub total_posts: usize,
}

/// Owns the primary post store and emits post lifecycle events
pub struct PostService {
    posts: Arc<dyn PostRepository>,
    cache: QueryCache,
    bus: Arc<dyn EventBus>,
    time_source: TimeSource,
}

impl PostService {
    pub fn new(posts: Arc<dyn PostRepository>, cache: QueryCache, bus: Arc<dyn EventBus>) -> Self {
        Self {
            posts,
            cache,
            bus,
            time_source: TimeSource::new(),
        }
    }

    pub async fn create_post(&self, user_id: &str, request: CreatePost) -> Result<Post> {
        let content = request.content.trim();
        if content.is_empty() {
            return Err(GateError::Validation("Content is required".to_string()));
        }
        if content.chars().count() > MAX_CONTENT_LENGTH {
            return Err(GateError::Validation(format!(
                "Content must be at most {} characters",
                MAX_CONTENT_LENGTH
            )));
        }

        let post = Post {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            content: content.to_string(),
            media_ids: request.media_ids,
            created_at: self.time_source.utc_now(),
        };
        self.posts.insert(post.clone()).await?;
        info!(post_id = %post.id, user_id = %user_id, "Post created");

        publish_best_effort(
            self.bus.as_ref(),
            DomainEvent::new(&PostCreated {
                post_id: post.id.clone(),
                user_id: post.user_id.clone(),
                content: post.content.clone(),
                created_at: post.created_at,
            }),
        )
        .await;

        self.cache
            .invalidate_namespace(CacheNamespace::PostListings)
            .await;
        Ok(post)
    }

    pub async fn list_posts(&self, page: Option<u32>, limit: Option<u32>) -> Result<PostPage> {
        let page = page.unwrap_or(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if page == 0 {
            return Err(GateError::Validation("Page must be at least 1".to_string()));
        }
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(GateError::Validation(format!(
                "Limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        let posts = self.posts.clone();
        self.cache
            .get_or_compute(&CacheKey::post_listing(page, limit), || async move {
                let offset = (page as usize - 1) * limit as usize;
                let total_posts = posts.count().await?;
                let items = posts.list(offset, limit as usize).await?;
                Ok(PostPage {
                    posts: items,
                    current_page: page,
                    total_pages: total_posts.div_ceil(limit as usize) as u32,
                    total_posts,
                })
            })
            .await
    }

    pub async fn get_post(&self, id: &str) -> Result<Post> {
        self.cache
            .get_or_compute(&CacheKey::post(id), || async {
                self.posts
                    .get(id)
                    .await?
                    .ok_or_else(|| GateError::NotFound("Post not found".to_string()))
            })
            .await
    }

    /// Delete a post owned by `user_id`. Someone else's post is reported
    /// as missing.
    pub async fn delete_post(&self, user_id: &str, id: &str) -> Result<()> {
        let post = self
            .posts
            .delete_owned(id, user_id)
            .await?
            .ok_or_else(|| GateError::NotFound("Post not found".to_string()))?;
        info!(post_id = %post.id, media = post.media_ids.len(), "Post deleted");

        publish_best_effort(
            self.bus.as_ref(),
            DomainEvent::new(&PostDeleted {
                post_id: post.id.clone(),
                user_id: post.user_id.clone(),
                media_ids: post.media_ids.clone(),
            }),
        )
        .await;

        self.cache.invalidate(&[CacheKey::post(&post.id)]).await;
        self.cache
            .invalidate_namespace(CacheNamespace::PostListings)
            .await;
        Ok(())
    }
}

/// Queries the derived search index. Never touches the post store.
pub struct SearchService {
    index: Arc<dyn SearchIndex>,
    cache: QueryCache,
}

impl SearchService {
    pub fn new(index: Arc<dyn SearchIndex>, cache: QueryCache) -> Self {
        Self { index, cache }
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchDocument>> {
        if query.trim().is_empty() {
            return Err(GateError::Validation("Query is required".to_string()));
        }

        let key = CacheKey::search(query);
        self.cache
            .get_or_compute(&key, || async {
                self.index.search(query, MAX_SEARCH_RESULTS).await
            })
            .await
    }

    pub async fn get_post(&self, post_id: &str) -> Result<SearchDocument> {
        self.cache
            .get_or_compute(&CacheKey::search_post(post_id), || async {
                self.index
                    .get(post_id)
                    .await?
                    .ok_or_else(|| GateError::NotFound("Post not found".to_string()))
            })
            .await
    }
}

/// An uploaded file as received over HTTP
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

pub struct MediaService {
    media: Arc<dyn MediaRepository>,
    storage: Arc<dyn ObjectStorage>,
    cache: QueryCache,
    time_source: TimeSource,
}

impl MediaService {
    pub fn new(
        media: Arc<dyn MediaRepository>,
        storage: Arc<dyn ObjectStorage>,
        cache: QueryCache,
    ) -> Self {
        Self {
            media,
            storage,
            cache,
            time_source: TimeSource::new(),
        }
    }

    pub async fn upload(&self, user_id: &str, upload: Upload) -> Result<Media> {
        if upload.bytes.is_empty() {
            return Err(GateError::Validation("No file found. Please add a file and try again".to_string()));
        }
        if upload.file_name.trim().is_empty() {
            return Err(GateError::Validation("File name is required".to_string()));
        }

        let stored = self
            .storage
            .upload(&upload.file_name, &upload.mime_type, upload.bytes)
            .await?;

        let media = Media {
            id: uuid::Uuid::new_v4().to_string(),
            public_id: stored.public_id,
            original_name: upload.file_name,
            mime_type: upload.mime_type,
            url: stored.url,
            user_id: user_id.to_string(),
            created_at: self.time_source.utc_now(),
        };
        self.media.insert(media.clone()).await?;
        info!(media_id = %media.id, user_id = %user_id, "Media uploaded");

        self.cache
            .invalidate_namespace(CacheNamespace::MediaListings)
            .await;
        Ok(media)
    }

    pub async fn list(&self) -> Result<Vec<Media>> {
        self.cache
            .get_or_compute(&CacheKey::MediaListing, || async { self.media.list().await })
            .await
    }
}
