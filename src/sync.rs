//! Read-model synchronizers.
//!
//! Handlers for post lifecycle events. Every handler is idempotent: a
//! duplicate `post.created` is a no-op, deleting something already gone
//! succeeds. After applying an event the affected cache entries are
//! invalidated, entity keys directly and listings by namespace.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    bus::EventHandler,
    cache::{CacheKey, CacheNamespace, QueryCache},
    error::{GateError, Result},
    events::{DomainEvent, PostCreated, PostDeleted, PostEvent},
    repository::{MediaRepository, ObjectStorage, SearchDocument, SearchIndex},
};

/// Keeps the search index in step with the post store
pub struct SearchSynchronizer {
    index: Arc<dyn SearchIndex>,
    cache: QueryCache,
}

impl SearchSynchronizer {
    pub fn new(index: Arc<dyn SearchIndex>, cache: QueryCache) -> Self {
        Self { index, cache }
    }

    pub async fn on_created(&self, event: &PostCreated) -> Result<()> {
        let inserted = self
            .index
            .insert_if_absent(SearchDocument::from(event))
            .await?;

        if inserted {
            info!(post_id = %event.post_id, "Indexed post");
        } else {
            debug!(post_id = %event.post_id, "Post already indexed, skipping duplicate");
        }

        // A new document can change any cached result set
        self.cache
            .invalidate_namespace(CacheNamespace::SearchResults)
            .await;
        Ok(())
    }

    pub async fn on_deleted(&self, event: &PostDeleted) -> Result<()> {
        if self.index.remove(&event.post_id).await? {
            info!(post_id = %event.post_id, "Removed post from index");
        } else {
            debug!(post_id = %event.post_id, "Post not indexed, nothing to remove");
        }

        self.cache
            .invalidate(&[CacheKey::search_post(&event.post_id)])
            .await;
        self.cache
            .invalidate_namespace(CacheNamespace::SearchResults)
            .await;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for SearchSynchronizer {
    fn name(&self) -> &str {
        "search-synchronizer"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        match PostEvent::from_event(event)? {
            PostEvent::Created(created) => self.on_created(&created).await,
            PostEvent::Deleted(deleted) => self.on_deleted(&deleted).await,
        }
    }
}

/// Removes the media of deleted posts
pub struct MediaSynchronizer {
    media: Arc<dyn MediaRepository>,
    storage: Arc<dyn ObjectStorage>,
    cache: QueryCache,
}

impl MediaSynchronizer {
    pub fn new(
        media: Arc<dyn MediaRepository>,
        storage: Arc<dyn ObjectStorage>,
        cache: QueryCache,
    ) -> Self {
        Self {
            media,
            storage,
            cache,
        }
    }

    /// Delete every media id carried by the event. Records whose stored
    /// object could not be deleted are kept and reported.
    pub async fn on_deleted(&self, event: &PostDeleted) -> Result<()> {
        let mut failed = Vec::new();
        let mut removed = 0usize;

        for media_id in &event.media_ids {
            let Some(media) = self.media.get(media_id).await? else {
                debug!(media_id = %media_id, post_id = %event.post_id, "Media already removed");
                continue;
            };

            if let Err(e) = self.storage.delete(&media.public_id).await {
                warn!(
                    media_id = %media_id,
                    public_id = %media.public_id,
                    error = %e,
                    "Failed to delete stored object"
                );
                failed.push(media_id.clone());
                continue;
            }

            self.media.remove(media_id).await?;
            removed += 1;
        }

        if removed > 0 {
            info!(post_id = %event.post_id, removed, "Deleted media of removed post");
            self.cache
                .invalidate_namespace(CacheNamespace::MediaListings)
                .await;
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(GateError::Handler(format!(
                "Could not delete media {} of post {}",
                failed.join(", "),
                event.post_id
            )))
        }
    }
}

#[async_trait]
impl EventHandler for MediaSynchronizer {
    fn name(&self) -> &str {
        "media-synchronizer"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        match PostEvent::from_event(event)? {
            PostEvent::Deleted(deleted) => self.on_deleted(&deleted).await,
            PostEvent::Created(_) => Ok(()),
        }
    }
}
