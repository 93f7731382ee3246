//! Query cache with typed keys.
//!
//! Every cached query class is a `CacheKey` variant; the rendered string is
//! derived from the variant's fields only, so two different queries can
//! never share a key. Listing classes live under a `CacheNamespace` prefix
//! and are invalidated wholesale.

use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{error::Result, metrics::Metrics, store::KeyValueStore};

const SHORT_TTL: Duration = Duration::from_secs(300);
const SEARCH_TTL: Duration = Duration::from_secs(600);

/// Prefix-invalidated groups of cache entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
    PostListings,
    SearchResults,
    MediaListings,
}

impl CacheNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            CacheNamespace::PostListings => "posts:",
            CacheNamespace::SearchResults => "search:q:",
            CacheNamespace::MediaListings => "media:list:",
        }
    }
}

/// Key of one cached query result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A single post from the primary store
    Post { id: String },
    /// One page of the post listing
    PostListing { page: u32, limit: u32 },
    /// Search results for a normalized query
    Search { query: String },
    /// A single derived search document
    SearchPost { id: String },
    /// Every media record
    MediaListing,
}

impl CacheKey {
    pub fn post(id: &str) -> Self {
        CacheKey::Post { id: id.to_string() }
    }

    pub fn post_listing(page: u32, limit: u32) -> Self {
        CacheKey::PostListing { page, limit }
    }

    /// Queries differing only in case or spacing share an entry
    pub fn search(query: &str) -> Self {
        let query = query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        CacheKey::Search { query }
    }

    pub fn search_post(id: &str) -> Self {
        CacheKey::SearchPost { id: id.to_string() }
    }

    pub fn render(&self) -> String {
        match self {
            CacheKey::Post { id } => format!("post:{}", id),
            CacheKey::PostListing { page, limit } => {
                format!("{}{}:{}", CacheNamespace::PostListings.prefix(), page, limit)
            }
            CacheKey::Search { query } => {
                format!("{}{}", CacheNamespace::SearchResults.prefix(), query)
            }
            CacheKey::SearchPost { id } => format!("search:post:{}", id),
            CacheKey::MediaListing => format!("{}all", CacheNamespace::MediaListings.prefix()),
        }
    }

    /// Metric label for the key class
    pub fn class(&self) -> &'static str {
        match self {
            CacheKey::Post { .. } => "post",
            CacheKey::PostListing { .. } => "post_listing",
            CacheKey::Search { .. } => "search",
            CacheKey::SearchPost { .. } => "search_post",
            CacheKey::MediaListing => "media_listing",
        }
    }

    pub fn ttl(&self) -> Duration {
        match self {
            CacheKey::Search { .. } | CacheKey::SearchPost { .. } => SEARCH_TTL,
            _ => SHORT_TTL,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Read-through cache over a `KeyValueStore`.
///
/// Cache failures are never request failures: a store error on read is a
/// miss, a store error on write or invalidation is logged. Concurrent
/// misses for one key may compute the value more than once.
#[derive(Clone)]
pub struct QueryCache {
    store: Arc<dyn KeyValueStore>,
    metrics: Arc<Metrics>,
}

impl QueryCache {
    pub fn new(store: Arc<dyn KeyValueStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let rendered = key.render();
        let cached = match self.store.get(&rendered).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(key = %rendered, error = %e, "Cache read failed");
                None
            }
        };

        let value = cached.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %rendered, error = %e, "Discarding undecodable cache entry");
                None
            }
        });

        match value {
            Some(_) => self.metrics.record_cache_hit(key.class()),
            None => self.metrics.record_cache_miss(key.class()),
        }
        value
    }

    pub async fn put<T: Serialize>(&self, key: &CacheKey, value: &T) {
        let rendered = key.render();
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %rendered, error = %e, "Failed to encode cache entry");
                return;
            }
        };

        if let Err(e) = self.store.set(&rendered, &raw, key.ttl()).await {
            warn!(key = %rendered, error = %e, "Cache write failed");
        }
    }

    /// Serve from cache, or compute and populate on a miss
    pub async fn get_or_compute<T, F, Fut>(&self, key: &CacheKey, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.get(key).await {
            debug!(key = %key, "Cache hit");
            return Ok(value);
        }

        let value = compute().await?;
        self.put(key, &value).await;
        Ok(value)
    }

    /// Delete specific entries
    pub async fn invalidate(&self, keys: &[CacheKey]) {
        if keys.is_empty() {
            return;
        }

        let rendered: Vec<String> = keys.iter().map(CacheKey::render).collect();
        match self.store.delete(&rendered).await {
            Ok(deleted) => {
                debug!(keys = ?rendered, deleted, "Invalidated cache entries");
                for key in keys {
                    self.metrics.record_cache_invalidation(key.class(), 1);
                }
            }
            Err(e) => warn!(keys = ?rendered, error = %e, "Cache invalidation failed"),
        }
    }

    /// Delete every entry in a namespace
    pub async fn invalidate_namespace(&self, namespace: CacheNamespace) {
        let prefix = namespace.prefix();
        match self.store.delete_prefix(prefix).await {
            Ok(deleted) => {
                debug!(prefix, deleted, "Invalidated cache namespace");
                self.metrics.record_cache_invalidation(prefix, deleted);
            }
            Err(e) => warn!(prefix, error = %e, "Cache namespace invalidation failed"),
        }
    }
}
