//! Record stores and collaborators consumed by the services.
//!
//! Each capability is a trait so deployments can plug in a database or an
//! object store; the in-memory implementations back single-process runs
//! and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

use crate::{
    error::{GateError, Result},
    events::PostCreated,
};

/// A post in the primary record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub media_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Derived, search-optimized copy of a post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocument {
    pub post_id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<&PostCreated> for SearchDocument {
    fn from(event: &PostCreated) -> Self {
        Self {
            post_id: event.post_id.clone(),
            user_id: event.user_id.clone(),
            content: event.content.clone(),
            created_at: event.created_at,
        }
    }
}

/// Metadata of an uploaded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub id: String,
    pub public_id: String,
    pub original_name: String,
    pub mime_type: String,
    pub url: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Result of storing an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub public_id: String,
    pub url: String,
}

/// Primary store for posts. Reads observe the caller's own writes.
#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn insert(&self, post: Post) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Post>>;

    /// Newest first
    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<Post>>;

    async fn count(&self) -> Result<usize>;

    /// Delete a post owned by `user_id`, returning it
    async fn delete_owned(&self, id: &str, user_id: &str) -> Result<Option<Post>>;
}

/// Read model queried by the search role
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Returns false when a document for the post already exists
    async fn insert_if_absent(&self, document: SearchDocument) -> Result<bool>;

    /// Returns false when there was nothing to remove
    async fn remove(&self, post_id: &str) -> Result<bool>;

    async fn get(&self, post_id: &str) -> Result<Option<SearchDocument>>;

    /// Documents matching any query term, best match first
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchDocument>>;
}

/// Media records owned by the media role
#[async_trait]
pub trait MediaRepository: Send + Sync {
    async fn insert(&self, media: Media) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Media>>;

    async fn remove(&self, id: &str) -> Result<Option<Media>>;

    /// Newest first
    async fn list(&self) -> Result<Vec<Media>>;
}

/// External blob storage
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, file_name: &str, mime_type: &str, bytes: Vec<u8>) -> Result<StoredObject>;

    /// Deleting an unknown id succeeds
    async fn delete(&self, public_id: &str) -> Result<()>;
}

fn newest_first<T>(items: &mut [T], created_at: impl Fn(&T) -> (DateTime<Utc>, &str)) {
    items.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
}

#[derive(Default)]
pub struct InMemoryPostRepository {
    posts: RwLock<HashMap<String, Post>>,
}

impl InMemoryPostRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PostRepository for InMemoryPostRepository {
    async fn insert(&self, post: Post) -> Result<()> {
        let mut posts = self.posts.write().await;
        if posts.contains_key(&post.id) {
            return Err(GateError::Validation(format!("Post {} already exists", post.id)));
        }
        posts.insert(post.id.clone(), post);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Post>> {
        Ok(self.posts.read().await.get(id).cloned())
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<Post>> {
        let mut posts: Vec<Post> = self.posts.read().await.values().cloned().collect();
        newest_first(&mut posts, |p| (p.created_at, p.id.as_str()));
        Ok(posts.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.posts.read().await.len())
    }

    async fn delete_owned(&self, id: &str, user_id: &str) -> Result<Option<Post>> {
        let mut posts = self.posts.write().await;
        match posts.get(id) {
            Some(post) if post.user_id == user_id => Ok(posts.remove(id)),
            _ => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct InMemorySearchIndex {
    documents: RwLock<HashMap<String, SearchDocument>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

/// Lowercased alphanumeric words of `text`
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
}

/// Number of whole-word occurrences of any term in `content`
fn score(content: &str, terms: &[String]) -> usize {
    words(content).filter(|word| terms.contains(word)).count()
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn insert_if_absent(&self, document: SearchDocument) -> Result<bool> {
        let mut documents = self.documents.write().await;
        if documents.contains_key(&document.post_id) {
            return Ok(false);
        }
        documents.insert(document.post_id.clone(), document);
        Ok(true)
    }

    async fn remove(&self, post_id: &str) -> Result<bool> {
        Ok(self.documents.write().await.remove(post_id).is_some())
    }

    async fn get(&self, post_id: &str) -> Result<Option<SearchDocument>> {
        Ok(self.documents.read().await.get(post_id).cloned())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchDocument>> {
        let terms: Vec<String> = words(query).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let documents = self.documents.read().await;
        let mut hits: Vec<(usize, &SearchDocument)> = documents
            .values()
            .map(|doc| (score(&doc.content, &terms), doc))
            .filter(|(score, _)| *score > 0)
            .collect();

        hits.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .cmp(score_a)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.post_id.cmp(&a.post_id))
        });

        Ok(hits.into_iter().take(limit).map(|(_, doc)| doc.clone()).collect())
    }
}

#[derive(Default)]
pub struct InMemoryMediaRepository {
    media: RwLock<HashMap<String, Media>>,
}

impl InMemoryMediaRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaRepository for InMemoryMediaRepository {
    async fn insert(&self, media: Media) -> Result<()> {
        self.media.write().await.insert(media.id.clone(), media);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Media>> {
        Ok(self.media.read().await.get(id).cloned())
    }

    async fn remove(&self, id: &str) -> Result<Option<Media>> {
        Ok(self.media.write().await.remove(id))
    }

    async fn list(&self) -> Result<Vec<Media>> {
        let mut media: Vec<Media> = self.media.read().await.values().cloned().collect();
        newest_first(&mut media, |m| (m.created_at, m.id.as_str()));
        Ok(media)
    }
}

/// Object storage held in process memory
pub struct InMemoryObjectStorage {
    base_url: String,
    objects: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl InMemoryObjectStorage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub async fn contains(&self, public_id: &str) -> bool {
        self.objects.read().await.contains_key(public_id)
    }
}

impl Default for InMemoryObjectStorage {
    fn default() -> Self {
        Self::new("memory://media")
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn upload(&self, file_name: &str, _mime_type: &str, bytes: Vec<u8>) -> Result<StoredObject> {
        if bytes.is_empty() {
            return Err(GateError::Validation("File is empty".to_string()));
        }

        let public_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}/{}/{}", self.base_url, public_id, file_name);
        self.objects
            .write()
            .await
            .insert(public_id.clone(), Arc::new(bytes));

        Ok(StoredObject { public_id, url })
    }

    async fn delete(&self, public_id: &str) -> Result<()> {
        self.objects.write().await.remove(public_id);
        Ok(())
    }
}
