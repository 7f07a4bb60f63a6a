//! Memory Store.
//!
//! An addressable collection of content items published as immutable,
//! versioned snapshots. Writers are serialized; readers clone an
//! `Arc<MemorySnapshot>` and keep a consistent view for as long as they hold it.

mod embedder;
mod tokens;

pub use embedder::{cosine_similarity, tokenize, Embedder, HashingEmbedder, DEFAULT_EMBEDDING_DIMS};
pub use tokens::estimate_tokens;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};

/// A content item available to the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub content: String,
    pub role_tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub embedding: Vec<f32>,
    /// Estimated token cost of `content`
    pub token_count: usize,
}

/// Ingestion input; missing fields are filled in by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMemoryItem {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub role_tags: BTreeSet<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl NewMemoryItem {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.role_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// An immutable view of the store at one version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub version: u64,
    /// Sorted by id
    pub items: Vec<MemoryItem>,
    pub total_tokens: usize,
}

impl MemorySnapshot {
    fn from_map(version: u64, items: BTreeMap<String, MemoryItem>) -> Self {
        let items: Vec<MemoryItem> = items.into_values().collect();
        let total_tokens = items.iter().map(|i| i.token_count).sum();
        Self {
            version,
            items,
            total_tokens,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MemoryItem> {
        self.items
            .binary_search_by(|item| item.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.items[idx])
    }
}

/// Shared, read-mostly memory store.
pub struct MemoryStore {
    embedder: Arc<dyn Embedder>,
    current: RwLock<Arc<MemorySnapshot>>,
}

impl MemoryStore {
    /// Create an empty store at version 0.
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            current: RwLock::new(Arc::new(MemorySnapshot::default())),
        }
    }

    /// Create a store from previously persisted items.
    pub fn from_items(embedder: Arc<dyn Embedder>, version: u64, items: Vec<MemoryItem>) -> Self {
        let map = items.into_iter().map(|i| (i.id.clone(), i)).collect();
        Self {
            embedder,
            current: RwLock::new(Arc::new(MemorySnapshot::from_map(version, map))),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// The current snapshot.
    pub async fn snapshot(&self) -> Arc<MemorySnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Insert or replace items, publishing a new snapshot version.
    ///
    /// Returns the new version.
    pub async fn ingest(&self, items: Vec<NewMemoryItem>) -> EngineResult<u64> {
        let dims = self.embedder.dimensions();
        let mut prepared = Vec::with_capacity(items.len());
        for item in items {
            let embedding = match item.embedding {
                Some(e) if e.len() != dims => {
                    return Err(EngineError::config(format!(
                        "embedding has {} dimensions, store expects {}",
                        e.len(),
                        dims
                    )));
                }
                Some(e) => e,
                None => self.embedder.embed(&item.content),
            };
            prepared.push(MemoryItem {
                id: item
                    .id
                    .unwrap_or_else(|| format!("mem_{}", uuid::Uuid::new_v4())),
                token_count: estimate_tokens(&item.content),
                content: item.content,
                role_tags: item
                    .role_tags
                    .into_iter()
                    .map(|t| t.to_lowercase())
                    .collect(),
                created_at: item.created_at.unwrap_or_else(Utc::now),
                embedding,
            });
        }

        let mut guard = self.current.write().await;
        let mut map: BTreeMap<String, MemoryItem> = guard
            .items
            .iter()
            .map(|i| (i.id.clone(), i.clone()))
            .collect();
        let count = prepared.len();
        for item in prepared {
            debug!(item_id = %item.id, tokens = item.token_count, "Ingesting memory item");
            map.insert(item.id.clone(), item);
        }

        let version = guard.version + 1;
        *guard = Arc::new(MemorySnapshot::from_map(version, map));
        info!(version, ingested = count, total_items = guard.len(), "Memory snapshot published");
        Ok(version)
    }

    /// Remove items by id, publishing a new snapshot version.
    pub async fn remove(&self, ids: &[String]) -> u64 {
        let mut guard = self.current.write().await;
        let mut map: BTreeMap<String, MemoryItem> = guard
            .items
            .iter()
            .map(|i| (i.id.clone(), i.clone()))
            .collect();
        for id in ids {
            map.remove(id);
        }
        let version = guard.version + 1;
        *guard = Arc::new(MemorySnapshot::from_map(version, map));
        info!(version, removed = ids.len(), "Memory snapshot published");
        version
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("dimensions", &self.embedder.dimensions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(HashingEmbedder::new(32)))
    }

    #[tokio::test]
    async fn test_ingest_bumps_version_and_sorts() {
        let store = store();
        let v = store
            .ingest(vec![
                NewMemoryItem::new("second").with_id("b"),
                NewMemoryItem::new("first").with_id("a"),
            ])
            .await
            .unwrap();
        assert_eq!(v, 1);

        let snap = store.snapshot().await;
        assert_eq!(snap.version, 1);
        let ids: Vec<_> = snap.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(snap.get("b").map(|i| i.content.as_str()), Some("second"));
        assert_eq!(snap.items[0].embedding.len(), 32);
    }

    #[tokio::test]
    async fn test_held_snapshot_is_unaffected_by_writes() {
        let store = store();
        store
            .ingest(vec![NewMemoryItem::new("one").with_id("1")])
            .await
            .unwrap();
        let held = store.snapshot().await;

        store
            .ingest(vec![NewMemoryItem::new("two").with_id("2")])
            .await
            .unwrap();
        store.remove(&["1".to_string()]).await;

        assert_eq!(held.version, 1);
        assert_eq!(held.len(), 1);
        let now = store.snapshot().await;
        assert_eq!(now.version, 3);
        assert!(now.get("1").is_none());
        assert!(now.get("2").is_some());
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_lowercases_tags() {
        let store = store();
        store
            .ingest(vec![NewMemoryItem::new("old").with_id("x")])
            .await
            .unwrap();
        store
            .ingest(vec![NewMemoryItem::new("new text")
                .with_id("x")
                .with_tags(["Retriever"])])
            .await
            .unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.len(), 1);
        let item = snap.get("x").unwrap();
        assert_eq!(item.content, "new text");
        assert!(item.role_tags.contains("retriever"));
        assert_eq!(snap.total_tokens, item.token_count);
    }

    #[tokio::test]
    async fn test_wrong_embedding_dimensions_rejected() {
        let store = store();
        let mut item = NewMemoryItem::new("x");
        item.embedding = Some(vec![1.0; 3]);
        let err = store.ingest(vec![item]).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(store.snapshot().await.version, 0);
    }
}
