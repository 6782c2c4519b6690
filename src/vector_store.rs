//! Vector storage abstraction for the semantic memory layer.
//!
//! The [`VectorStore`] trait defines the fixed contract the retrieval
//! engine depends on, enabling pluggable backends (remote vector
//! databases, in-memory). Implementations must be `Send + Sync`.
//!
//! [`InMemoryVectorStore`] is the reference implementation: `HashMap`
//! behind `std::sync::RwLock`, with brute-force cosine similarity over
//! all stored vectors. Thresholding is deliberately *not* done here;
//! that is the retrieval engine's job.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{MeshError, Result};
use crate::models::{ContextChunk, SourceKind, VectorStats};

/// Metadata predicate for [`VectorStore::search_by_metadata`]. All set
/// fields must match.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub source: Option<SourceKind>,
    pub language: Option<String>,
    pub file_path: Option<String>,
    pub tag: Option<String>,
}

impl MetadataFilter {
    fn matches(&self, chunk: &ContextChunk) -> bool {
        if let Some(source) = self.source {
            if chunk.metadata.source != source {
                return false;
            }
        }
        if let Some(language) = &self.language {
            if &chunk.metadata.language != language {
                return false;
            }
        }
        if let Some(path) = &self.file_path {
            if chunk.metadata.file_path.as_deref() != Some(path.as_str()) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !chunk.metadata.tags.contains(tag) {
                return false;
            }
        }
        true
    }
}

/// Abstract vector backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert`](VectorStore::insert) | Idempotent upsert by chunk id |
/// | [`update`](VectorStore::update) | Overwrite an existing chunk |
/// | [`delete`](VectorStore::delete) | Remove a chunk by id |
/// | [`get`](VectorStore::get) | Fetch a chunk by id |
/// | [`similarity_search`](VectorStore::similarity_search) | Top-k cosine candidates |
/// | [`search_by_metadata`](VectorStore::search_by_metadata) | Predicate scan |
/// | [`stats`](VectorStore::stats) | Chunk count and stored size |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert a chunk. Inserting an existing id overwrites it.
    async fn insert(&self, chunk: ContextChunk) -> Result<()>;

    /// Update a stored chunk. Same semantics as [`insert`](VectorStore::insert).
    async fn update(&self, chunk: ContextChunk) -> Result<()>;

    /// Delete a chunk by id. Deleting a missing id is a no-op.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Fetch a chunk by id.
    async fn get(&self, id: &str) -> Result<Option<ContextChunk>>;

    /// Return up to `limit` chunks ranked by cosine similarity to
    /// `vector`, each with its `similarity` field populated. No
    /// threshold is applied.
    async fn similarity_search(&self, vector: &[f32], limit: usize) -> Result<Vec<ContextChunk>>;

    /// Return all chunks matching the metadata filter.
    async fn search_by_metadata(&self, filter: &MetadataFilter) -> Result<Vec<ContextChunk>>;

    /// Point-in-time store statistics.
    async fn stats(&self) -> Result<VectorStats>;
}

/// In-memory vector store for tests and single-process deployments.
pub struct InMemoryVectorStore {
    /// Expected embedding dimensionality; inserts with other lengths fail.
    dims: usize,
    chunks: RwLock<HashMap<String, ContextChunk>>,
}

impl InMemoryVectorStore {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            chunks: RwLock::new(HashMap::new()),
        }
    }

    fn check_dims(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dims {
            // Malformed input, not a backend hiccup.
            return Err(MeshError::VectorStore {
                reason: format!(
                    "embedding has {} dimensions, store expects {}",
                    embedding.len(),
                    self.dims
                ),
                recoverable: false,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(&self, mut chunk: ContextChunk) -> Result<()> {
        self.check_dims(&chunk.embedding)?;
        chunk.similarity = None;
        let mut chunks = self.chunks.write().unwrap();
        chunks.insert(chunk.id.clone(), chunk);
        Ok(())
    }

    async fn update(&self, chunk: ContextChunk) -> Result<()> {
        self.insert(chunk).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut chunks = self.chunks.write().unwrap();
        chunks.remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ContextChunk>> {
        let chunks = self.chunks.read().unwrap();
        Ok(chunks.get(id).cloned())
    }

    async fn similarity_search(&self, vector: &[f32], limit: usize) -> Result<Vec<ContextChunk>> {
        self.check_dims(vector)?;

        let chunks = self.chunks.read().unwrap();
        let mut scored: Vec<ContextChunk> = chunks
            .values()
            .map(|c| {
                let sim = cosine_similarity(vector, &c.embedding).unwrap_or(0.0);
                let mut out = c.clone();
                out.similarity = Some(sim);
                out
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn search_by_metadata(&self, filter: &MetadataFilter) -> Result<Vec<ContextChunk>> {
        let chunks = self.chunks.read().unwrap();
        Ok(chunks.values().filter(|c| filter.matches(c)).cloned().collect())
    }

    async fn stats(&self) -> Result<VectorStats> {
        let chunks = self.chunks.read().unwrap();
        let total_size = chunks
            .values()
            .map(|c| (c.content.len() + c.embedding.len() * 4) as u64)
            .sum();
        Ok(VectorStats {
            total_chunks: chunks.len(),
            total_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmbeddingMetadata;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn chunk(id: &str, embedding: Vec<f32>, language: &str) -> ContextChunk {
        ContextChunk {
            id: id.to_string(),
            content: format!("content of {id}"),
            embedding,
            metadata: EmbeddingMetadata {
                source: SourceKind::Workspace,
                file_path: Some(format!("/src/{id}.rs")),
                function_name: None,
                class_name: None,
                language: language.to_string(),
                tags: BTreeSet::from(["test".to_string()]),
                quality: 80,
                created_at: Utc::now(),
            },
            similarity: None,
        }
    }

    #[tokio::test]
    async fn test_insert_get_roundtrip() {
        let store = InMemoryVectorStore::new(3);
        store.insert(chunk("a", vec![1.0, 0.0, 0.0], "rust")).await.unwrap();
        let got = store.get("a").await.unwrap().unwrap();
        assert_eq!(got.id, "a");
        assert_eq!(got.content, "content of a");
    }

    #[tokio::test]
    async fn test_insert_same_id_overwrites() {
        let store = InMemoryVectorStore::new(3);
        store.insert(chunk("a", vec![1.0, 0.0, 0.0], "rust")).await.unwrap();
        let mut updated = chunk("a", vec![0.0, 1.0, 0.0], "rust");
        updated.content = "rewritten".to_string();
        store.insert(updated).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_chunks, 1);
        let got = store.get("a").await.unwrap().unwrap();
        assert_eq!(got.content, "rewritten");
    }

    #[tokio::test]
    async fn test_insert_wrong_dims_not_recoverable() {
        let store = InMemoryVectorStore::new(3);
        let err = store
            .insert(chunk("a", vec![1.0, 0.0], "rust"))
            .await
            .unwrap_err();
        assert!(!err.recoverable());
    }

    #[tokio::test]
    async fn test_similarity_search_orders_and_populates() {
        let store = InMemoryVectorStore::new(2);
        store.insert(chunk("near", vec![1.0, 0.0], "rust")).await.unwrap();
        store.insert(chunk("mid", vec![0.7, 0.7], "rust")).await.unwrap();
        store.insert(chunk("far", vec![0.0, 1.0], "rust")).await.unwrap();

        let results = store.similarity_search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "near");
        assert_eq!(results[1].id, "mid");
        assert!(results.iter().all(|c| c.similarity.is_some()));
    }

    #[tokio::test]
    async fn test_delete_then_search_excludes() {
        let store = InMemoryVectorStore::new(2);
        store.insert(chunk("a", vec![1.0, 0.0], "rust")).await.unwrap();
        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        let results = store.similarity_search(&[1.0, 0.0], 10).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_filter() {
        let store = InMemoryVectorStore::new(2);
        store.insert(chunk("rs", vec![1.0, 0.0], "rust")).await.unwrap();
        store.insert(chunk("ts", vec![0.0, 1.0], "typescript")).await.unwrap();

        let filter = MetadataFilter {
            language: Some("rust".to_string()),
            ..Default::default()
        };
        let results = store.search_by_metadata(&filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "rs");

        let filter = MetadataFilter {
            tag: Some("missing".to_string()),
            ..Default::default()
        };
        assert!(store.search_by_metadata(&filter).await.unwrap().is_empty());
    }
}
