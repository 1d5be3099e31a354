//! Storage capabilities for repo-rag.
//!
//! The metadata store is split by owner: [`ChunkStore`] and [`JobStore`]
//! belong to the embedding subsystem, [`SessionStore`] to chat. The
//! [`LexicalIndex`] is maintained on the chunk-write path, and
//! [`VectorStore`] is written only by the Embedding Service.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedding::DistanceMetric;
use crate::error::RagError;
use crate::models::{
    ChatMessage, ChatSession, Chunk, EmbeddingJob, JobStatus, RepositoryChunkCounts,
};

/// A candidate chunk returned from lexical or vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    /// Raw backend score (BM25 or vector similarity). Higher is better.
    pub raw_score: f64,
}

impl ChunkCandidate {
    pub fn new(chunk_id: impl Into<String>, raw_score: f64) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            raw_score,
        }
    }
}

/// Hard pre-conditions on search results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default)]
    pub repository_id: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl SearchFilter {
    pub fn repository(repository_id: impl Into<String>) -> Self {
        Self {
            repository_id: Some(repository_id.into()),
            language: None,
        }
    }

    pub fn matches(&self, repository_id: &str, language: &str) -> bool {
        if let Some(repo) = &self.repository_id {
            if repo != repository_id {
                return false;
            }
        }
        if let Some(lang) = &self.language {
            if !lang.eq_ignore_ascii_case(language) {
                return false;
            }
        }
        true
    }
}

/// Chunk records: the corpus and its embedded-status flags.
///
/// Writes also maintain the lexical index.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert or update chunks by id. An unchanged `content_hash` keeps the
    /// stored `embedded` flag; a changed one clears it.
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    /// Make `chunks` the complete chunk set of one file. Returns the ids of
    /// chunks that were removed.
    async fn replace_file_chunks(
        &self,
        repository_id: &str,
        file_path: &str,
        chunks: &[Chunk],
    ) -> Result<Vec<String>>;

    /// Delete all chunks of one file. Returns the removed ids.
    async fn delete_file(&self, repository_id: &str, file_path: &str) -> Result<Vec<String>>;

    /// Delete all chunks of a repository. Returns the number removed.
    async fn delete_repository(&self, repository_id: &str) -> Result<u64>;

    /// Fetch chunks by id, in the order given. Unknown ids are skipped.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    /// Un-embedded chunks of a repository ordered by file path and start line.
    async fn pending_chunks(&self, repository_id: &str) -> Result<Vec<Chunk>>;

    /// Repositories that have at least one un-embedded chunk, sorted.
    async fn repositories_with_pending(&self) -> Result<Vec<String>>;

    /// Set the embedded flag if the chunk still has `content_hash`.
    ///
    /// Returns `false` when the chunk was deleted or changed meanwhile.
    async fn mark_embedded(&self, chunk_id: &str, content_hash: &str) -> Result<bool>;

    /// Per-repository totals, sorted by repository id.
    async fn chunk_counts(&self, repository_id: Option<&str>)
        -> Result<Vec<RepositoryChunkCounts>>;
}

/// Embedding job records. Never deleted by the pipeline.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &EmbeddingJob) -> Result<()>;
    async fn update_job(&self, job: &EmbeddingJob) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<Option<EmbeddingJob>>;
    /// Jobs ordered by `enqueued_at`, then id.
    async fn list_jobs(
        &self,
        repository_id: Option<&str>,
        status: Option<JobStatus>,
    ) -> Result<Vec<EmbeddingJob>>;
}

/// Partial update of session attributes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionUpdate {
    pub title: Option<String>,
    pub repository_id: Option<String>,
}

/// Chat sessions and their append-only message log.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &ChatSession) -> Result<()>;
    /// Session with its full message sequence.
    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>>;
    /// A user's sessions, most recently updated first, without messages.
    async fn list_sessions(&self, user_id: &str) -> Result<Vec<ChatSession>>;
    async fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<bool>;
    async fn delete_session(&self, id: &str) -> Result<bool>;
    /// Append all `messages` in one atomic step, after any existing ones.
    async fn append_messages(&self, id: &str, messages: &[ChatMessage]) -> Result<()>;
}

/// BM25-style lexical ranking over stored chunk text.
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    async fn lexical_search(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkCandidate>>;
}

/// Shape of the vector collection required by the embedding model.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSpec {
    pub dims: usize,
    pub metric: DistanceMetric,
    pub model: String,
}

impl CollectionSpec {
    /// Check that an existing collection (`self`) can serve `wanted`.
    ///
    /// Dimensions must agree. Models must agree when both sides record one.
    pub fn ensure_compatible(&self, wanted: &CollectionSpec) -> Result<()> {
        if self.dims != wanted.dims {
            return Err(RagError::ProviderMismatch(format!(
                "collection has {} dimensions, model {} produces {}",
                self.dims, wanted.model, wanted.dims
            ))
            .into());
        }
        if !self.model.is_empty() && !wanted.model.is_empty() && self.model != wanted.model {
            return Err(RagError::ProviderMismatch(format!(
                "collection was built with model {}, configured model is {}",
                self.model, wanted.model
            ))
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Created,
    Existing,
}

/// Metadata stored next to each vector, used for filtering and cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPayload {
    pub repository_id: String,
    pub file_path: String,
    pub language: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorPoint {
    /// The chunk id.
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

/// Vector index capability.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if absent. Fails with
    /// [`RagError::ProviderMismatch`](crate::error::RagError::ProviderMismatch)
    /// when an existing collection disagrees with `spec`.
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<CollectionStatus>;
    /// Insert or replace points by id.
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()>;
    /// The `k` nearest points matching `filter`, best first.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkCandidate>>;
    async fn delete(&self, ids: &[String]) -> Result<()>;
    async fn delete_repository(&self, repository_id: &str) -> Result<()>;
    async fn ping(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_scope_and_language() {
        let f = SearchFilter {
            repository_id: Some("r1".into()),
            language: Some("Rust".into()),
        };
        assert!(f.matches("r1", "rust"));
        assert!(!f.matches("r2", "rust"));
        assert!(!f.matches("r1", "python"));
        assert!(SearchFilter::default().matches("any", ""));
    }

    #[test]
    fn collection_compatibility() {
        let built = CollectionSpec {
            dims: 8,
            metric: DistanceMetric::Cosine,
            model: "m1".into(),
        };
        assert!(built.ensure_compatible(&built.clone()).is_ok());
        let other_model = CollectionSpec {
            model: "m2".into(),
            ..built.clone()
        };
        assert!(built.ensure_compatible(&other_model).is_err());
        let unknown_model = CollectionSpec {
            model: String::new(),
            ..built.clone()
        };
        assert!(unknown_model.ensure_compatible(&built).is_ok());
    }
}
