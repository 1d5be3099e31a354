//! Search Service: vector, lexical and hybrid retrieval over stored chunks.
//!
//! # Modes
//!
//! | Mode | Backends | Fusion weight (vector) |
//! |------|----------|------------------------|
//! | `vector` | vector store | 1.0 |
//! | `lexical` | FTS5 / BM25 index | 0.0 |
//! | `hybrid` | both, concurrently | `retrieval.hybrid_alpha` |
//!
//! Each backend fetches exactly `k` candidates. Filters (repository,
//! language) are applied inside the backends, so excluded chunks never
//! enter ranking. Candidates whose chunk no longer exists are dropped
//! before fusion.
//!
//! # Degraded mode
//!
//! In hybrid mode a failing backend does not fail the request: the other
//! list is ranked alone with full weight and the response carries
//! `degraded: true` and the reason. Only when both backends fail is the
//! request an `IndexUnavailable` error. A `ProviderMismatch` while
//! embedding the query is always returned as an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use repo_rag_core::error::RagError;
use repo_rag_core::models::Chunk;
use repo_rag_core::search::{fuse, FusedCandidate, SearchMode};
use repo_rag_core::store::{ChunkCandidate, ChunkStore, LexicalIndex, SearchFilter};

use crate::config::RetrievalConfig;
use crate::embed_service::EmbeddingService;
use crate::services::AppServices;

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub alpha: f64,
    pub default_k: usize,
    pub max_k: usize,
    pub timeout: Duration,
}

impl From<&RetrievalConfig> for SearchSettings {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            alpha: config.hybrid_alpha,
            default_k: config.default_k,
            max_k: config.max_k,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default)]
    pub repository_id: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl SearchRequest {
    pub fn filter(&self) -> SearchFilter {
        SearchFilter {
            repository_id: self.repository_id.clone(),
            language: self.language.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub repository_id: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub language: String,
    pub content: String,
    pub score: f64,
    pub vector_score: Option<f64>,
    pub lexical_score: Option<f64>,
}

impl SearchHit {
    fn new(fused: FusedCandidate, chunk: Chunk) -> Self {
        Self {
            chunk_id: chunk.id,
            repository_id: chunk.repository_id,
            file_path: chunk.file_path,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            language: chunk.language,
            content: chunk.content,
            score: fused.score,
            vector_score: fused.vector_score,
            lexical_score: fused.lexical_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub mode: SearchMode,
    pub results: Vec<SearchHit>,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

pub struct SearchService {
    embedder: Arc<EmbeddingService>,
    lexical: Arc<dyn LexicalIndex>,
    chunks: Arc<dyn ChunkStore>,
    settings: SearchSettings,
}

impl SearchService {
    pub fn new(
        embedder: Arc<EmbeddingService>,
        lexical: Arc<dyn LexicalIndex>,
        chunks: Arc<dyn ChunkStore>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            embedder,
            lexical,
            chunks,
            settings,
        }
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// `None` → `default_k`; otherwise clamped to `1..=max_k`.
    pub fn effective_k(&self, k: Option<usize>) -> usize {
        k.unwrap_or(self.settings.default_k)
            .clamp(1, self.settings.max_k.max(1))
    }

    /// Nearest chunks to the embedded query, raw similarity scores.
    pub async fn vector_search(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkCandidate>> {
        if !self.embedder.is_enabled() {
            return Err(RagError::IndexUnavailable("embeddings are disabled".into()).into());
        }
        self.with_timeout("vector search", async {
            let vector = self.embedder.embed_query(query).await?;
            self.embedder.vector_store().query(&vector, k, filter).await
        })
        .await
    }

    /// BM25-ranked chunks, raw scores.
    pub async fn lexical_search(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkCandidate>> {
        self.with_timeout("lexical search", self.lexical.lexical_search(query, k, filter))
            .await
    }

    pub async fn hybrid_search(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<SearchResponse> {
        self.search(query, SearchMode::Hybrid, k, filter).await
    }

    pub async fn handle(&self, req: &SearchRequest) -> Result<SearchResponse> {
        let k = self.effective_k(req.k);
        self.search(&req.query, req.mode, k, &req.filter()).await
    }

    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RagError::InvalidInput("query must not be empty".into()).into());
        }
        let k = k.clamp(1, self.settings.max_k.max(1));

        let mut degraded_reason = None;
        let (mut vector, mut lexical, alpha) = match mode {
            SearchMode::Vector => (self.vector_search(query, k, filter).await?, Vec::new(), 1.0),
            SearchMode::Lexical => (Vec::new(), self.lexical_search(query, k, filter).await?, 0.0),
            SearchMode::Hybrid => {
                let (vector, lexical) = tokio::join!(
                    self.vector_search(query, k, filter),
                    self.lexical_search(query, k, filter)
                );
                match (vector, lexical) {
                    (Ok(v), Ok(l)) => (v, l, self.settings.alpha),
                    (Err(e), _) if is_mismatch(&e) => return Err(e),
                    (Err(e), Ok(l)) => {
                        warn!(error = %e, "vector backend unavailable, serving lexical results");
                        degraded_reason = Some(format!("vector search unavailable: {e:#}"));
                        (Vec::new(), l, 0.0)
                    }
                    (Ok(v), Err(e)) => {
                        warn!(error = %e, "lexical backend unavailable, serving vector results");
                        degraded_reason = Some(format!("lexical search unavailable: {e:#}"));
                        (v, Vec::new(), 1.0)
                    }
                    (Err(ve), Err(le)) => {
                        return Err(RagError::IndexUnavailable(format!(
                            "vector: {ve:#}; lexical: {le:#}"
                        ))
                        .into())
                    }
                }
            }
        };

        // Candidates whose chunk is gone must not take a ranking slot.
        let mut live = self.live_chunks(&vector, &lexical, filter).await?;
        vector.retain(|c| live.contains_key(&c.chunk_id));
        lexical.retain(|c| live.contains_key(&c.chunk_id));

        let results: Vec<SearchHit> = fuse(&vector, &lexical, alpha, k)
            .into_iter()
            .filter_map(|f| live.remove(&f.chunk_id).map(|c| SearchHit::new(f, c)))
            .collect();
        debug!(query, mode = mode.as_str(), k, results = results.len(), "search complete");
        Ok(SearchResponse {
            query: query.to_string(),
            mode,
            results,
            degraded: degraded_reason.is_some(),
            degraded_reason,
        })
    }

    /// Stored chunks behind the candidates that still pass `filter`.
    async fn live_chunks(
        &self,
        vector: &[ChunkCandidate],
        lexical: &[ChunkCandidate],
        filter: &SearchFilter,
    ) -> Result<HashMap<String, Chunk>> {
        let mut ids: Vec<String> = vector
            .iter()
            .chain(lexical)
            .map(|c| c.chunk_id.clone())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(self
            .chunks
            .get_chunks(&ids)
            .await?
            .into_iter()
            .filter(|c| filter.matches(&c.repository_id, &c.language))
            .map(|c| (c.id.clone(), c))
            .collect())
    }

    async fn with_timeout<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.settings.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(RagError::IndexUnavailable(format!(
                "{what} timed out after {:?}",
                self.settings.timeout
            ))
            .into()),
        }
    }
}

fn is_mismatch(err: &anyhow::Error) -> bool {
    matches!(RagError::find(err), Some(RagError::ProviderMismatch(_)))
}

/// `rrag search`: run one query and print ranked results.
pub async fn run_search(
    services: &AppServices,
    query: &str,
    mode: &str,
    repository_id: Option<String>,
    language: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    let mode = SearchMode::parse(mode).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown search mode: {}. Use lexical, vector, or hybrid.",
            mode
        )
    })?;
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let request = SearchRequest {
        query: query.to_string(),
        k: limit,
        mode,
        repository_id,
        language,
    };
    let response = services.search.handle(&request).await?;

    if response.degraded {
        println!(
            "(degraded: {})",
            response.degraded_reason.as_deref().unwrap_or("unknown")
        );
    }
    if response.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {}:{}-{}",
            i + 1,
            hit.score,
            hit.repository_id,
            hit.file_path,
            hit.start_line,
            hit.end_line
        );
        if !hit.language.is_empty() {
            println!("    language: {}", hit.language);
        }
        let excerpt: String = hit.content.chars().take(160).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    id: {}", hit.chunk_id);
        println!();
    }
    Ok(())
}
