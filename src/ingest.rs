//! Chunk ingestion.
//!
//! Chunks are produced outside this crate (a file walker, a git hook, a
//! tree-sitter chunker). The ingestor takes their tuples, derives stable
//! ids and content hashes, replaces each touched file's chunk set, and
//! hands the repository to the embedding pipeline.
//!
//! Replacing a file removes chunks that are no longer produced for it,
//! together with their vectors. Re-ingesting an unchanged file is a no-op
//! for embedding: the content hash is unchanged, so the chunk stays embedded.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use repo_rag_core::error::RagError;
use repo_rag_core::models::{Chunk, ChunkInput};
use repo_rag_core::store::ChunkStore;

use crate::embed_service::EmbeddingService;
use crate::pipeline::{EmbeddingPipeline, QueueOutcome};
use crate::services::AppServices;

fn default_queue() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub chunks: Vec<ChunkInput>,
    /// Files deleted from the repository since the last ingest.
    #[serde(default)]
    pub removed_files: Vec<String>,
    /// Queue the repository for embedding afterwards.
    #[serde(default = "default_queue")]
    pub queue: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub repository_id: String,
    pub files: usize,
    pub chunks: usize,
    pub removed_chunks: usize,
    pub removed_files: usize,
    pub queued: Option<QueueOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub repository_id: String,
    pub chunks_deleted: u64,
}

pub struct Ingestor {
    chunks: Arc<dyn ChunkStore>,
    embedder: Arc<EmbeddingService>,
    pipeline: Arc<EmbeddingPipeline>,
}

impl Ingestor {
    pub fn new(
        chunks: Arc<dyn ChunkStore>,
        embedder: Arc<EmbeddingService>,
        pipeline: Arc<EmbeddingPipeline>,
    ) -> Self {
        Self {
            chunks,
            embedder,
            pipeline,
        }
    }

    /// Store one batch of extractor output for `repository_id`.
    ///
    /// Every file named in `req.chunks` gets exactly the chunks listed for
    /// it; files not named are left alone unless listed in `removed_files`.
    pub async fn ingest_chunks(&self, repository_id: &str, req: IngestRequest) -> Result<IngestReport> {
        let repository_id = repository_id.trim();
        if repository_id.is_empty() {
            return Err(RagError::InvalidInput("repository id must not be empty".into()).into());
        }

        let mut by_file: BTreeMap<String, BTreeMap<String, Chunk>> = BTreeMap::new();
        for input in req.chunks {
            validate_input(&input)?;
            let chunk = Chunk::from_input(repository_id, input);
            // Same location twice: the later tuple wins.
            by_file
                .entry(chunk.file_path.clone())
                .or_default()
                .insert(chunk.id.clone(), chunk);
        }

        let mut removed_ids = Vec::new();
        let mut total = 0;
        for (file_path, chunks) in &by_file {
            let chunks: Vec<Chunk> = chunks.values().cloned().collect();
            total += chunks.len();
            let removed = self
                .chunks
                .replace_file_chunks(repository_id, file_path, &chunks)
                .await
                .with_context(|| format!("storing chunks of {file_path}"))?;
            removed_ids.extend(removed);
        }

        let mut removed_files = 0;
        for file_path in &req.removed_files {
            if by_file.contains_key(file_path) {
                continue;
            }
            let removed = self
                .chunks
                .delete_file(repository_id, file_path)
                .await
                .with_context(|| format!("deleting chunks of {file_path}"))?;
            if !removed.is_empty() {
                removed_files += 1;
            }
            removed_ids.extend(removed);
        }

        if !removed_ids.is_empty() {
            // Vectors left behind on failure are skipped by search until
            // the next repository delete.
            if let Err(e) = self.embedder.remove_vectors(&removed_ids).await {
                warn!(repository_id, chunks = removed_ids.len(), error = %e, "could not delete vectors of removed chunks");
            }
        }

        let queued = if req.queue && self.embedder.is_enabled() {
            match self.pipeline.queue_repository(repository_id).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(repository_id, error = %e, "could not queue repository for embedding");
                    None
                }
            }
        } else {
            None
        };

        info!(
            repository_id,
            files = by_file.len(),
            chunks = total,
            removed_chunks = removed_ids.len(),
            "ingested chunks"
        );
        Ok(IngestReport {
            repository_id: repository_id.to_string(),
            files: by_file.len(),
            chunks: total,
            removed_chunks: removed_ids.len(),
            removed_files,
            queued,
        })
    }

    /// Remove every chunk, lexical entry and vector of a repository.
    pub async fn delete_repository(&self, repository_id: &str) -> Result<DeleteReport> {
        self.embedder
            .delete_repository(repository_id)
            .await
            .with_context(|| format!("deleting vectors of {repository_id}"))?;
        let chunks_deleted = self.chunks.delete_repository(repository_id).await?;
        info!(repository_id, chunks = chunks_deleted, "repository deleted");
        Ok(DeleteReport {
            repository_id: repository_id.to_string(),
            chunks_deleted,
        })
    }
}

fn validate_input(input: &ChunkInput) -> Result<()> {
    if input.file_path.trim().is_empty() {
        return Err(RagError::InvalidInput("chunk file_path must not be empty".into()).into());
    }
    if input.start_line == 0 || input.end_line < input.start_line {
        return Err(RagError::InvalidInput(format!(
            "{}: invalid line range {}-{}",
            input.file_path, input.start_line, input.end_line
        ))
        .into());
    }
    Ok(())
}

/// Either a bare array of chunk tuples or a full request object.
#[derive(Deserialize)]
#[serde(untagged)]
enum IngestFile {
    Request(IngestRequest),
    Chunks(Vec<ChunkInput>),
}

/// `rrag ingest`: load extractor output from a JSON file.
pub async fn run_ingest(services: &AppServices, path: &Path, repository_id: &str) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let parsed: IngestFile = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let mut req = match parsed {
        IngestFile::Request(r) => r,
        IngestFile::Chunks(chunks) => IngestRequest {
            chunks,
            removed_files: Vec::new(),
            queue: false,
        },
    };
    // Jobs are created by `rrag embed pending` or a running server.
    req.queue = false;

    let report = services.ingest.ingest_chunks(repository_id, req).await?;
    println!(
        "Ingested {} chunks across {} files into '{}'",
        report.chunks, report.files, report.repository_id
    );
    if report.removed_chunks > 0 {
        println!(
            "  removed {} stale chunks ({} deleted files)",
            report.removed_chunks, report.removed_files
        );
    }
    println!("Run `rrag embed pending --repo {repository_id}` to embed new chunks.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed_service::EmbedSettings;
    use crate::embedding::HashingProvider;
    use crate::pipeline::PipelineSettings;
    use crate::rate_limit::RateLimiter;
    use repo_rag_core::embedding::DistanceMetric;
    use repo_rag_core::store::memory::{InMemoryStore, InMemoryVectorStore};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn input(path: &str, start: u32, end: u32, text: &str) -> ChunkInput {
        ChunkInput {
            file_path: path.into(),
            start_line: start,
            end_line: end,
            text: text.into(),
            language: "rust".into(),
            content_hash: None,
        }
    }

    fn request(chunks: Vec<ChunkInput>, removed: &[&str]) -> IngestRequest {
        IngestRequest {
            chunks,
            removed_files: removed.iter().map(|s| s.to_string()).collect(),
            queue: false,
        }
    }

    fn fixture() -> (Ingestor, Arc<InMemoryStore>, Arc<InMemoryVectorStore>, Arc<EmbeddingService>) {
        let store = Arc::new(InMemoryStore::new());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let embedder = Arc::new(EmbeddingService::new(
            Arc::new(HashingProvider::new("hash", 16)),
            vectors.clone(),
            store.clone(),
            Arc::new(RateLimiter::unlimited()),
            EmbedSettings::from(&crate::config::EmbeddingConfig::default()),
            DistanceMetric::Cosine,
        ));
        let pipeline = EmbeddingPipeline::new(
            embedder.clone(),
            store.clone(),
            store.clone(),
            PipelineSettings {
                workers: 1,
                max_attempts: 1,
                retry_backoff: Duration::from_millis(1),
                shutdown_timeout: Duration::from_secs(1),
                sweep_interval: None,
                resume_on_start: false,
            },
        );
        (
            Ingestor::new(store.clone(), embedder.clone(), pipeline),
            store,
            vectors,
            embedder,
        )
    }

    #[tokio::test]
    async fn replacing_a_file_drops_stale_chunks_and_vectors() {
        let (ingestor, store, vectors, embedder) = fixture();
        let first = request(
            vec![
                input("src/a.rs", 1, 10, "fn a() {}"),
                input("src/a.rs", 11, 20, "fn b() {}"),
                input("src/b.rs", 1, 5, "fn c() {}"),
            ],
            &[],
        );
        let report = ingestor.ingest_chunks("repo", first).await.unwrap();
        assert_eq!((report.files, report.chunks), (2, 3));

        let pending = store.pending_chunks("repo").await.unwrap();
        embedder
            .embed_chunks(&pending, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(vectors.len(), 3);

        // a.rs shrinks to one chunk with unchanged text.
        let second = request(vec![input("src/a.rs", 1, 10, "fn a() {}")], &["src/b.rs"]);
        let report = ingestor.ingest_chunks("repo", second).await.unwrap();
        assert_eq!(report.removed_chunks, 2);
        assert_eq!(report.removed_files, 1);
        assert_eq!(vectors.len(), 1);

        let counts = store.chunk_counts(Some("repo")).await.unwrap();
        assert_eq!((counts[0].total, counts[0].embedded), (1, 1));
    }

    #[tokio::test]
    async fn rejects_invalid_line_ranges() {
        let (ingestor, _, _, _) = fixture();
        let err = ingestor
            .ingest_chunks("repo", request(vec![input("x.rs", 5, 2, "x")], &[]))
            .await
            .unwrap_err();
        assert!(matches!(RagError::find(&err), Some(RagError::InvalidInput(_))));
        assert!(ingestor.ingest_chunks("  ", request(vec![], &[])).await.is_err());
    }

    #[tokio::test]
    async fn queue_flag_creates_jobs() {
        let (ingestor, _, _, _) = fixture();
        let mut req = request(vec![input("src/a.rs", 1, 3, "fn a() {}")], &[]);
        req.queue = true;
        let report = ingestor.ingest_chunks("repo", req).await.unwrap();
        assert!(matches!(report.queued, Some(QueueOutcome::Accepted { chunks: 1, .. })));
    }

    #[tokio::test]
    async fn delete_repository_removes_chunks_and_vectors() {
        let (ingestor, store, vectors, embedder) = fixture();
        ingestor
            .ingest_chunks("repo", request(vec![input("a.rs", 1, 2, "alpha beta")], &[]))
            .await
            .unwrap();
        ingestor
            .ingest_chunks("other", request(vec![input("a.rs", 1, 2, "alpha beta")], &[]))
            .await
            .unwrap();
        for repo in ["repo", "other"] {
            let pending = store.pending_chunks(repo).await.unwrap();
            embedder
                .embed_chunks(&pending, &CancellationToken::new())
                .await
                .unwrap();
        }

        let report = ingestor.delete_repository("repo").await.unwrap();
        assert_eq!(report.chunks_deleted, 1);
        assert_eq!(vectors.len(), 1);
        assert_eq!(store.chunk_counts(None).await.unwrap().len(), 1);
    }

    #[test]
    fn ingest_file_accepts_bare_arrays() {
        let bare = r#"[{"file_path":"a.rs","start_line":1,"end_line":2,"text":"x"}]"#;
        assert!(matches!(
            serde_json::from_str::<IngestFile>(bare).unwrap(),
            IngestFile::Chunks(c) if c.len() == 1
        ));
        let full = r#"{"chunks":[],"removed_files":["gone.rs"]}"#;
        match serde_json::from_str::<IngestFile>(full).unwrap() {
            IngestFile::Request(r) => {
                assert_eq!(r.removed_files, vec!["gone.rs"]);
                assert!(r.queue);
            }
            IngestFile::Chunks(_) => panic!("expected a request object"),
        }
    }
}
