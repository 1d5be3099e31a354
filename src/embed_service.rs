//! Embedding Service: chunk batches in, vector-store state out.
//!
//! This is the only writer of vectors and of the chunk `embedded` flag.
//!
//! # Batching
//!
//! Chunks are packed in order into batches bounded by `max_batch_size`
//! and `max_batch_bytes`. A single chunk larger than the byte budget is
//! sent on its own.
//!
//! # Failure handling
//!
//! | Error | Policy |
//! |-------|--------|
//! | `ProviderUnavailable` | retried with exponential backoff, up to `max_retries` |
//! | `ProviderRejected` / malformed response | batch is split in halves until the poison chunk is isolated |
//! | wrong vector dimensions | `ProviderMismatch`, fails the whole call |
//! | vector upsert failure | retried once, then the batch's chunks are reported failed |
//!
//! A chunk deleted while its batch was in flight has its fresh vector
//! removed again, so no vector outlives its chunk.
//!
//! Chunks the chunk store already records as embedded with the same
//! content hash are skipped, whatever flag the caller's copy carries. The
//! store clears that flag whenever the content hash changes, so unchanged
//! chunks are never re-embedded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use repo_rag_core::embedding::{DistanceMetric, EmbeddingProvider};
use repo_rag_core::error::RagError;
use repo_rag_core::models::Chunk;
use repo_rag_core::store::{
    ChunkStore, CollectionSpec, CollectionStatus, VectorPayload, VectorPoint, VectorStore,
};

use crate::config::EmbeddingConfig;
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone)]
pub struct EmbedSettings {
    pub max_batch_size: usize,
    pub max_batch_bytes: usize,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub timeout: Duration,
}

impl From<&EmbeddingConfig> for EmbedSettings {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            max_batch_bytes: config.max_batch_bytes.max(1),
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkFailure {
    pub chunk_id: String,
    pub reason: String,
    /// A later attempt may succeed (provider or index was unavailable).
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmbedReport {
    pub embedded: usize,
    /// Already embedded with the current content hash.
    pub skipped: usize,
    pub failures: Vec<ChunkFailure>,
}

impl EmbedReport {
    /// `PartialBatchFailure` summary when any chunk failed.
    pub fn partial_failure(&self) -> Option<RagError> {
        if self.failures.is_empty() {
            return None;
        }
        Some(RagError::PartialBatchFailure {
            failed: self.failures.len(),
            total: self.embedded + self.failures.len(),
        })
    }

    pub fn has_retryable_failures(&self) -> bool {
        self.failures.iter().any(|f| f.retryable)
    }
}

pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    chunks: Arc<dyn ChunkStore>,
    limiter: Arc<RateLimiter>,
    settings: EmbedSettings,
    metric: DistanceMetric,
    collection_ready: AtomicBool,
}

impl EmbeddingService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        chunks: Arc<dyn ChunkStore>,
        limiter: Arc<RateLimiter>,
        settings: EmbedSettings,
        metric: DistanceMetric,
    ) -> Self {
        Self {
            provider,
            vectors,
            chunks,
            limiter,
            settings,
            metric,
            collection_ready: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &EmbedSettings {
        &self.settings
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn vector_store(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    /// False when the configured provider is `disabled`.
    pub fn is_enabled(&self) -> bool {
        self.provider.dims() > 0
    }

    pub fn is_collection_ready(&self) -> bool {
        self.collection_ready.load(Ordering::SeqCst)
    }

    /// Ensure the collection exists with the model's dimensions and metric.
    ///
    /// Idempotent. Fails with `ProviderMismatch` when an existing collection
    /// disagrees with the configured model.
    pub async fn initialize_collection(&self) -> Result<CollectionStatus> {
        let dims = self.provider.dims();
        if dims == 0 {
            return Err(RagError::InvalidInput("embedding provider is disabled".into()).into());
        }
        let spec = CollectionSpec {
            dims,
            metric: self.metric,
            model: self.provider.model_name().to_string(),
        };
        let status = self.vectors.ensure_collection(&spec).await?;
        self.collection_ready.store(true, Ordering::SeqCst);
        info!(model = %spec.model, dims, metric = spec.metric.as_str(), ?status, "vector collection ready");
        Ok(status)
    }

    async fn ensure_ready(&self) -> Result<()> {
        if !self.is_collection_ready() {
            self.initialize_collection().await?;
        }
        Ok(())
    }

    /// Embed `chunks` and upsert their vectors.
    ///
    /// Per-chunk failures are returned in the report. The call itself fails
    /// only on `ProviderMismatch`, an unreachable collection, or cancellation.
    pub async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<EmbedReport> {
        let mut report = EmbedReport::default();
        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let stored: HashMap<String, Chunk> = self
            .chunks
            .get_chunks(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        let pending: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| {
                !stored
                    .get(&c.id)
                    .is_some_and(|s| s.embedded && s.content_hash == c.content_hash)
            })
            .collect();
        report.skipped = chunks.len() - pending.len();
        if pending.is_empty() {
            return Ok(report);
        }
        self.ensure_ready().await?;

        let batches = plan_batches(
            &pending,
            self.settings.max_batch_size,
            self.settings.max_batch_bytes,
        );
        for batch in batches {
            self.embed_batch(batch, cancel, &mut report).await?;
        }

        if let Some(partial) = report.partial_failure() {
            warn!(error = %partial, "embedding finished with failures");
        }
        Ok(report)
    }

    /// Embed one planned batch, splitting it on rejection.
    async fn embed_batch(
        &self,
        batch: Vec<&Chunk>,
        cancel: &CancellationToken,
        report: &mut EmbedReport,
    ) -> Result<()> {
        let mut work = vec![batch];
        while let Some(part) = work.pop() {
            match self.request_vectors(&part, cancel).await {
                Ok(vectors) => self.store_vectors(&part, vectors, report).await?,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Err(e);
                    }
                    match RagError::find(&e) {
                        Some(RagError::ProviderMismatch(_)) => return Err(e),
                        Some(RagError::ProviderUnavailable(_)) => {
                            fail_all(report, &part, &e, true);
                        }
                        _ if part.len() > 1 => {
                            debug!(size = part.len(), error = %e, "splitting rejected batch");
                            let right = part[part.len() / 2..].to_vec();
                            let left = part[..part.len() / 2].to_vec();
                            // Left half first.
                            work.push(right);
                            work.push(left);
                        }
                        _ => {
                            warn!(chunk_id = %part[0].id, error = %e, "chunk rejected by embedding provider");
                            fail_all(report, &part, &e, false);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// One provider call with retry, timeout, rate limiting and dims check.
    async fn request_vectors(
        &self,
        batch: &[&Chunk],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => bail!("embedding cancelled"),
                r = self.call_provider(&texts) => r,
            };
            match result {
                Ok(vectors) => {
                    self.check_vectors(texts.len(), &vectors)?;
                    return Ok(vectors);
                }
                Err(e) if RagError::is_retryable(&e) && attempt < self.settings.max_retries => {
                    let delay = self.settings.retry_base * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "embedding request failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => bail!("embedding cancelled"),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_provider(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.limiter.acquire().await;
        match tokio::time::timeout(self.settings.timeout, self.provider.embed(texts)).await {
            Ok(result) => result,
            Err(_) => Err(RagError::ProviderUnavailable(format!(
                "embedding request timed out after {:?}",
                self.settings.timeout
            ))
            .into()),
        }
    }

    fn check_vectors(&self, expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
        if vectors.len() != expected {
            bail!(
                "embedding provider returned {} vectors for {} inputs",
                vectors.len(),
                expected
            );
        }
        let dims = self.provider.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(RagError::ProviderMismatch(format!(
                "model {} returned {} dimensions, expected {}",
                self.provider.model_name(),
                bad.len(),
                dims
            ))
            .into());
        }
        Ok(())
    }

    /// Upsert vectors (retried once) and mark the chunks embedded.
    async fn store_vectors(
        &self,
        batch: &[&Chunk],
        vectors: Vec<Vec<f32>>,
        report: &mut EmbedReport,
    ) -> Result<()> {
        let points: Vec<VectorPoint> = batch
            .iter()
            .zip(vectors)
            .map(|(c, vector)| VectorPoint {
                id: c.id.clone(),
                vector,
                payload: VectorPayload {
                    repository_id: c.repository_id.clone(),
                    file_path: c.file_path.clone(),
                    language: c.language.clone(),
                    content_hash: c.content_hash.clone(),
                },
            })
            .collect();

        if let Err(first) = self.vectors.upsert(&points).await {
            if matches!(RagError::find(&first), Some(RagError::ProviderMismatch(_))) {
                return Err(first);
            }
            warn!(error = %first, "vector upsert failed, retrying once");
            if let Err(second) = self.vectors.upsert(&points).await {
                fail_all(report, batch, &second, true);
                return Ok(());
            }
        }

        let mut stale = Vec::new();
        for c in batch {
            if self.chunks.mark_embedded(&c.id, &c.content_hash).await? {
                report.embedded += 1;
            } else {
                stale.push(c.id.clone());
            }
        }
        if !stale.is_empty() {
            self.drop_orphans(stale).await?;
        }
        Ok(())
    }

    /// Delete vectors just written for chunks that were removed meanwhile.
    /// Changed chunks stay pending and get their vector replaced later.
    async fn drop_orphans(&self, stale: Vec<String>) -> Result<()> {
        let alive: Vec<String> = self
            .chunks
            .get_chunks(&stale)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        if !alive.is_empty() {
            debug!(count = alive.len(), "chunks changed while embedding; left pending");
        }
        let orphans: Vec<String> = stale.into_iter().filter(|id| !alive.contains(id)).collect();
        if orphans.is_empty() {
            return Ok(());
        }
        debug!(count = orphans.len(), "chunks deleted while embedding; removing their vectors");
        if let Err(e) = self.vectors.delete(&orphans).await {
            warn!(error = %e, count = orphans.len(), "could not remove vectors of deleted chunks");
        }
        Ok(())
    }

    /// Embed a search query with the corpus model. Single attempt.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let vectors = self.call_provider(&texts).await?;
        self.check_vectors(1, &vectors)?;
        Ok(vectors.into_iter().next().unwrap_or_default())
    }

    pub async fn remove_vectors(&self, ids: &[String]) -> Result<()> {
        self.vectors.delete(ids).await
    }

    pub async fn delete_repository(&self, repository_id: &str) -> Result<()> {
        self.vectors.delete_repository(repository_id).await
    }
}

fn fail_all(report: &mut EmbedReport, chunks: &[&Chunk], err: &anyhow::Error, retryable: bool) {
    let reason = format!("{err:#}");
    report
        .failures
        .extend(chunks.iter().map(|c| ChunkFailure {
            chunk_id: c.id.clone(),
            reason: reason.clone(),
            retryable,
        }));
}

/// Pack chunks, in order, into batches within both limits.
pub fn plan_batches<'a>(
    chunks: &[&'a Chunk],
    max_size: usize,
    max_bytes: usize,
) -> Vec<Vec<&'a Chunk>> {
    let mut batches = Vec::new();
    let mut current: Vec<&Chunk> = Vec::new();
    let mut bytes = 0usize;
    for &chunk in chunks {
        let len = chunk.byte_len();
        if !current.is_empty() && (current.len() >= max_size || bytes + len > max_bytes) {
            batches.push(std::mem::take(&mut current));
            bytes = 0;
        }
        bytes += len;
        current.push(chunk);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use repo_rag_core::models::ChunkInput;
    use repo_rag_core::store::memory::{InMemoryStore, InMemoryVectorStore};
    use std::sync::atomic::AtomicUsize;

    /// Embeds text by length; rejects any batch containing "POISON" and
    /// reports unavailable for the first `fail_first` calls.
    pub(crate) struct ScriptedProvider {
        pub dims: usize,
        pub fail_first: AtomicUsize,
        pub calls: Mutex<Vec<usize>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(dims: usize) -> Self {
            Self {
                dims,
                fail_first: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.lock().push(texts.len());
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RagError::ProviderUnavailable("503".into()).into());
            }
            if texts.iter().any(|t| t.contains("POISON")) {
                return Err(RagError::ProviderRejected("400 bad input".into()).into());
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dims];
                    v[t.len() % self.dims] = 1.0;
                    v[0] += 0.5;
                    v
                })
                .collect())
        }
    }

    pub(crate) fn make_chunks(repo: &str, n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| {
                Chunk::from_input(
                    repo,
                    ChunkInput {
                        file_path: format!("src/file{i:02}.rs"),
                        start_line: 1,
                        end_line: 10,
                        text: format!("fn item_{i}() {{}}"),
                        language: "rust".into(),
                        content_hash: None,
                    },
                )
            })
            .collect()
    }

    fn settings(batch: usize) -> EmbedSettings {
        EmbedSettings {
            max_batch_size: batch,
            max_batch_bytes: 1 << 20,
            max_retries: 2,
            retry_base: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    async fn service(
        provider: Arc<ScriptedProvider>,
        batch: usize,
    ) -> (EmbeddingService, Arc<InMemoryStore>, Arc<InMemoryVectorStore>) {
        let store = Arc::new(InMemoryStore::new());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let svc = EmbeddingService::new(
            provider,
            vectors.clone(),
            store.clone(),
            Arc::new(RateLimiter::unlimited()),
            settings(batch),
            DistanceMetric::Cosine,
        );
        (svc, store, vectors)
    }

    #[test]
    fn batches_respect_size_and_bytes() {
        let chunks = make_chunks("r", 10);
        let refs: Vec<&Chunk> = chunks.iter().collect();
        let sizes: Vec<usize> = plan_batches(&refs, 4, 1 << 20).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let one = chunks[0].byte_len();
        let sizes: Vec<usize> = plan_batches(&refs, 100, one * 3).iter().map(|b| b.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 10);
        assert!(sizes.iter().all(|s| *s <= 3));

        // Oversized chunk still gets its own batch.
        let sizes: Vec<usize> = plan_batches(&refs[..2], 100, 1).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![1, 1]);
    }

    #[tokio::test]
    async fn poison_chunk_does_not_block_batch_mates() {
        let provider = Arc::new(ScriptedProvider::new(4));
        let (svc, store, vectors) = service(provider, 10).await;
        let mut chunks = make_chunks("r", 10);
        chunks[4].content = "POISON".into();
        store.upsert_chunks(&chunks).await.unwrap();

        let report = svc.embed_chunks(&chunks, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.embedded, 9);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].chunk_id, chunks[4].id);
        assert!(!report.failures[0].retryable);
        assert_eq!(vectors.len(), 9);

        let pending = store.pending_chunks("r").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, chunks[4].id);
    }

    #[tokio::test]
    async fn unavailable_provider_is_retried() {
        let provider = Arc::new(ScriptedProvider::new(4));
        provider.fail_first.store(2, Ordering::SeqCst);
        let (svc, store, _) = service(provider.clone(), 10).await;
        let chunks = make_chunks("r", 3);
        store.upsert_chunks(&chunks).await.unwrap();

        let report = svc.embed_chunks(&chunks, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.embedded, 3);
        assert_eq!(provider.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_are_reported_retryable() {
        let provider = Arc::new(ScriptedProvider::new(4));
        provider.fail_first.store(10, Ordering::SeqCst);
        let (svc, store, _) = service(provider, 10).await;
        let chunks = make_chunks("r", 2);
        store.upsert_chunks(&chunks).await.unwrap();

        let report = svc.embed_chunks(&chunks, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.embedded, 0);
        assert_eq!(report.failures.len(), 2);
        assert!(report.has_retryable_failures());
        assert_eq!(
            report.partial_failure(),
            Some(RagError::PartialBatchFailure { failed: 2, total: 2 })
        );
    }

    #[tokio::test]
    async fn second_run_skips_unchanged_chunks() {
        let provider = Arc::new(ScriptedProvider::new(4));
        let (svc, store, vectors) = service(provider.clone(), 4).await;
        let chunks = make_chunks("r", 5);
        store.upsert_chunks(&chunks).await.unwrap();
        svc.embed_chunks(&chunks, &CancellationToken::new()).await.unwrap();
        let before = vectors.vector(&chunks[0].id);
        let calls = provider.calls.lock().len();

        let reloaded = store
            .get_chunks(&chunks.iter().map(|c| c.id.clone()).collect::<Vec<_>>())
            .await
            .unwrap();
        let report = svc.embed_chunks(&reloaded, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.embedded, 0);
        assert_eq!(report.skipped, 5);
        assert_eq!(provider.calls.lock().len(), calls);
        assert_eq!(vectors.vector(&chunks[0].id), before);
    }

    #[tokio::test]
    async fn repeated_call_with_same_slice_is_skipped() {
        let provider = Arc::new(ScriptedProvider::new(4));
        let (svc, store, _) = service(provider.clone(), 4).await;
        let mut chunks = make_chunks("r", 5);
        store.upsert_chunks(&chunks).await.unwrap();

        let first = svc.embed_chunks(&chunks, &CancellationToken::new()).await.unwrap();
        assert_eq!(first.embedded, 5);
        let calls = provider.calls.lock().len();

        // The caller's copies still say `embedded: false`.
        assert!(chunks.iter().all(|c| !c.embedded));
        let second = svc.embed_chunks(&chunks, &CancellationToken::new()).await.unwrap();
        assert_eq!(second.embedded, 0);
        assert_eq!(second.skipped, 5);
        assert_eq!(provider.calls.lock().len(), calls);

        // A changed chunk is embedded again; the rest stay skipped.
        chunks[2] = Chunk::from_input(
            "r",
            ChunkInput {
                file_path: chunks[2].file_path.clone(),
                start_line: chunks[2].start_line,
                end_line: chunks[2].end_line,
                text: "fn rewritten() {}".into(),
                language: "rust".into(),
                content_hash: None,
            },
        );
        store.upsert_chunks(&chunks[2..3]).await.unwrap();
        let third = svc.embed_chunks(&chunks, &CancellationToken::new()).await.unwrap();
        assert_eq!(third.embedded, 1);
        assert_eq!(third.skipped, 4);
    }

    /// Deletes one file's chunks from the store during the provider call,
    /// as a concurrent re-import would.
    struct RemovingProvider {
        inner: ScriptedProvider,
        store: Arc<InMemoryStore>,
        file_path: String,
    }

    #[async_trait]
    impl EmbeddingProvider for RemovingProvider {
        fn model_name(&self) -> &str {
            "removing"
        }
        fn dims(&self) -> usize {
            self.inner.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.store.delete_file("r", &self.file_path).await?;
            self.inner.embed(texts).await
        }
    }

    #[tokio::test]
    async fn chunk_deleted_during_embedding_leaves_no_vector() {
        let store = Arc::new(InMemoryStore::new());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let chunks = make_chunks("r", 3);
        store.upsert_chunks(&chunks).await.unwrap();
        let provider = Arc::new(RemovingProvider {
            inner: ScriptedProvider::new(4),
            store: store.clone(),
            file_path: chunks[1].file_path.clone(),
        });
        let svc = EmbeddingService::new(
            provider,
            vectors.clone(),
            store.clone(),
            Arc::new(RateLimiter::unlimited()),
            settings(10),
            DistanceMetric::Cosine,
        );

        let report = svc.embed_chunks(&chunks, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.embedded, 2);
        assert!(report.failures.is_empty());
        assert_eq!(vectors.len(), 2);
        assert!(vectors.vector(&chunks[1].id).is_none());
        assert!(vectors.vector(&chunks[0].id).is_some());
    }

    #[tokio::test]
    async fn dimension_mismatch_is_fatal() {
        let provider = Arc::new(ScriptedProvider::new(4));
        let (svc, store, vectors) = service(provider, 4).await;
        vectors
            .ensure_collection(&CollectionSpec {
                dims: 8,
                metric: DistanceMetric::Cosine,
                model: "other".into(),
            })
            .await
            .unwrap();
        let chunks = make_chunks("r", 2);
        store.upsert_chunks(&chunks).await.unwrap();

        let err = svc.initialize_collection().await.unwrap_err();
        assert!(matches!(
            RagError::find(&err),
            Some(RagError::ProviderMismatch(_))
        ));
        assert!(svc.embed_chunks(&chunks, &CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn vector_store_outage_fails_chunks_retryably() {
        let provider = Arc::new(ScriptedProvider::new(4));
        let (svc, store, vectors) = service(provider, 4).await;
        svc.initialize_collection().await.unwrap();
        vectors.set_available(false);
        let chunks = make_chunks("r", 2);
        store.upsert_chunks(&chunks).await.unwrap();

        let report = svc.embed_chunks(&chunks, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.embedded, 0);
        assert!(report.failures.iter().all(|f| f.retryable));
        assert_eq!(store.pending_chunks("r").await.unwrap().len(), 2);
    }
}
