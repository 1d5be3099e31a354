//! In-memory store implementations for tests and ephemeral runs.
//!
//! [`InMemoryStore`] implements every metadata capability ([`ChunkStore`],
//! [`JobStore`], [`SessionStore`]) and keeps a [`Bm25Index`] in step with
//! chunk writes. [`InMemoryVectorStore`] does brute-force similarity over
//! all stored vectors. Both can be switched to "unavailable" to exercise
//! degraded paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::embedding::DistanceMetric;
use crate::error::RagError;
use crate::lexical::Bm25Index;
use crate::models::{
    ChatMessage, ChatSession, Chunk, EmbeddingJob, JobStatus, RepositoryChunkCounts,
};

use super::{
    ChunkCandidate, ChunkStore, CollectionSpec, CollectionStatus, JobStore, LexicalIndex,
    SearchFilter, SessionStore, SessionUpdate, VectorPayload, VectorPoint, VectorStore,
};

#[derive(Default)]
struct ChunkTables {
    chunks: HashMap<String, Chunk>,
    lexical: Bm25Index,
}

impl ChunkTables {
    fn upsert(&mut self, chunk: &Chunk) {
        let mut next = chunk.clone();
        next.embedded = self
            .chunks
            .get(&chunk.id)
            .map(|old| old.embedded && old.content_hash == chunk.content_hash)
            .unwrap_or(false);
        self.lexical.insert(&next);
        self.chunks.insert(next.id.clone(), next);
    }

    fn remove(&mut self, id: &str) {
        self.chunks.remove(id);
        self.lexical.remove(id);
    }

    fn file_ids(&self, repository_id: &str, file_path: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .chunks
            .values()
            .filter(|c| c.repository_id == repository_id && c.file_path == file_path)
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// In-memory metadata store.
pub struct InMemoryStore {
    tables: RwLock<ChunkTables>,
    jobs: RwLock<HashMap<String, EmbeddingJob>>,
    sessions: RwLock<HashMap<String, ChatSession>>,
    lexical_available: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(ChunkTables::default()),
            jobs: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            lexical_available: AtomicBool::new(true),
        }
    }

    /// Simulate the lexical index going down (or coming back).
    pub fn set_lexical_available(&self, available: bool) {
        self.lexical_available.store(available, Ordering::SeqCst);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tables = self.tables.write();
        for chunk in chunks {
            tables.upsert(chunk);
        }
        Ok(())
    }

    async fn replace_file_chunks(
        &self,
        repository_id: &str,
        file_path: &str,
        chunks: &[Chunk],
    ) -> Result<Vec<String>> {
        let mut tables = self.tables.write();
        let removed: Vec<String> = tables
            .file_ids(repository_id, file_path)
            .into_iter()
            .filter(|id| !chunks.iter().any(|c| &c.id == id))
            .collect();
        for id in &removed {
            tables.remove(id);
        }
        for chunk in chunks {
            tables.upsert(chunk);
        }
        Ok(removed)
    }

    async fn delete_file(&self, repository_id: &str, file_path: &str) -> Result<Vec<String>> {
        let mut tables = self.tables.write();
        let removed = tables.file_ids(repository_id, file_path);
        for id in &removed {
            tables.remove(id);
        }
        Ok(removed)
    }

    async fn delete_repository(&self, repository_id: &str) -> Result<u64> {
        let mut tables = self.tables.write();
        let ids: Vec<String> = tables
            .chunks
            .values()
            .filter(|c| c.repository_id == repository_id)
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            tables.remove(id);
        }
        Ok(ids.len() as u64)
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let tables = self.tables.read();
        Ok(ids
            .iter()
            .filter_map(|id| tables.chunks.get(id).cloned())
            .collect())
    }

    async fn pending_chunks(&self, repository_id: &str) -> Result<Vec<Chunk>> {
        let tables = self.tables.read();
        let mut pending: Vec<Chunk> = tables
            .chunks
            .values()
            .filter(|c| c.repository_id == repository_id && !c.embedded)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.file_path
                .cmp(&b.file_path)
                .then(a.start_line.cmp(&b.start_line))
                .then(a.id.cmp(&b.id))
        });
        Ok(pending)
    }

    async fn repositories_with_pending(&self) -> Result<Vec<String>> {
        let tables = self.tables.read();
        let mut repos: Vec<String> = tables
            .chunks
            .values()
            .filter(|c| !c.embedded)
            .map(|c| c.repository_id.clone())
            .collect();
        repos.sort();
        repos.dedup();
        Ok(repos)
    }

    async fn mark_embedded(&self, chunk_id: &str, content_hash: &str) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.chunks.get_mut(chunk_id) {
            Some(c) if c.content_hash == content_hash => {
                c.embedded = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn chunk_counts(
        &self,
        repository_id: Option<&str>,
    ) -> Result<Vec<RepositoryChunkCounts>> {
        let tables = self.tables.read();
        let mut counts: BTreeMap<&str, RepositoryChunkCounts> = BTreeMap::new();
        for c in tables.chunks.values() {
            if repository_id.is_some_and(|r| r != c.repository_id) {
                continue;
            }
            let entry = counts
                .entry(c.repository_id.as_str())
                .or_insert_with(|| RepositoryChunkCounts {
                    repository_id: c.repository_id.clone(),
                    ..Default::default()
                });
            entry.total += 1;
            if c.embedded {
                entry.embedded += 1;
            }
        }
        Ok(counts.into_values().collect())
    }
}

#[async_trait]
impl LexicalIndex for InMemoryStore {
    async fn lexical_search(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkCandidate>> {
        if !self.lexical_available.load(Ordering::SeqCst) {
            return Err(RagError::IndexUnavailable("lexical index offline".into()).into());
        }
        Ok(self.tables.read().lexical.search(query, k, filter))
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_job(&self, job: &EmbeddingJob) -> Result<()> {
        self.jobs.write().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &EmbeddingJob) -> Result<()> {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(RagError::NotFound(format!("job {}", job.id)).into()),
        }
    }

    async fn get_job(&self, id: &str) -> Result<Option<EmbeddingJob>> {
        Ok(self.jobs.read().get(id).cloned())
    }

    async fn list_jobs(
        &self,
        repository_id: Option<&str>,
        status: Option<JobStatus>,
    ) -> Result<Vec<EmbeddingJob>> {
        let jobs = self.jobs.read();
        let mut out: Vec<EmbeddingJob> = jobs
            .values()
            .filter(|j| repository_id.map_or(true, |r| j.repository_id == r))
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn create_session(&self, session: &ChatSession) -> Result<()> {
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<ChatSession>> {
        let sessions = self.sessions.read();
        let mut out: Vec<ChatSession> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| ChatSession {
                messages: Vec::new(),
                ..s.clone()
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<bool> {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(id) else {
            return Ok(false);
        };
        if let Some(title) = &update.title {
            session.title = title.clone();
        }
        if let Some(repo) = &update.repository_id {
            session.repository_id = Some(repo.clone());
        }
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.write().remove(id).is_some())
    }

    async fn append_messages(&self, id: &str, messages: &[ChatMessage]) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| RagError::NotFound(format!("session {id}")))?;
        session.messages.extend_from_slice(messages);
        session.updated_at = Utc::now();
        Ok(())
    }
}

struct StoredPoint {
    vector: Vec<f32>,
    payload: VectorPayload,
}

/// In-memory vector index with brute-force search.
pub struct InMemoryVectorStore {
    collection: RwLock<Option<CollectionSpec>>,
    points: RwLock<HashMap<String, StoredPoint>>,
    available: AtomicBool,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            collection: RwLock::new(None),
            points: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the vector store going down (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }

    /// Stored vector for `id`, if any.
    pub fn vector(&self, id: &str) -> Option<Vec<f32>> {
        self.points.read().get(id).map(|p| p.vector.clone())
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RagError::IndexUnavailable("vector store offline".into()).into())
        }
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<CollectionStatus> {
        self.check()?;
        let mut collection = self.collection.write();
        match collection.as_ref() {
            Some(existing) => {
                existing.ensure_compatible(spec)?;
                Ok(CollectionStatus::Existing)
            }
            None => {
                *collection = Some(spec.clone());
                Ok(CollectionStatus::Created)
            }
        }
    }

    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        self.check()?;
        if let Some(spec) = self.collection.read().as_ref() {
            if let Some(bad) = points.iter().find(|p| p.vector.len() != spec.dims) {
                return Err(RagError::ProviderMismatch(format!(
                    "vector for {} has {} dimensions, collection expects {}",
                    bad.id,
                    bad.vector.len(),
                    spec.dims
                ))
                .into());
            }
        }
        let mut stored = self.points.write();
        for p in points {
            stored.insert(
                p.id.clone(),
                StoredPoint {
                    vector: p.vector.clone(),
                    payload: p.payload.clone(),
                },
            );
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkCandidate>> {
        self.check()?;
        let metric = self
            .collection
            .read()
            .as_ref()
            .map(|c| c.metric)
            .unwrap_or(DistanceMetric::Cosine);
        let points = self.points.read();
        let mut scored: Vec<ChunkCandidate> = points
            .iter()
            .filter(|(_, p)| filter.matches(&p.payload.repository_id, &p.payload.language))
            .map(|(id, p)| ChunkCandidate::new(id.clone(), metric.similarity(vector, &p.vector) as f64))
            .collect();
        scored.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.check()?;
        let mut points = self.points.write();
        for id in ids {
            points.remove(id);
        }
        Ok(())
    }

    async fn delete_repository(&self, repository_id: &str) -> Result<()> {
        self.check()?;
        self.points
            .write()
            .retain(|_, p| p.payload.repository_id != repository_id);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkInput, ChunkReference};

    fn chunk(repo: &str, path: &str, start: u32, text: &str) -> Chunk {
        Chunk::from_input(
            repo,
            ChunkInput {
                file_path: path.to_string(),
                start_line: start,
                end_line: start + 9,
                text: text.to_string(),
                language: "rust".to_string(),
                content_hash: None,
            },
        )
    }

    fn point(c: &Chunk, v: Vec<f32>) -> VectorPoint {
        VectorPoint {
            id: c.id.clone(),
            vector: v,
            payload: VectorPayload {
                repository_id: c.repository_id.clone(),
                file_path: c.file_path.clone(),
                language: c.language.clone(),
                content_hash: c.content_hash.clone(),
            },
        }
    }

    #[tokio::test]
    async fn upsert_keeps_embedded_flag_only_for_same_hash() {
        let store = InMemoryStore::new();
        let a = chunk("r", "a.rs", 1, "fn a() {}");
        store.upsert_chunks(&[a.clone()]).await.unwrap();
        assert!(store.mark_embedded(&a.id, &a.content_hash).await.unwrap());

        store.upsert_chunks(&[a.clone()]).await.unwrap();
        assert!(store.pending_chunks("r").await.unwrap().is_empty());

        let changed = chunk("r", "a.rs", 1, "fn a() { changed }");
        store.upsert_chunks(&[changed.clone()]).await.unwrap();
        let pending = store.pending_chunks("r").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content_hash, changed.content_hash);
    }

    #[tokio::test]
    async fn mark_embedded_rejects_stale_hash() {
        let store = InMemoryStore::new();
        let a = chunk("r", "a.rs", 1, "one");
        store.upsert_chunks(&[a.clone()]).await.unwrap();
        assert!(!store.mark_embedded(&a.id, "stale").await.unwrap());
        assert!(!store.mark_embedded("missing", &a.content_hash).await.unwrap());
    }

    #[tokio::test]
    async fn replace_file_removes_vanished_chunks() {
        let store = InMemoryStore::new();
        let a = chunk("r", "a.rs", 1, "alpha");
        let b = chunk("r", "a.rs", 11, "beta");
        store.upsert_chunks(&[a.clone(), b.clone()]).await.unwrap();

        let removed = store
            .replace_file_chunks("r", "a.rs", &[a.clone()])
            .await
            .unwrap();
        assert_eq!(removed, vec![b.id.clone()]);
        let hits = store
            .lexical_search("beta", 5, &SearchFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn counts_and_pending_repositories() {
        let store = InMemoryStore::new();
        let a = chunk("r1", "a.rs", 1, "one");
        let b = chunk("r2", "b.rs", 1, "two");
        store.upsert_chunks(&[a.clone(), b]).await.unwrap();
        store.mark_embedded(&a.id, &a.content_hash).await.unwrap();

        assert_eq!(store.repositories_with_pending().await.unwrap(), vec!["r2"]);
        let counts = store.chunk_counts(None).await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].repository_id, "r1");
        assert_eq!(counts[0].embedded, 1);
        assert_eq!(counts[1].embedded, 0);

        assert_eq!(store.delete_repository("r1").await.unwrap(), 1);
        assert_eq!(store.chunk_counts(Some("r1")).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn session_messages_round_trip_in_order() {
        let store = InMemoryStore::new();
        let session = ChatSession::new("u1", Some("r".into()), "title");
        store.create_session(&session).await.unwrap();

        let refs = vec![ChunkReference {
            chunk_id: "c1".into(),
            file_path: "a.rs".into(),
            start_line: 1,
            end_line: 5,
            score: 0.9,
        }];
        let user = ChatMessage::user("question", 2);
        let assistant = ChatMessage::assistant("answer", refs.clone());
        store
            .append_messages(&session.id, &[user.clone(), assistant.clone()])
            .await
            .unwrap();

        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages, vec![user, assistant]);
        assert_eq!(loaded.messages[1].references, refs);

        let listed = store.list_sessions("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].messages.is_empty());

        assert!(store.delete_session(&session.id).await.unwrap());
        assert!(store.append_messages(&session.id, &[]).await.is_err());
    }

    #[tokio::test]
    async fn vector_store_rejects_dimension_change() {
        let store = InMemoryVectorStore::new();
        let spec = CollectionSpec {
            dims: 3,
            metric: DistanceMetric::Cosine,
            model: "m".into(),
        };
        assert_eq!(
            store.ensure_collection(&spec).await.unwrap(),
            CollectionStatus::Created
        );
        assert_eq!(
            store.ensure_collection(&spec).await.unwrap(),
            CollectionStatus::Existing
        );
        let other = CollectionSpec { dims: 4, ..spec };
        let err = store.ensure_collection(&other).await.unwrap_err();
        assert!(matches!(
            RagError::find(&err),
            Some(RagError::ProviderMismatch(_))
        ));
    }

    #[tokio::test]
    async fn vector_query_filters_and_ranks() {
        let store = InMemoryVectorStore::new();
        let a = chunk("r1", "a.rs", 1, "a");
        let b = chunk("r1", "b.rs", 1, "b");
        let c = chunk("r2", "c.rs", 1, "c");
        store
            .upsert(&[
                point(&a, vec![1.0, 0.0]),
                point(&b, vec![0.6, 0.8]),
                point(&c, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store
            .query(&[1.0, 0.0], 5, &SearchFilter::repository("r1"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, a.id);

        store.set_available(false);
        assert!(store.ping().await.is_err());
        store.set_available(true);
        store.delete_repository("r1").await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
