//! Embedding Pipeline: durable, concurrency-bounded embedding jobs.
//!
//! Work arrives per repository. [`EmbeddingPipeline::queue_repository`]
//! splits a repository's pending chunks into jobs of at most
//! `embedding.max_batch_size` chunks, persists them, and hands them to a
//! fixed pool of workers.
//!
//! # Guarantees
//!
//! - At most one job per repository runs at a time. A repository with jobs
//!   queued or running is *in flight*; further requests for it are coalesced
//!   and remembered as a rescan that runs once its jobs drain.
//! - Different repositories progress concurrently, up to `pipeline.workers`.
//! - Job state follows `queued → running → completed | failed`. Retryable
//!   failures go `failed → queued` after a backoff, until `max_attempts`.
//! - Job records are never deleted; they back [`PipelineStats`].
//!
//! # Lifecycle
//!
//! [`start`](EmbeddingPipeline::start) re-queues jobs left `queued` or
//! `running` by a previous process, sweeps repositories with pending
//! chunks and spawns the workers. [`stop`](EmbeddingPipeline::stop) lets
//! in-flight jobs finish; if the shutdown deadline passes first, the abort
//! token fires, interrupted jobs go back to `queued` for the next start,
//! and tasks still running after a short grace period are aborted. A
//! stopped pipeline cannot be restarted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use repo_rag_core::error::RagError;
use repo_rag_core::models::{EmbeddingJob, JobStatus};
use repo_rag_core::store::{ChunkStore, JobStore};

use crate::config::PipelineConfig;
use crate::embed_service::EmbeddingService;

/// Time given to cancelled jobs after the shutdown deadline before their
/// tasks are aborted.
const ABORT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub shutdown_timeout: Duration,
    pub sweep_interval: Option<Duration>,
    pub resume_on_start: bool,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            sweep_interval: (config.sweep_interval_secs > 0)
                .then(|| Duration::from_secs(config.sweep_interval_secs)),
            resume_on_start: config.resume_on_start,
        }
    }
}

/// Result of asking the pipeline to embed a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueueOutcome {
    Accepted { job_ids: Vec<String>, chunks: usize },
    AlreadyInProgress,
    NothingPending,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepositoryStats {
    pub repository_id: String,
    pub total_chunks: u64,
    pub embedded: u64,
    pub pending: u64,
    /// Un-embedded chunks whose last job failed for good.
    pub failed: u64,
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub last_error: Option<String>,
}

/// Best-effort snapshot; fields are read one after another while workers
/// keep running, so they need not be mutually consistent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub repositories: Vec<RepositoryStats>,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub workers: usize,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<EmbeddingJob>,
    /// Repositories with a running job.
    running: HashSet<String>,
    /// Queued, delayed or running jobs per repository.
    in_flight: HashMap<String, usize>,
    rescan: HashSet<String>,
}

impl QueueState {
    /// First ready job whose repository is not running.
    fn take_next(&mut self) -> Option<EmbeddingJob> {
        let pos = self
            .ready
            .iter()
            .position(|j| !self.running.contains(&j.repository_id))?;
        let job = self.ready.remove(pos)?;
        self.running.insert(job.repository_id.clone());
        Some(job)
    }

    fn has_runnable(&self) -> bool {
        self.ready
            .iter()
            .any(|j| !self.running.contains(&j.repository_id))
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Drop one in-flight job of `repo`. Returns true when the repository
    /// drained and a rescan was requested meanwhile.
    fn release(&mut self, repo: &str) -> bool {
        if let Some(n) = self.in_flight.get_mut(repo) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.in_flight.remove(repo);
                return self.rescan.remove(repo);
            }
        }
        false
    }
}

pub struct EmbeddingPipeline {
    service: Arc<EmbeddingService>,
    chunks: Arc<dyn ChunkStore>,
    jobs: Arc<dyn JobStore>,
    settings: PipelineSettings,
    state: Mutex<QueueState>,
    work_ready: Notify,
    idle: Notify,
    active: AtomicUsize,
    degraded: Mutex<Option<String>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    abort: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EmbeddingPipeline {
    pub fn new(
        service: Arc<EmbeddingService>,
        chunks: Arc<dyn ChunkStore>,
        jobs: Arc<dyn JobStore>,
        settings: PipelineSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            chunks,
            jobs,
            settings,
            state: Mutex::new(QueueState::default()),
            work_ready: Notify::new(),
            idle: Notify::new(),
            active: AtomicUsize::new(0),
            degraded: Mutex::new(None),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Recover interrupted jobs, resume pending work and spawn the workers.
    ///
    /// Dependency failures here are logged and reported through
    /// [`stats`](Self::stats); the pipeline starts degraded and recovers
    /// once the vector store becomes reachable.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("embedding pipeline already started");
        }

        if self.service.is_enabled() {
            if let Err(e) = self.service.initialize_collection().await {
                warn!(error = %e, "vector collection unavailable, pipeline starting degraded");
                self.set_degraded(&e);
            }
        } else {
            *self.degraded.lock() = Some("embedding provider is disabled".into());
        }

        if self.settings.resume_on_start {
            match self.recover_jobs().await {
                Ok(0) => {}
                Ok(n) => info!(jobs = n, "re-queued interrupted embedding jobs"),
                Err(e) => warn!(error = %e, "could not recover embedding jobs"),
            }
            if self.service.is_enabled() {
                if let Err(e) = self.queue_all_repositories().await {
                    warn!(error = %e, "could not sweep pending chunks at startup");
                }
            }
        }

        let mut tasks = Vec::with_capacity(self.settings.workers + 1);
        for worker_id in 0..self.settings.workers {
            let pipeline = Arc::clone(self);
            tasks.push(tokio::spawn(async move { pipeline.worker_loop(worker_id).await }));
        }
        if let Some(interval) = self.settings.sweep_interval {
            let pipeline = Arc::clone(self);
            tasks.push(tokio::spawn(async move { pipeline.sweep_loop(interval).await }));
        }
        *self.tasks.lock() = tasks;

        info!(workers = self.settings.workers, "embedding pipeline started");
        Ok(())
    }

    /// Stop accepting work, let running jobs finish, and wait for the
    /// workers up to the shutdown deadline.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.work_ready.notify_waiters();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let all = futures_util::future::join_all(tasks);
        tokio::pin!(all);

        tokio::select! {
            _ = &mut all => info!("embedding pipeline stopped"),
            _ = tokio::time::sleep(self.settings.shutdown_timeout) => {
                warn!(
                    timeout_secs = self.settings.shutdown_timeout.as_secs(),
                    "embedding pipeline shutdown deadline elapsed, aborting in-flight jobs"
                );
                self.abort.cancel();
                // Cancelled jobs record themselves as queued before exiting.
                if tokio::time::timeout(ABORT_GRACE, &mut all).await.is_err() {
                    for handle in &aborts {
                        handle.abort();
                    }
                    let _ = all.await;
                }
            }
        }
    }

    /// Queue every repository that has un-embedded chunks.
    pub async fn queue_all_repositories(&self) -> Result<Vec<(String, QueueOutcome)>> {
        let repos = self.chunks.repositories_with_pending().await?;
        let mut outcomes = Vec::with_capacity(repos.len());
        for repo in repos {
            let outcome = self.queue_repository(&repo).await?;
            outcomes.push((repo, outcome));
        }
        Ok(outcomes)
    }

    /// Queue jobs for one repository's pending chunks.
    ///
    /// Coalesced into [`QueueOutcome::AlreadyInProgress`] when the
    /// repository already has jobs queued or running.
    pub async fn queue_repository(&self, repository_id: &str) -> Result<QueueOutcome> {
        if self.shutdown.is_cancelled() {
            bail!("embedding pipeline is shutting down");
        }
        if !self.service.is_enabled() {
            return Err(RagError::InvalidInput("embedding provider is disabled".into()).into());
        }

        {
            let mut state = self.state.lock();
            if state.in_flight.contains_key(repository_id) {
                state.rescan.insert(repository_id.to_string());
                debug!(repository_id, "embedding already in progress, rescan requested");
                return Ok(QueueOutcome::AlreadyInProgress);
            }
            // Reserve the repository while the store is read.
            state.in_flight.insert(repository_id.to_string(), 0);
        }

        loop {
            match self.create_jobs(repository_id).await {
                Ok(jobs) if jobs.is_empty() => {
                    // A request coalesced into this read may have seen
                    // chunks that the read missed: keep the reservation
                    // and read again.
                    let reread = {
                        let mut state = self.state.lock();
                        if state.rescan.remove(repository_id) {
                            true
                        } else {
                            state.in_flight.remove(repository_id);
                            false
                        }
                    };
                    if reread {
                        debug!(repository_id, "rescan requested during read, reading again");
                        continue;
                    }
                    self.idle.notify_waiters();
                    return Ok(QueueOutcome::NothingPending);
                }
                Ok(jobs) => {
                    let chunks = jobs.iter().map(|j| j.chunk_ids.len()).sum();
                    let job_ids = jobs.iter().map(|j| j.id.clone()).collect();
                    info!(repository_id, jobs = jobs.len(), chunks, "queued embedding jobs");
                    {
                        let mut state = self.state.lock();
                        state.in_flight.insert(repository_id.to_string(), jobs.len());
                        state.ready.extend(jobs);
                    }
                    self.work_ready.notify_one();
                    return Ok(QueueOutcome::Accepted { job_ids, chunks });
                }
                Err(e) => {
                    let mut state = self.state.lock();
                    state.in_flight.remove(repository_id);
                    state.rescan.remove(repository_id);
                    return Err(e);
                }
            }
        }
    }

    async fn create_jobs(&self, repository_id: &str) -> Result<Vec<EmbeddingJob>> {
        let pending = self.chunks.pending_chunks(repository_id).await?;
        let batch = self.service.settings().max_batch_size;
        let mut jobs = Vec::new();
        for ids in pending.chunks(batch) {
            let job = EmbeddingJob::new(repository_id, ids.iter().map(|c| c.id.clone()).collect());
            self.jobs.insert_job(&job).await?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    async fn recover_jobs(&self) -> Result<usize> {
        let mut recovered = self.jobs.list_jobs(None, Some(JobStatus::Running)).await?;
        recovered.extend(self.jobs.list_jobs(None, Some(JobStatus::Queued)).await?);
        recovered.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.id.cmp(&b.id)));

        let count = recovered.len();
        for job in &mut recovered {
            if job.status != JobStatus::Queued {
                job.transition(JobStatus::Queued);
                self.persist(job).await;
            }
        }
        if count > 0 {
            let mut state = self.state.lock();
            for job in recovered {
                *state.in_flight.entry(job.repository_id.clone()).or_insert(0) += 1;
                state.ready.push_back(job);
            }
            drop(state);
            self.work_ready.notify_one();
        }
        Ok(count)
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "embedding worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let next = {
                let mut state = self.state.lock();
                let job = state.take_next();
                (job, state.has_runnable())
            };
            let job = match next {
                (Some(job), more) => {
                    if more {
                        self.work_ready.notify_one();
                    }
                    job
                }
                (None, _) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.work_ready.notified() => continue,
                    }
                }
            };

            self.active.fetch_add(1, Ordering::SeqCst);
            self.run_job(job).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.idle.notify_waiters();
        }
        debug!(worker_id, "embedding worker exited");
    }

    async fn sweep_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.queue_all_repositories().await {
                        warn!(error = %e, "periodic sweep failed");
                    }
                }
            }
        }
    }

    async fn run_job(self: &Arc<Self>, mut job: EmbeddingJob) {
        let repo = job.repository_id.clone();
        job.attempts += 1;
        job.transition(JobStatus::Running);
        self.persist(&job).await;
        debug!(job_id = %job.id, repository_id = %repo, attempt = job.attempts, "running embedding job");

        let outcome = match self.chunks.get_chunks(&job.chunk_ids).await {
            Ok(chunks) => self.service.embed_chunks(&chunks, &self.abort).await,
            Err(e) => Err(e),
        };

        let retry = match outcome {
            Ok(report) if report.failures.is_empty() => {
                self.clear_degraded();
                job.last_error = None;
                job.transition(JobStatus::Completed);
                info!(job_id = %job.id, repository_id = %repo, embedded = report.embedded, skipped = report.skipped, "embedding job completed");
                false
            }
            Ok(report) => {
                self.clear_degraded();
                let summary = report
                    .partial_failure()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                let first = report
                    .failures
                    .first()
                    .map(|f| f.reason.as_str())
                    .unwrap_or_default();
                job.last_error = Some(format!("{summary}: {first}"));
                job.transition(JobStatus::Failed);
                warn!(job_id = %job.id, repository_id = %repo, error = %summary, "embedding job failed");
                report.has_retryable_failures()
            }
            Err(_) if self.abort.is_cancelled() => {
                // Interrupted by shutdown; picked up again on the next start.
                job.transition(JobStatus::Queued);
                self.persist(&job).await;
                self.release(&repo);
                return;
            }
            Err(e) => {
                let retryable = RagError::is_retryable(&e);
                if matches!(RagError::find(&e), Some(RagError::ProviderMismatch(_)))
                    || !self.service.is_collection_ready()
                {
                    self.set_degraded(&e);
                }
                job.last_error = Some(format!("{e:#}"));
                job.transition(JobStatus::Failed);
                warn!(job_id = %job.id, repository_id = %repo, attempt = job.attempts, error = %e, "embedding job failed");
                retryable
            }
        };
        self.persist(&job).await;

        if retry && job.attempts < self.settings.max_attempts && !self.shutdown.is_cancelled() {
            self.schedule_retry(job);
        } else {
            self.release(&repo);
        }
    }

    /// `failed → queued`, then back on the ready queue after the backoff.
    fn schedule_retry(self: &Arc<Self>, mut job: EmbeddingJob) {
        let exponent = job.attempts.saturating_sub(1).min(16);
        let delay = self.settings.retry_backoff * 2u32.pow(exponent);
        info!(job_id = %job.id, repository_id = %job.repository_id, delay_ms = delay.as_millis() as u64, "embedding job will be retried");

        // Still in flight, but no longer running: other jobs of the
        // repository may proceed during the backoff.
        self.state.lock().running.remove(&job.repository_id);
        self.work_ready.notify_one();

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            job.transition(JobStatus::Queued);
            pipeline.persist(&job).await;
            tokio::select! {
                _ = pipeline.shutdown.cancelled() => {
                    // Stays queued in the job store for the next start.
                    pipeline.state.lock().release(&job.repository_id);
                    pipeline.idle.notify_waiters();
                }
                _ = tokio::time::sleep(delay) => {
                    pipeline.state.lock().ready.push_back(job);
                    pipeline.work_ready.notify_one();
                }
            }
        });
    }

    /// Job of `repo` finished: free the repository and run a pending rescan.
    fn release(self: &Arc<Self>, repo: &str) {
        let rescan = {
            let mut state = self.state.lock();
            state.running.remove(repo);
            state.release(repo)
        };
        self.work_ready.notify_one();
        if rescan && !self.shutdown.is_cancelled() {
            let pipeline = Arc::clone(self);
            let repo = repo.to_string();
            tokio::spawn(async move {
                if let Err(e) = pipeline.queue_repository(&repo).await {
                    warn!(repository_id = %repo, error = %e, "rescan failed");
                }
            });
        }
    }

    async fn persist(&self, job: &EmbeddingJob) {
        if let Err(e) = self.jobs.update_job(job).await {
            warn!(job_id = %job.id, error = %e, "could not persist embedding job state");
        }
    }

    fn set_degraded(&self, err: &anyhow::Error) {
        *self.degraded.lock() = Some(format!("{err:#}"));
    }

    fn clear_degraded(&self) {
        self.degraded.lock().take();
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().is_idle() && self.active.load(Ordering::SeqCst) == 0
    }

    /// Wait until no job is queued, delayed or running.
    pub async fn wait_idle(&self) {
        while !self.is_idle() {
            let _ = tokio::time::timeout(Duration::from_millis(50), self.idle.notified()).await;
        }
    }

    /// Compute a [`PipelineStats`] snapshot, optionally for one repository.
    pub async fn stats(&self, repository_id: Option<&str>) -> Result<PipelineStats> {
        let counts = self.chunks.chunk_counts(repository_id).await?;
        let jobs = self.jobs.list_jobs(repository_id, None).await?;

        let mut repositories = Vec::with_capacity(counts.len());
        for c in counts {
            let repo_jobs: Vec<&EmbeddingJob> = jobs
                .iter()
                .filter(|j| j.repository_id == c.repository_id)
                .collect();

            let failed_ids: Vec<String> = repo_jobs
                .iter()
                .filter(|j| j.status == JobStatus::Failed)
                .flat_map(|j| j.chunk_ids.iter().cloned())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            let failed = if failed_ids.is_empty() {
                0
            } else {
                self.chunks
                    .get_chunks(&failed_ids)
                    .await?
                    .iter()
                    .filter(|ch| !ch.embedded)
                    .count() as u64
            };

            let last_error = repo_jobs
                .iter()
                .filter(|j| j.last_error.is_some())
                .max_by_key(|j| j.updated_at)
                .and_then(|j| j.last_error.clone());

            repositories.push(RepositoryStats {
                pending: c.total.saturating_sub(c.embedded).saturating_sub(failed),
                total_chunks: c.total,
                embedded: c.embedded,
                failed,
                queued_jobs: repo_jobs.iter().filter(|j| j.status == JobStatus::Queued).count(),
                running_jobs: repo_jobs.iter().filter(|j| j.status == JobStatus::Running).count(),
                last_error,
                repository_id: c.repository_id,
            });
        }

        let queue_depth = {
            let state = self.state.lock();
            let in_flight: usize = state.in_flight.values().sum();
            in_flight.saturating_sub(state.running.len())
        };
        let degraded_reason = self.degraded.lock().clone();

        Ok(PipelineStats {
            repositories,
            queue_depth,
            active_workers: self.active.load(Ordering::SeqCst),
            workers: self.settings.workers,
            degraded: degraded_reason.is_some(),
            degraded_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed_service::tests::{make_chunks, ScriptedProvider};
    use crate::embed_service::EmbedSettings;
    use crate::rate_limit::RateLimiter;
    use async_trait::async_trait;
    use repo_rag_core::embedding::{DistanceMetric, EmbeddingProvider};
    use repo_rag_core::models::{Chunk, RepositoryChunkCounts};
    use repo_rag_core::store::memory::{InMemoryStore, InMemoryVectorStore};

    fn settings() -> PipelineSettings {
        PipelineSettings {
            workers: 3,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(5),
            shutdown_timeout: Duration::from_secs(5),
            sweep_interval: None,
            resume_on_start: true,
        }
    }

    fn embed_settings(batch: usize) -> EmbedSettings {
        EmbedSettings {
            max_batch_size: batch,
            max_batch_bytes: 1 << 20,
            max_retries: 0,
            retry_base: Duration::from_millis(1),
            timeout: Duration::from_secs(60),
        }
    }

    fn assemble(
        provider: Arc<dyn EmbeddingProvider>,
        chunks: Arc<dyn ChunkStore>,
        jobs: Arc<InMemoryStore>,
        embed: EmbedSettings,
        settings: PipelineSettings,
    ) -> Arc<EmbeddingPipeline> {
        let service = Arc::new(EmbeddingService::new(
            provider,
            Arc::new(InMemoryVectorStore::new()),
            chunks.clone(),
            Arc::new(RateLimiter::unlimited()),
            embed,
            DistanceMetric::Cosine,
        ));
        EmbeddingPipeline::new(service, chunks, jobs, settings)
    }

    fn build(
        provider: Arc<dyn EmbeddingProvider>,
        batch: usize,
    ) -> (Arc<EmbeddingPipeline>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = assemble(
            provider,
            store.clone(),
            store.clone(),
            embed_settings(batch),
            settings(),
        );
        (pipeline, store)
    }

    async fn wait_until_running(pipeline: &EmbeddingPipeline) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.active.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job never started");
    }

    /// Sleeps before answering.
    struct SlowProvider {
        inner: ScriptedProvider,
        delay: Duration,
    }

    #[async_trait]
    impl EmbeddingProvider for SlowProvider {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            self.inner.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(self.delay).await;
            self.inner.embed(texts).await
        }
    }

    /// Holds the result of the first pending-chunks read for a while, so
    /// writes and requests can land while it is outstanding.
    struct SlowFirstRead {
        inner: Arc<InMemoryStore>,
        delayed: AtomicBool,
    }

    #[async_trait]
    impl ChunkStore for SlowFirstRead {
        async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
            self.inner.upsert_chunks(chunks).await
        }
        async fn replace_file_chunks(
            &self,
            repository_id: &str,
            file_path: &str,
            chunks: &[Chunk],
        ) -> Result<Vec<String>> {
            self.inner.replace_file_chunks(repository_id, file_path, chunks).await
        }
        async fn delete_file(&self, repository_id: &str, file_path: &str) -> Result<Vec<String>> {
            self.inner.delete_file(repository_id, file_path).await
        }
        async fn delete_repository(&self, repository_id: &str) -> Result<u64> {
            self.inner.delete_repository(repository_id).await
        }
        async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
            self.inner.get_chunks(ids).await
        }
        async fn pending_chunks(&self, repository_id: &str) -> Result<Vec<Chunk>> {
            let pending = self.inner.pending_chunks(repository_id).await;
            if !self.delayed.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            pending
        }
        async fn repositories_with_pending(&self) -> Result<Vec<String>> {
            self.inner.repositories_with_pending().await
        }
        async fn mark_embedded(&self, chunk_id: &str, content_hash: &str) -> Result<bool> {
            self.inner.mark_embedded(chunk_id, content_hash).await
        }
        async fn chunk_counts(
            &self,
            repository_id: Option<&str>,
        ) -> Result<Vec<RepositoryChunkCounts>> {
            self.inner.chunk_counts(repository_id).await
        }
    }

    /// Records the maximum number of concurrent calls per repository.
    struct ConcurrencyProbe {
        inner: ScriptedProvider,
        current: Mutex<HashMap<String, usize>>,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for ConcurrencyProbe {
        fn model_name(&self) -> &str {
            "probe"
        }
        fn dims(&self) -> usize {
            self.inner.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            // Texts are "repo:..." so the owning repository is recoverable.
            let repo = texts[0].split(':').next().unwrap_or_default().to_string();
            {
                let mut cur = self.current.lock();
                let n = cur.entry(repo.clone()).or_insert(0);
                *n += 1;
                self.max_seen.fetch_max(*n, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            let out = self.inner.embed(texts).await;
            *self.current.lock().entry(repo).or_insert(1) -= 1;
            out
        }
    }

    #[tokio::test]
    async fn ten_chunks_with_batch_four_make_three_jobs() {
        let (pipeline, store) = build(Arc::new(ScriptedProvider::new(4)), 4);
        store.upsert_chunks(&make_chunks("R", 10)).await.unwrap();
        pipeline.start().await.unwrap();
        pipeline.wait_idle().await;

        let jobs = store.list_jobs(Some("R"), None).await.unwrap();
        let mut sizes: Vec<usize> = jobs.iter().map(|j| j.chunk_ids.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![2, 4, 4]);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));

        let stats = pipeline.stats(Some("R")).await.unwrap();
        assert_eq!(stats.repositories.len(), 1);
        assert_eq!(stats.repositories[0].embedded, 10);
        assert_eq!(stats.repositories[0].pending, 0);
        assert_eq!(stats.queue_depth, 0);
        assert!(!stats.degraded);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn one_running_job_per_repository() {
        let probe = Arc::new(ConcurrencyProbe {
            inner: ScriptedProvider::new(4),
            current: Mutex::new(HashMap::new()),
            max_seen: AtomicUsize::new(0),
        });
        let (pipeline, store) = build(probe.clone(), 2);
        for repo in ["a", "b"] {
            let mut chunks = make_chunks(repo, 8);
            for c in &mut chunks {
                c.content = format!("{repo}:{}", c.content);
            }
            store.upsert_chunks(&chunks).await.unwrap();
        }
        pipeline.start().await.unwrap();

        // Concurrent requests for the same repository are coalesced.
        let (x, y) = tokio::join!(pipeline.queue_repository("a"), pipeline.queue_repository("a"));
        assert!(x.is_ok() && y.is_ok());

        pipeline.wait_idle().await;
        assert_eq!(probe.max_seen.load(Ordering::SeqCst), 1);
        let stats = pipeline.stats(None).await.unwrap();
        assert!(stats.repositories.iter().all(|r| r.embedded == 8));
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn in_flight_requests_are_coalesced() {
        let (pipeline, store) = build(Arc::new(ScriptedProvider::new(4)), 4);
        store.upsert_chunks(&make_chunks("R", 6)).await.unwrap();

        // Workers not started: jobs stay queued.
        let first = pipeline.queue_repository("R").await.unwrap();
        assert!(matches!(first, QueueOutcome::Accepted { chunks: 6, .. }));
        let second = pipeline.queue_repository("R").await.unwrap();
        assert_eq!(second, QueueOutcome::AlreadyInProgress);
        assert_eq!(pipeline.queue_repository("other").await.unwrap(), QueueOutcome::NothingPending);
        assert_eq!(store.list_jobs(Some("R"), None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_then_complete() {
        let provider = Arc::new(ScriptedProvider::new(4));
        provider.fail_first.store(2, Ordering::SeqCst);
        let (pipeline, store) = build(provider, 10);
        store.upsert_chunks(&make_chunks("R", 3)).await.unwrap();
        pipeline.start().await.unwrap();
        pipeline.wait_idle().await;

        let jobs = store.list_jobs(Some("R"), None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert_eq!(jobs[0].attempts, 3);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let provider = Arc::new(ScriptedProvider::new(4));
        provider.fail_first.store(100, Ordering::SeqCst);
        let (pipeline, store) = build(provider, 10);
        store.upsert_chunks(&make_chunks("R", 2)).await.unwrap();
        pipeline.start().await.unwrap();
        pipeline.wait_idle().await;

        let jobs = store.list_jobs(Some("R"), None).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].attempts, 3);
        let stats = pipeline.stats(Some("R")).await.unwrap();
        assert_eq!(stats.repositories[0].failed, 2);
        assert_eq!(stats.repositories[0].pending, 0);
        assert!(stats.repositories[0].last_error.is_some());
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn interrupted_jobs_are_recovered_on_start() {
        let (pipeline, store) = build(Arc::new(ScriptedProvider::new(4)), 10);
        let chunks = make_chunks("R", 3);
        store.upsert_chunks(&chunks).await.unwrap();
        let mut job = EmbeddingJob::new("R", chunks.iter().map(|c| c.id.clone()).collect());
        job.transition(JobStatus::Running);
        store.insert_job(&job).await.unwrap();

        pipeline.start().await.unwrap();
        pipeline.wait_idle().await;

        let recovered = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Completed);
        // The startup sweep was coalesced into the recovered job.
        assert_eq!(store.list_jobs(Some("R"), None).await.unwrap().len(), 1);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn stopped_pipeline_rejects_work() {
        let (pipeline, store) = build(Arc::new(ScriptedProvider::new(4)), 4);
        store.upsert_chunks(&make_chunks("R", 2)).await.unwrap();
        pipeline.start().await.unwrap();
        pipeline.wait_idle().await;
        pipeline.stop().await;
        assert!(pipeline.queue_repository("R").await.is_err());
        assert!(pipeline.start().await.is_err());
    }

    #[tokio::test]
    async fn request_during_empty_read_is_not_lost() {
        let store = Arc::new(InMemoryStore::new());
        let chunks = Arc::new(SlowFirstRead {
            inner: store.clone(),
            delayed: AtomicBool::new(false),
        });
        let pipeline = assemble(
            Arc::new(ScriptedProvider::new(4)),
            chunks,
            store.clone(),
            embed_settings(4),
            settings(),
        );
        pipeline.start().await.unwrap();

        let first = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.queue_repository("R").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.upsert_chunks(&make_chunks("R", 3)).await.unwrap();
        let second = pipeline.queue_repository("R").await.unwrap();
        assert_eq!(second, QueueOutcome::AlreadyInProgress);

        // The first request read nothing, then picked up the new chunks.
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, QueueOutcome::Accepted { chunks: 3, .. }));

        pipeline.wait_idle().await;
        let stats = pipeline.stats(Some("R")).await.unwrap();
        assert_eq!(stats.repositories[0].embedded, 3);
        assert_eq!(stats.repositories[0].pending, 0);
        assert!(pipeline.state.lock().rescan.is_empty());
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn stop_lets_running_job_finish() {
        let provider = Arc::new(SlowProvider {
            inner: ScriptedProvider::new(4),
            delay: Duration::from_millis(200),
        });
        let (pipeline, store) = build(provider, 10);
        store.upsert_chunks(&make_chunks("R", 3)).await.unwrap();
        pipeline.start().await.unwrap();
        wait_until_running(&pipeline).await;

        pipeline.stop().await;

        let jobs = store.list_jobs(Some("R"), None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert!(store.pending_chunks("R").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_deadline_requeues_running_job() {
        let store = Arc::new(InMemoryStore::new());
        let mut short = settings();
        short.shutdown_timeout = Duration::from_millis(100);
        let slow = Arc::new(SlowProvider {
            inner: ScriptedProvider::new(4),
            delay: Duration::from_secs(30),
        });
        let pipeline = assemble(slow, store.clone(), store.clone(), embed_settings(10), short);
        store.upsert_chunks(&make_chunks("R", 3)).await.unwrap();
        pipeline.start().await.unwrap();
        wait_until_running(&pipeline).await;

        let started = std::time::Instant::now();
        pipeline.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));

        let jobs = store.list_jobs(Some("R"), None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Queued);
        assert_eq!(store.pending_chunks("R").await.unwrap().len(), 3);

        // The next process picks the job up again.
        let next = assemble(
            Arc::new(ScriptedProvider::new(4)),
            store.clone(),
            store.clone(),
            embed_settings(10),
            settings(),
        );
        next.start().await.unwrap();
        next.wait_idle().await;
        let job = store.get_job(&jobs[0].id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(store.pending_chunks("R").await.unwrap().is_empty());
        next.stop().await;
    }

    #[tokio::test]
    async fn stop_deadline_interrupts_provider_backoff() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(4));
        provider.fail_first.store(100, Ordering::SeqCst);
        let mut embed = embed_settings(10);
        embed.max_retries = 5;
        embed.retry_base = Duration::from_secs(60);
        let mut short = settings();
        short.shutdown_timeout = Duration::from_millis(100);
        let pipeline = assemble(provider.clone(), store.clone(), store.clone(), embed, short);
        store.upsert_chunks(&make_chunks("R", 2)).await.unwrap();
        pipeline.start().await.unwrap();
        wait_until_running(&pipeline).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while provider.calls.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let started = std::time::Instant::now();
        pipeline.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        // Sleeping in backoff, not retrying.
        assert_eq!(provider.calls.lock().len(), 1);

        let jobs = store.list_jobs(Some("R"), None).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Queued);
        assert_eq!(jobs[0].attempts, 1);
    }
}
