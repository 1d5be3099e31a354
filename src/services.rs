//! Service wiring.
//!
//! [`AppServices::build`] opens the database, applies the schema and
//! constructs every service from one [`Config`]. The CLI commands and the
//! HTTP server share it. Nothing is started here: call
//! [`EmbeddingPipeline::start`] when background embedding is wanted.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use repo_rag_core::store::{ChunkStore, JobStore, LexicalIndex, SessionStore};

use crate::chat::{ChatOrchestrator, ChatSettings};
use crate::config::Config;
use crate::db;
use crate::embed_service::{EmbedSettings, EmbeddingService};
use crate::embedding::create_provider;
use crate::generation::create_generation_provider;
use crate::ingest::Ingestor;
use crate::migrate;
use crate::pipeline::{EmbeddingPipeline, PipelineSettings};
use crate::rate_limit::RateLimiter;
use crate::search::{SearchService, SearchSettings};
use crate::sqlite_store::SqliteStore;
use crate::vector::create_vector_store;

pub struct AppServices {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub embedding: Arc<EmbeddingService>,
    pub pipeline: Arc<EmbeddingPipeline>,
    pub search: Arc<SearchService>,
    pub chat: Arc<ChatOrchestrator>,
    pub ingest: Arc<Ingestor>,
}

impl AppServices {
    pub async fn build(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool)
            .await
            .context("Failed to apply database schema")?;
        Self::with_pool(config, pool)
    }

    /// Wire services on an already-migrated pool.
    pub fn with_pool(config: &Config, pool: SqlitePool) -> Result<Self> {
        let store = Arc::new(SqliteStore::new(pool.clone()));
        let chunks: Arc<dyn ChunkStore> = store.clone();
        let jobs: Arc<dyn JobStore> = store.clone();
        let lexical: Arc<dyn LexicalIndex> = store.clone();
        let sessions: Arc<dyn SessionStore> = store;

        let provider = create_provider(&config.embedding)?;
        let vectors = create_vector_store(&config.vector_store, &pool)?;
        let limiter = Arc::new(RateLimiter::new(
            config.embedding.requests_per_second,
            config.embedding.burst,
        ));
        let embedding = Arc::new(EmbeddingService::new(
            provider,
            vectors,
            chunks.clone(),
            limiter,
            EmbedSettings::from(&config.embedding),
            config.vector_store.distance_metric()?,
        ));

        let pipeline = EmbeddingPipeline::new(
            embedding.clone(),
            chunks.clone(),
            jobs,
            PipelineSettings::from(&config.pipeline),
        );
        let search = Arc::new(SearchService::new(
            embedding.clone(),
            lexical,
            chunks.clone(),
            SearchSettings::from(&config.retrieval),
        ));
        let chat = Arc::new(ChatOrchestrator::new(
            sessions,
            search.clone(),
            create_generation_provider(&config.generation)?,
            ChatSettings::from(&config.chat),
        ));
        let ingest = Arc::new(Ingestor::new(chunks, embedding.clone(), pipeline.clone()));

        Ok(Self {
            config: Arc::new(config.clone()),
            pool,
            embedding,
            pipeline,
            search,
            chat,
            ingest,
        })
    }
}
