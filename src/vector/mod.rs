//! Vector store adapters.
//!
//! | Provider | Type | Notes |
//! |----------|------|-------|
//! | `sqlite` | [`SqliteVectorStore`] | BLOB vectors in `chunk_vectors`, brute-force scan |
//! | `qdrant` | [`QdrantVectorStore`] | Qdrant REST API |
//! | `memory` | [`InMemoryVectorStore`] | process-local, lost on exit |
//!
//! Use [`create_vector_store`] to build the one selected in config.

mod qdrant;
mod sqlite;

use std::sync::Arc;

use anyhow::{bail, Result};
use sqlx::SqlitePool;

pub use qdrant::QdrantVectorStore;
pub use repo_rag_core::store::memory::InMemoryVectorStore;
pub use sqlite::SqliteVectorStore;

use repo_rag_core::store::VectorStore;

use crate::config::VectorStoreConfig;

pub fn create_vector_store(
    config: &VectorStoreConfig,
    pool: &SqlitePool,
) -> Result<Arc<dyn VectorStore>> {
    let metric = config.distance_metric()?;
    match config.provider.as_str() {
        "sqlite" => Ok(Arc::new(SqliteVectorStore::new(
            pool.clone(),
            &config.collection,
            metric,
        ))),
        "qdrant" => Ok(Arc::new(QdrantVectorStore::new(config, metric)?)),
        "memory" => Ok(Arc::new(InMemoryVectorStore::new())),
        other => bail!("Unknown vector_store provider: {}", other),
    }
}
