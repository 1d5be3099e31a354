//! SQLite vector store: little-endian f32 BLOBs and a brute-force scan.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sqlx::{Row, SqlitePool};

use repo_rag_core::embedding::{blob_to_vec, vec_to_blob, DistanceMetric};
use repo_rag_core::error::RagError;
use repo_rag_core::store::{
    ChunkCandidate, CollectionSpec, CollectionStatus, SearchFilter, VectorPoint, VectorStore,
};

pub struct SqliteVectorStore {
    pool: SqlitePool,
    collection: String,
    metric: DistanceMetric,
    spec: RwLock<Option<CollectionSpec>>,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool, collection: &str, metric: DistanceMetric) -> Self {
        Self {
            pool,
            collection: collection.to_string(),
            metric,
            spec: RwLock::new(None),
        }
    }

    async fn load_spec(&self) -> Result<Option<CollectionSpec>> {
        let row = sqlx::query("SELECT dims, metric, model FROM vector_collections WHERE name = ?")
            .bind(&self.collection)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let dims: i64 = row.get("dims");
        let metric: String = row.get("metric");
        Ok(Some(CollectionSpec {
            dims: dims as usize,
            metric: DistanceMetric::parse(&metric).unwrap_or_default(),
            model: row.get("model"),
        }))
    }
}

fn unavailable(e: sqlx::Error) -> anyhow::Error {
    RagError::IndexUnavailable(format!("sqlite vector store: {e}")).into()
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<CollectionStatus> {
        if let Some(existing) = self.load_spec().await? {
            existing.ensure_compatible(spec)?;
            *self.spec.write() = Some(existing);
            return Ok(CollectionStatus::Existing);
        }

        sqlx::query(
            r#"
            INSERT INTO vector_collections (name, dims, metric, model, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(&self.collection)
        .bind(spec.dims as i64)
        .bind(spec.metric.as_str())
        .bind(&spec.model)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to create vector collection")?;

        *self.spec.write() = Some(spec.clone());
        Ok(CollectionStatus::Created)
    }

    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        let expected = self.spec.read().as_ref().map(|s| s.dims);
        if let Some(dims) = expected {
            if let Some(bad) = points.iter().find(|p| p.vector.len() != dims) {
                return Err(RagError::ProviderMismatch(format!(
                    "vector for {} has {} dimensions, collection expects {}",
                    bad.id,
                    bad.vector.len(),
                    dims
                ))
                .into());
            }
        }

        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        for p in points {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (collection, chunk_id, repository_id, file_path,
                                           language, content_hash, dims, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, chunk_id) DO UPDATE SET
                    repository_id = excluded.repository_id,
                    file_path = excluded.file_path,
                    language = excluded.language,
                    content_hash = excluded.content_hash,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&self.collection)
            .bind(&p.id)
            .bind(&p.payload.repository_id)
            .bind(&p.payload.file_path)
            .bind(&p.payload.language)
            .bind(&p.payload.content_hash)
            .bind(p.vector.len() as i64)
            .bind(vec_to_blob(&p.vector))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        }
        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, embedding
            FROM chunk_vectors
            WHERE collection = ?
              AND (? IS NULL OR repository_id = ?)
              AND (? IS NULL OR language = ? COLLATE NOCASE)
            "#,
        )
        .bind(&self.collection)
        .bind(&filter.repository_id)
        .bind(&filter.repository_id)
        .bind(&filter.language)
        .bind(&filter.language)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = self.metric.similarity(vector, &blob_to_vec(&blob)) as f64;
                ChunkCandidate::new(row.get::<String, _>("chunk_id"), score)
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(k);
        Ok(candidates)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "DELETE FROM chunk_vectors WHERE collection = ? AND chunk_id IN (SELECT value FROM json_each(?))",
        )
        .bind(&self.collection)
        .bind(serde_json::to_string(ids)?)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn delete_repository(&self, repository_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE collection = ? AND repository_id = ?")
            .bind(&self.collection)
            .bind(repository_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
