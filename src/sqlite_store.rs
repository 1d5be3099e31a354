//! SQLite-backed metadata store.
//!
//! One [`SqliteStore`] implements [`ChunkStore`], [`JobStore`],
//! [`SessionStore`] and [`LexicalIndex`] over the schema created by
//! [`migrate`](crate::migrate). The FTS5 table `chunks_fts` is written in
//! the same transaction as `chunks`, so lexical search never sees a chunk
//! the metadata store does not have.
//!
//! FTS content is stored pre-tokenized with the core tokenizer so that
//! identifiers like `parseHttpRequest` match the query `http`.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use repo_rag_core::error::RagError;
use repo_rag_core::lexical::tokenize;
use repo_rag_core::models::{
    ChatMessage, ChatRole, ChatSession, Chunk, ChunkReference, EmbeddingJob, JobStatus,
    MessageStatus, RepositoryChunkCounts, TokenUsage,
};
use repo_rag_core::store::{
    ChunkCandidate, ChunkStore, JobStore, LexicalIndex, SearchFilter, SessionStore,
    SessionUpdate,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Turn free text into an FTS5 query: every token quoted, OR-ed together.
///
/// Returns `None` when the text has no searchable tokens.
pub fn fts_query(text: &str) -> Option<String> {
    let mut tokens = tokenize(text);
    tokens.sort();
    tokens.dedup();
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    let start: i64 = row.get("start_line");
    let end: i64 = row.get("end_line");
    let embedded: i64 = row.get("embedded");
    Chunk {
        id: row.get("id"),
        repository_id: row.get("repository_id"),
        file_path: row.get("file_path"),
        start_line: start as u32,
        end_line: end as u32,
        content: row.get("content"),
        language: row.get("language"),
        content_hash: row.get("content_hash"),
        embedded: embedded != 0,
    }
}

fn row_to_job(row: &SqliteRow) -> Result<EmbeddingJob> {
    let status: String = row.get("status");
    let chunk_ids: String = row.get("chunk_ids");
    let attempts: i64 = row.get("attempts");
    Ok(EmbeddingJob {
        id: row.get("id"),
        repository_id: row.get("repository_id"),
        chunk_ids: serde_json::from_str(&chunk_ids).context("Corrupt chunk_ids column")?,
        status: JobStatus::parse(&status).ok_or_else(|| anyhow!("Unknown job status: {status}"))?,
        attempts: attempts as u32,
        last_error: row.get("last_error"),
        enqueued_at: from_millis(row.get("enqueued_at")),
        updated_at: from_millis(row.get("updated_at")),
    })
}

fn row_to_message(row: &SqliteRow) -> Result<ChatMessage> {
    let role: String = row.get("role");
    let status: String = row.get("status");
    let references: String = row.get("references_json");
    let prompt_tokens: i64 = row.get("prompt_tokens");
    let completion_tokens: i64 = row.get("completion_tokens");
    Ok(ChatMessage {
        role: ChatRole::parse(&role).ok_or_else(|| anyhow!("Unknown chat role: {role}"))?,
        content: row.get("content"),
        references: serde_json::from_str::<Vec<ChunkReference>>(&references)
            .context("Corrupt references_json column")?,
        usage: TokenUsage {
            prompt_tokens: prompt_tokens as u32,
            completion_tokens: completion_tokens as u32,
        },
        status: MessageStatus::parse(&status)
            .ok_or_else(|| anyhow!("Unknown message status: {status}"))?,
        error: row.get("error"),
        created_at: from_millis(row.get("created_at")),
    })
}

fn row_to_session(row: &SqliteRow) -> ChatSession {
    ChatSession {
        id: row.get("id"),
        user_id: row.get("user_id"),
        repository_id: row.get("repository_id"),
        title: row.get("title"),
        messages: Vec::new(),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

async fn write_chunk(conn: &mut SqliteConnection, chunk: &Chunk, now: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunks (id, repository_id, file_path, start_line, end_line,
                            content, language, content_hash, embedded, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
        ON CONFLICT(id) DO UPDATE SET
            content = excluded.content,
            language = excluded.language,
            embedded = CASE WHEN chunks.content_hash = excluded.content_hash
                            THEN chunks.embedded ELSE 0 END,
            content_hash = excluded.content_hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.repository_id)
    .bind(&chunk.file_path)
    .bind(chunk.start_line as i64)
    .bind(chunk.end_line as i64)
    .bind(&chunk.content)
    .bind(&chunk.language)
    .bind(&chunk.content_hash)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
        .bind(&chunk.id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        "INSERT INTO chunks_fts (chunk_id, repository_id, language, file_path, content) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&chunk.id)
    .bind(&chunk.repository_id)
    .bind(&chunk.language)
    .bind(tokenize(&chunk.file_path).join(" "))
    .bind(tokenize(&chunk.content).join(" "))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn remove_chunk(conn: &mut SqliteConnection, chunk_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn file_chunk_ids(
    conn: &mut SqliteConnection,
    repository_id: &str,
    file_path: &str,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT id FROM chunks WHERE repository_id = ? AND file_path = ? ORDER BY id",
    )
    .bind(repository_id)
    .bind(file_path)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

const CHUNK_COLUMNS: &str = "id, repository_id, file_path, start_line, end_line, content, language, content_hash, embedded";

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            write_chunk(&mut tx, chunk, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_file_chunks(
        &self,
        repository_id: &str,
        file_path: &str,
        chunks: &[Chunk],
    ) -> Result<Vec<String>> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        let removed: Vec<String> = file_chunk_ids(&mut tx, repository_id, file_path)
            .await?
            .into_iter()
            .filter(|id| !chunks.iter().any(|c| &c.id == id))
            .collect();
        for id in &removed {
            remove_chunk(&mut tx, id).await?;
        }
        for chunk in chunks {
            write_chunk(&mut tx, chunk, now).await?;
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn delete_file(&self, repository_id: &str, file_path: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let removed = file_chunk_ids(&mut tx, repository_id, file_path).await?;
        for id in &removed {
            remove_chunk(&mut tx, id).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn delete_repository(&self, repository_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE repository_id = ?")
            .bind(repository_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM chunks WHERE repository_id = ?")
            .bind(repository_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE id IN (SELECT value FROM json_each(?))"
        ))
        .bind(serde_json::to_string(ids)?)
        .fetch_all(&self.pool)
        .await?;

        let mut by_id: HashMap<String, Chunk> = rows
            .iter()
            .map(row_to_chunk)
            .map(|c| (c.id.clone(), c))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn pending_chunks(&self, repository_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE repository_id = ? AND embedded = 0 ORDER BY file_path, start_line, id"
        ))
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn repositories_with_pending(&self) -> Result<Vec<String>> {
        let repos = sqlx::query_scalar(
            "SELECT DISTINCT repository_id FROM chunks WHERE embedded = 0 ORDER BY repository_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(repos)
    }

    async fn mark_embedded(&self, chunk_id: &str, content_hash: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE chunks SET embedded = 1 WHERE id = ? AND content_hash = ?")
                .bind(chunk_id)
                .bind(content_hash)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn chunk_counts(
        &self,
        repository_id: Option<&str>,
    ) -> Result<Vec<RepositoryChunkCounts>> {
        let rows = sqlx::query(
            r#"
            SELECT repository_id, COUNT(*) AS total, COALESCE(SUM(embedded), 0) AS embedded
            FROM chunks
            WHERE (? IS NULL OR repository_id = ?)
            GROUP BY repository_id
            ORDER BY repository_id
            "#,
        )
        .bind(repository_id)
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let total: i64 = row.get("total");
                let embedded: i64 = row.get("embedded");
                RepositoryChunkCounts {
                    repository_id: row.get("repository_id"),
                    total: total as u64,
                    embedded: embedded as u64,
                }
            })
            .collect())
    }
}

#[async_trait]
impl LexicalIndex for SqliteStore {
    async fn lexical_search(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkCandidate>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
              AND (? IS NULL OR repository_id = ?)
              AND (? IS NULL OR language = ? COLLATE NOCASE)
            ORDER BY rank, chunk_id
            LIMIT ?
            "#,
        )
        .bind(&fts)
        .bind(&filter.repository_id)
        .bind(&filter.repository_id)
        .bind(&filter.language)
        .bind(&filter.language)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RagError::IndexUnavailable(format!("lexical search failed: {e}")))?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                ChunkCandidate::new(row.get::<String, _>("chunk_id"), -rank)
            })
            .collect())
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: &EmbeddingJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embedding_jobs (id, repository_id, chunk_ids, status, attempts,
                                        last_error, enqueued_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.repository_id)
        .bind(serde_json::to_string(&job.chunk_ids)?)
        .bind(job.status.as_str())
        .bind(job.attempts as i64)
        .bind(&job.last_error)
        .bind(to_millis(job.enqueued_at))
        .bind(to_millis(job.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &EmbeddingJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = ?, attempts = ?, last_error = ?, chunk_ids = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.attempts as i64)
        .bind(&job.last_error)
        .bind(serde_json::to_string(&job.chunk_ids)?)
        .bind(to_millis(job.updated_at))
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("job {}", job.id)).into());
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<EmbeddingJob>> {
        let row = sqlx::query("SELECT * FROM embedding_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_jobs(
        &self,
        repository_id: Option<&str>,
        status: Option<JobStatus>,
    ) -> Result<Vec<EmbeddingJob>> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(
            r#"
            SELECT * FROM embedding_jobs
            WHERE (? IS NULL OR repository_id = ?)
              AND (? IS NULL OR status = ?)
            ORDER BY enqueued_at, id
            "#,
        )
        .bind(repository_id)
        .bind(repository_id)
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(&self, session: &ChatSession) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO chat_sessions (id, user_id, repository_id, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.repository_id)
        .bind(&session.title)
        .bind(to_millis(session.created_at))
        .bind(to_millis(session.updated_at))
        .execute(&mut *tx)
        .await?;
        insert_messages(&mut tx, &session.id, 0, &session.messages).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        let Some(row) = sqlx::query("SELECT * FROM chat_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let mut session = row_to_session(&row);

        let rows = sqlx::query("SELECT * FROM chat_messages WHERE session_id = ? ORDER BY seq")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        session.messages = rows.iter().map(row_to_message).collect::<Result<_>>()?;
        Ok(Some(session))
    }

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_sessions WHERE user_id = ? ORDER BY updated_at DESC, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_session).collect())
    }

    async fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET title = COALESCE(?, title),
                repository_id = COALESCE(?, repository_id),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.title)
        .bind(&update.repository_id)
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_messages(&self, id: &str, messages: &[ChatMessage]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM chat_sessions WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            return Err(RagError::NotFound(format!("session {id}")).into());
        }

        let next_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM chat_messages WHERE session_id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        insert_messages(&mut tx, id, next_seq, messages).await?;

        sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
            .bind(to_millis(Utc::now()))
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn insert_messages(
    conn: &mut SqliteConnection,
    session_id: &str,
    first_seq: i64,
    messages: &[ChatMessage],
) -> Result<()> {
    for (i, msg) in messages.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO chat_messages (session_id, seq, role, content, references_json,
                                       prompt_tokens, completion_tokens, status, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(first_seq + i as i64)
        .bind(msg.role.as_str())
        .bind(&msg.content)
        .bind(serde_json::to_string(&msg.references)?)
        .bind(msg.usage.prompt_tokens as i64)
        .bind(msg.usage.completion_tokens as i64)
        .bind(msg.status.as_str())
        .bind(&msg.error)
        .bind(to_millis(msg.created_at))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_query_quotes_and_dedups_tokens() {
        assert_eq!(
            fts_query("parseHttp http \"drop\"").as_deref(),
            Some("\"drop\" OR \"http\" OR \"parse\"")
        );
        assert_eq!(fts_query("  ()  "), None);
    }

    #[test]
    fn millis_round_trip() {
        let now = Utc::now();
        let back = from_millis(to_millis(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
