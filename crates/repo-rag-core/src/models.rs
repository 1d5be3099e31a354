//! Core data models used throughout repo-rag.
//!
//! These types represent the chunks, embedding jobs, and chat sessions that
//! flow through the embedding pipeline, the search service, and the chat
//! orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Raw chunk tuple produced by the (external) chunk extractor.
///
/// `content_hash` is optional: when the producer does not supply one, the
/// SHA-256 of `text` is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInput {
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub content_hash: Option<String>,
}

/// A retrievable span of source text with location metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic id derived from `(repository_id, file_path, start_line, end_line)`.
    pub id: String,
    pub repository_id: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub language: String,
    /// SHA-256 of the content (or the producer-supplied hash).
    pub content_hash: String,
    /// True once a vector for the current `content_hash` is in the vector store.
    pub embedded: bool,
}

impl Chunk {
    /// Build a chunk for `repository_id` from an extractor tuple.
    pub fn from_input(repository_id: &str, input: ChunkInput) -> Self {
        let content_hash = input
            .content_hash
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| hash_text(&input.text));
        Self {
            id: chunk_id(repository_id, &input.file_path, input.start_line, input.end_line),
            repository_id: repository_id.to_string(),
            file_path: input.file_path,
            start_line: input.start_line,
            end_line: input.end_line,
            content: input.text,
            language: input.language,
            content_hash,
            embedded: false,
        }
    }

    /// Size of the text sent to the embedding provider, in bytes.
    pub fn byte_len(&self) -> usize {
        self.content.len()
    }
}

/// Derive the stable chunk id for a location.
///
/// The id is the first 16 bytes of a SHA-256 over the location, formatted
/// as a UUID so that vector stores that only accept UUID point ids can use
/// it directly.
pub fn chunk_id(repository_id: &str, file_path: &str, start_line: u32, end_line: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repository_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(file_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(start_line.to_le_bytes());
    hasher.update(end_line.to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

/// Hex SHA-256 of a text.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lifecycle state of an [`EmbeddingJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A unit of pipeline work: one batch of one repository's chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub id: String,
    pub repository_id: String,
    pub chunk_ids: Vec<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmbeddingJob {
    pub fn new(repository_id: &str, chunk_ids: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            repository_id: repository_id.to_string(),
            chunk_ids,
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            enqueued_at: now,
            updated_at: now,
        }
    }

    /// Move to `status`, bumping `updated_at`.
    pub fn transition(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Author of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ChatRole::User),
            "assistant" => Some(ChatRole::Assistant),
            _ => None,
        }
    }
}

/// How an assistant turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Complete,
    /// The caller went away mid-stream; content is what was produced so far.
    Cancelled,
    /// Generation failed mid-stream; content is partial and `error` is set.
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Complete => "complete",
            MessageStatus::Cancelled => "cancelled",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(MessageStatus::Complete),
            "cancelled" => Some(MessageStatus::Cancelled),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

/// A retrieved chunk cited as grounding for an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReference {
    pub chunk_id: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub score: f64,
}

/// Estimated token counters for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One turn in a [`ChatSession`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Grounding references, in retrieval order. Always empty for user turns.
    pub references: Vec<ChunkReference>,
    pub usage: TokenUsage,
    pub status: MessageStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>, prompt_tokens: u32) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            references: Vec::new(),
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens: 0,
            },
            status: MessageStatus::Complete,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>, references: Vec<ChunkReference>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            references,
            usage: TokenUsage::default(),
            status: MessageStatus::Complete,
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// A conversation scoped to one user and optionally one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub repository_id: Option<String>,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(user_id: &str, repository_id: Option<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            repository_id,
            title: title.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-repository chunk counters, as reported by a chunk store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepositoryChunkCounts {
    pub repository_id: String,
    pub total: u64,
    pub embedded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(path: &str, start: u32, end: u32, text: &str) -> ChunkInput {
        ChunkInput {
            file_path: path.to_string(),
            start_line: start,
            end_line: end,
            text: text.to_string(),
            language: "rust".to_string(),
            content_hash: None,
        }
    }

    #[test]
    fn chunk_id_is_stable_for_same_location() {
        let a = Chunk::from_input("repo", input("src/lib.rs", 1, 10, "fn a() {}"));
        let b = Chunk::from_input("repo", input("src/lib.rs", 1, 10, "fn b() {}"));
        assert_eq!(a.id, b.id);
        assert_ne!(a.content_hash, b.content_hash);
    }

    #[test]
    fn chunk_id_differs_by_range_and_repository() {
        let base = chunk_id("repo", "src/lib.rs", 1, 10);
        assert_ne!(base, chunk_id("repo", "src/lib.rs", 1, 11));
        assert_ne!(base, chunk_id("other", "src/lib.rs", 1, 10));
        assert!(Uuid::parse_str(&base).is_ok());
    }

    #[test]
    fn producer_hash_is_kept() {
        let mut i = input("a.py", 1, 2, "x = 1");
        i.content_hash = Some("abc".to_string());
        let c = Chunk::from_input("repo", i);
        assert_eq!(c.content_hash, "abc");
        assert!(!c.embedded);
    }

    #[test]
    fn job_status_strings_round_trip() {
        for s in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn message_serializes_roles_in_snake_case() {
        let msg = ChatMessage::user("hi", 1);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["status"], "complete");
    }
}
