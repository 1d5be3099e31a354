//! Chat RAG Orchestrator: one user message in, a grounded streamed reply out.
//!
//! # Protocol
//!
//! 1. Resolve the session (created when absent) and claim it. A session
//!    with a reply still streaming is busy: `SessionConflict`.
//! 2. Check scope. A session's repository scope, once set, is fixed; an
//!    unscoped session adopts the scope of its first scoped request.
//! 3. Retrieve `chat.context_chunks` chunks with hybrid search in that
//!    scope. A retrieval error aborts before generation. An empty result
//!    switches the prompt to an explicit "no grounding found" instruction.
//! 4. Stream the generation. Tokens are forwarded as they arrive.
//! 5. Persist the user message and the assistant message in one append.
//!    Failed or cancelled replies are persisted with what was generated
//!    and their status.
//!
//! Dropping the returned [`ChatEventStream`] cancels the upstream
//! generation; the partial reply is still persisted.

use std::collections::HashSet;
use std::fmt::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use repo_rag_core::error::RagError;
use repo_rag_core::models::{
    ChatMessage, ChatRole, ChatSession, ChunkReference, MessageStatus, TokenUsage,
};
use repo_rag_core::store::{SearchFilter, SessionStore, SessionUpdate};

use crate::config::ChatConfig;
use crate::embedding::truncate_to_char_boundary;
use crate::generation::{GenerationProvider, PromptMessage, TokenStream};
use crate::search::{SearchHit, SearchService};

const TITLE_MAX_CHARS: usize = 60;

/// Chat-template markers that must not reach the model from user text.
const CONTROL_TOKENS: &[&str] = &[
    "<|im_start|>",
    "<|im_end|>",
    "<|endoftext|>",
    "<|system|>",
    "<|user|>",
    "<|assistant|>",
    "[INST]",
    "[/INST]",
    "<<SYS>>",
    "<</SYS>>",
];

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub context_chunks: usize,
    pub max_history_turns: usize,
    pub max_message_len: usize,
    pub idle_timeout: Duration,
}

impl From<&ChatConfig> for ChatSettings {
    fn from(config: &ChatConfig) -> Self {
        Self {
            context_chunks: config.context_chunks.max(1),
            max_history_turns: config.max_history_turns,
            max_message_len: config.max_message_len,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSession {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub repository_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessage {
    pub content: String,
    #[serde(default)]
    pub repository_id: Option<String>,
}

/// Events of one streamed reply, in order: `context`, any number of
/// `delta`, then `done` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Context {
        session_id: String,
        sources: Vec<ChunkReference>,
        grounded: bool,
    },
    Delta {
        content: String,
    },
    Done {
        message: ChatMessage,
    },
    Error {
        message: String,
        partial: bool,
    },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Context { .. } => "context",
            ChatEvent::Delta { .. } => "delta",
            ChatEvent::Done { .. } => "done",
            ChatEvent::Error { .. } => "error",
        }
    }
}

pub type ChatEventStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

/// Sessions with a reply in progress. The claim is released on drop.
#[derive(Default)]
struct BusySessions(Mutex<HashSet<String>>);

struct BusyGuard {
    busy: Arc<BusySessions>,
    session_id: String,
}

impl BusySessions {
    fn claim(self: &Arc<Self>, session_id: &str) -> Result<BusyGuard> {
        if !self.0.lock().insert(session_id.to_string()) {
            return Err(RagError::SessionConflict(format!(
                "session {session_id} is still streaming a reply"
            ))
            .into());
        }
        Ok(BusyGuard {
            busy: Arc::clone(self),
            session_id: session_id.to_string(),
        })
    }

    fn is_busy(&self, session_id: &str) -> bool {
        self.0.lock().contains(session_id)
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.0.lock().remove(&self.session_id);
    }
}

pub struct ChatOrchestrator {
    sessions: Arc<dyn SessionStore>,
    search: Arc<SearchService>,
    generator: Arc<dyn GenerationProvider>,
    settings: ChatSettings,
    busy: Arc<BusySessions>,
}

impl ChatOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        search: Arc<SearchService>,
        generator: Arc<dyn GenerationProvider>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            sessions,
            search,
            generator,
            settings,
            busy: Arc::new(BusySessions::default()),
        }
    }

    pub async fn create_session(&self, user_id: &str, new: NewSession) -> Result<ChatSession> {
        let title = new
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "New chat".to_string());
        let session = ChatSession::new(user_id, new.repository_id, title);
        self.sessions.create_session(&session).await?;
        info!(session_id = %session.id, user_id, "chat session created");
        Ok(session)
    }

    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<ChatSession>> {
        self.sessions.list_sessions(user_id).await
    }

    /// A session with its messages. Other users' sessions are reported as missing.
    pub async fn get_session(&self, user_id: &str, session_id: &str) -> Result<ChatSession> {
        match self.sessions.get_session(session_id).await? {
            Some(s) if s.user_id == user_id => Ok(s),
            _ => Err(RagError::NotFound(format!("session {session_id}")).into()),
        }
    }

    pub async fn update_session(
        &self,
        user_id: &str,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<ChatSession> {
        let session = self.get_session(user_id, session_id).await?;
        if let (Some(current), Some(wanted)) = (&session.repository_id, &update.repository_id) {
            if current != wanted {
                return Err(RagError::SessionConflict(format!(
                    "session is scoped to repository {current}"
                ))
                .into());
            }
        }
        if let Some(title) = &update.title {
            if title.trim().is_empty() {
                return Err(RagError::InvalidInput("title must not be empty".into()).into());
            }
        }
        self.sessions.update_session(session_id, &update).await?;
        self.get_session(user_id, session_id).await
    }

    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.get_session(user_id, session_id).await?;
        if self.busy.is_busy(session_id) {
            return Err(RagError::SessionConflict(format!(
                "session {session_id} is still streaming a reply"
            ))
            .into());
        }
        self.sessions.delete_session(session_id).await?;
        info!(session_id, "chat session deleted");
        Ok(())
    }

    /// Send a user message and stream the grounded reply.
    ///
    /// `session_id: None` creates a session titled after the message, stored
    /// only when the reply starts.
    /// Errors returned here happen before anything is streamed or
    /// persisted: invalid input, unknown session, `SessionConflict`,
    /// retrieval failure, or a generation provider that cannot start.
    pub async fn send_message(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        req: SendMessage,
    ) -> Result<(String, ChatEventStream)> {
        let content = sanitize(&req.content, self.settings.max_message_len);
        if content.is_empty() {
            return Err(RagError::InvalidInput("message must not be empty".into()).into());
        }

        // A new session is only stored once the reply can start.
        let (session, is_new) = match session_id {
            Some(id) => (self.get_session(user_id, id).await?, false),
            None => (
                ChatSession::new(user_id, req.repository_id.clone(), title_from(&content)),
                true,
            ),
        };
        let guard = self.busy.claim(&session.id)?;

        let scope = match (&session.repository_id, &req.repository_id) {
            (Some(current), Some(wanted)) if current != wanted => {
                return Err(RagError::SessionConflict(format!(
                    "session is scoped to repository {current}, request asked for {wanted}"
                ))
                .into());
            }
            (Some(current), _) => Some(current.clone()),
            (None, wanted) => wanted.clone(),
        };

        let filter = SearchFilter {
            repository_id: scope.clone(),
            language: None,
        };
        let retrieved = self
            .search
            .hybrid_search(&content, self.settings.context_chunks, &filter)
            .await?;
        if retrieved.degraded {
            warn!(session_id = %session.id, reason = ?retrieved.degraded_reason, "chat retrieval degraded");
        }
        let hits = retrieved.results;
        let grounded = !hits.is_empty();
        if !grounded {
            debug!(session_id = %session.id, error = %RagError::RetrievalEmpty, "answering without grounding");
        }

        let prompt = build_prompt(&session.messages, &hits, &content, self.settings.max_history_turns);
        let prompt_tokens = prompt.iter().map(|m| estimate_tokens(&m.content)).sum();

        let cancel = CancellationToken::new();
        let tokens = self.generator.stream(prompt, cancel.clone()).await?;

        if is_new {
            self.sessions.create_session(&session).await?;
            info!(session_id = %session.id, user_id, "chat session created");
        } else if session.repository_id.is_none() && scope.is_some() {
            let update = SessionUpdate {
                title: None,
                repository_id: scope.clone(),
            };
            self.sessions.update_session(&session.id, &update).await?;
        }

        let references: Vec<ChunkReference> = hits.iter().map(reference).collect();
        let (tx, rx) = mpsc::channel(64);
        let reply = Reply {
            session_id: session.id.clone(),
            user_message: ChatMessage::user(content, prompt_tokens),
            references,
            grounded,
            idle_timeout: self.settings.idle_timeout,
            sessions: Arc::clone(&self.sessions),
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(reply.run(tokens, guard));

        // Dropping the stream fires the token and stops the generation.
        let events = futures_util::stream::unfold(
            (rx, cancel.drop_guard()),
            |(mut rx, guard)| async move { rx.recv().await.map(|ev| (ev, (rx, guard))) },
        );
        Ok((session.id, Box::pin(events)))
    }
}

/// State of one streaming reply, owned by its task.
struct Reply {
    session_id: String,
    user_message: ChatMessage,
    references: Vec<ChunkReference>,
    grounded: bool,
    idle_timeout: Duration,
    sessions: Arc<dyn SessionStore>,
    tx: mpsc::Sender<ChatEvent>,
    cancel: CancellationToken,
}

impl Reply {
    async fn run(self, mut tokens: TokenStream, _guard: BusyGuard) {
        let _ = self
            .tx
            .send(ChatEvent::Context {
                session_id: self.session_id.clone(),
                sources: self.references.clone(),
                grounded: self.grounded,
            })
            .await;

        let mut content = String::new();
        let (status, error) = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break (MessageStatus::Cancelled, None),
                next = tokio::time::timeout(self.idle_timeout, tokens.next()) => next,
            };
            match next {
                Ok(Some(Ok(token))) => {
                    content.push_str(&token);
                    if self.tx.send(ChatEvent::Delta { content: token }).await.is_err() {
                        self.cancel.cancel();
                        break (MessageStatus::Cancelled, None);
                    }
                }
                Ok(Some(Err(e))) => break (MessageStatus::Failed, Some(format!("{e:#}"))),
                Ok(None) if self.cancel.is_cancelled() => break (MessageStatus::Cancelled, None),
                Ok(None) => break (MessageStatus::Complete, None),
                Err(_) => {
                    break (
                        MessageStatus::Failed,
                        Some(format!("generation idle for {:?}", self.idle_timeout)),
                    )
                }
            }
        };
        // Closes the upstream response.
        drop(tokens);

        let mut assistant = ChatMessage::assistant(content, self.references.clone());
        assistant.usage = TokenUsage {
            prompt_tokens: self.user_message.usage.prompt_tokens,
            completion_tokens: estimate_tokens(&assistant.content),
        };
        assistant.status = status;
        assistant.error = error.clone();

        let persisted = self
            .sessions
            .append_messages(&self.session_id, &[self.user_message.clone(), assistant.clone()])
            .await;
        if let Err(e) = &persisted {
            warn!(session_id = %self.session_id, error = %e, "could not persist chat exchange");
        }

        let event = match (status, persisted) {
            (MessageStatus::Complete, Ok(())) => ChatEvent::Done { message: assistant },
            (MessageStatus::Complete, Err(e)) => ChatEvent::Error {
                message: format!("reply could not be saved: {e:#}"),
                partial: false,
            },
            (_, _) => ChatEvent::Error {
                message: error.unwrap_or_else(|| "generation cancelled".to_string()),
                partial: !assistant.content.is_empty(),
            },
        };
        match status {
            MessageStatus::Complete => {
                info!(session_id = %self.session_id, completion_tokens = assistant_tokens(&event), "chat reply complete")
            }
            MessageStatus::Cancelled => info!(session_id = %self.session_id, "chat reply cancelled"),
            MessageStatus::Failed => warn!(session_id = %self.session_id, "chat reply failed"),
        }
        let _ = self.tx.send(event).await;
    }
}

fn assistant_tokens(event: &ChatEvent) -> u32 {
    match event {
        ChatEvent::Done { message } => message.usage.completion_tokens,
        _ => 0,
    }
}

fn reference(hit: &SearchHit) -> ChunkReference {
    ChunkReference {
        chunk_id: hit.chunk_id.clone(),
        file_path: hit.file_path.clone(),
        start_line: hit.start_line,
        end_line: hit.end_line,
        score: hit.score,
    }
}

/// Rough token count: about four characters per token.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

/// Trim, cap at `max_len` bytes and strip chat-template control tokens.
pub fn sanitize(text: &str, max_len: usize) -> String {
    let mut out = truncate_to_char_boundary(text.trim(), max_len).to_string();
    for token in CONTROL_TOKENS {
        if out.contains(token) {
            out = out.replace(token, "");
        }
    }
    out.trim().to_string()
}

fn title_from(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or_default().trim();
    let mut title: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    if first_line.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}

const SYSTEM_PROMPT: &str = "You are a code assistant answering questions about the user's repositories.\n\
Answer ONLY from the code excerpts included in the user's message. Never use outside knowledge.\n\
Cite every claim with its file path and line range, written as path:start-end.\n\
If the excerpts do not answer the question, say what you found and what is missing.\n\
Use markdown code blocks with language tags.";

const NO_GROUNDING_PROMPT: &str = "You are a code assistant answering questions about the user's repositories.\n\
No code matching the question was found in the indexed repositories.\n\
Say clearly that no grounding was found, do not invent file paths, line numbers or code, \
and suggest how the user could rephrase the question or which code to index.";

fn context_block(hits: &[SearchHit]) -> String {
    let mut ctx = String::from("Code excerpts from the repositories:\n\n");
    for hit in hits {
        let _ = write!(
            ctx,
            "--- {}:{}-{} [{}] ---\n{}\n\n",
            hit.file_path,
            hit.start_line,
            hit.end_line,
            hit.language,
            sanitize(&hit.content, usize::MAX)
        );
    }
    ctx
}

/// System prompt, recent history, then the question with its context.
fn build_prompt(
    history: &[ChatMessage],
    hits: &[SearchHit],
    question: &str,
    max_history_turns: usize,
) -> Vec<PromptMessage> {
    let recent: Vec<&ChatMessage> = history
        .iter()
        .filter(|m| !m.content.is_empty())
        .collect();
    let skip = recent.len().saturating_sub(max_history_turns);

    let mut messages = Vec::with_capacity(max_history_turns + 2);
    if hits.is_empty() {
        messages.push(PromptMessage::new("system", NO_GROUNDING_PROMPT));
    } else {
        messages.push(PromptMessage::new("system", SYSTEM_PROMPT));
    }
    for m in &recent[skip..] {
        let role = match m.role {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        };
        messages.push(PromptMessage::new(role, m.content.clone()));
    }
    let question = if hits.is_empty() {
        format!("(No relevant code was found for this question.)\n---\nQuestion: {question}")
    } else {
        format!("{}---\nQuestion: {question}", context_block(hits))
    };
    messages.push(PromptMessage::new("user", question));
    messages
}
