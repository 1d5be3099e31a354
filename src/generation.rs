//! Streaming generation providers.
//!
//! A [`GenerationProvider`] turns a message history into a [`TokenStream`]
//! of text fragments. Streams end when the provider finishes, fail with an
//! `Err` item on transport or parse errors, and stop yielding as soon as the
//! caller's [`CancellationToken`] fires. Dropping the stream closes the
//! upstream HTTP response.
//!
//! - `openai`: `POST {url}/v1/chat/completions` with `stream: true`, SSE `data:` lines.
//! - `ollama`: `POST {url}/api/chat` with `stream: true`, one JSON object per line.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::GenerationConfig;
use crate::embedding::{status_error, transport_error};

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// Start a generation. Errors before the first token (connection,
    /// non-success status) are returned directly; later ones arrive in the stream.
    async fn stream(
        &self,
        messages: Vec<PromptMessage>,
        cancel: CancellationToken,
    ) -> Result<TokenStream>;
}

pub struct DisabledGenerator;

#[async_trait]
impl GenerationProvider for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn stream(&self, _: Vec<PromptMessage>, _: CancellationToken) -> Result<TokenStream> {
        bail!("Generation provider is disabled")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dialect {
    OpenAI,
    Ollama,
}

/// HTTP chat-completion streaming for OpenAI-compatible and Ollama servers.
pub struct HttpGenerator {
    client: reqwest::Client,
    dialect: Dialect,
    model: String,
    url: String,
    api_key: Option<String>,
}

impl HttpGenerator {
    pub fn openai(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Self::build(
            config,
            Dialect::OpenAI,
            "https://api.openai.com",
            Some(api_key),
        )
    }

    pub fn ollama(config: &GenerationConfig) -> Result<Self> {
        Self::build(config, Dialect::Ollama, "http://localhost:11434", None)
    }

    fn build(
        config: &GenerationConfig,
        dialect: Dialect,
        default_url: &str,
        api_key: Option<String>,
    ) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            dialect,
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| default_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
        })
    }

    fn provider_name(&self) -> &'static str {
        match self.dialect {
            Dialect::OpenAI => "OpenAI",
            Dialect::Ollama => "Ollama",
        }
    }
}

#[derive(Serialize)]
struct StreamRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    stream: bool,
}

#[async_trait]
impl GenerationProvider for HttpGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        messages: Vec<PromptMessage>,
        cancel: CancellationToken,
    ) -> Result<TokenStream> {
        let endpoint = match self.dialect {
            Dialect::OpenAI => format!("{}/v1/chat/completions", self.url),
            Dialect::Ollama => format!("{}/api/chat", self.url),
        };
        let body = StreamRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
        };
        let mut req = self.client.post(endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let provider = self.provider_name();
        let resp = tokio::select! {
            _ = cancel.cancelled() => bail!("generation cancelled"),
            r = req.send() => r.map_err(|e| transport_error(provider, e))?,
        };
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(provider, status, &body));
        }

        let dialect = self.dialect;
        let tokens = stream_lines(resp.bytes_stream()).filter_map(move |line| async move {
            match line {
                Ok(line) => match dialect {
                    Dialect::OpenAI => parse_openai_line(&line),
                    Dialect::Ollama => parse_ollama_line(&line),
                },
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(tokens.take_until(cancel.cancelled_owned())))
    }
}

#[derive(Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<PromptMessage>,
    #[serde(default)]
    done: bool,
}

/// `Some(Ok)` for a content delta, `Some(Err)` for malformed lines, `None` to skip.
fn parse_ollama_line(line: &str) -> Option<Result<String>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<OllamaStreamChunk>(line) {
        Ok(chunk) => {
            if chunk.done {
                return None;
            }
            let content = chunk.message.map(|m| m.content).unwrap_or_default();
            (!content.is_empty()).then_some(Ok(content))
        }
        Err(e) => Some(Err(anyhow!("Failed to parse Ollama chunk: {e}"))),
    }
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

/// SSE variant: only `data:` lines carry payload, `[DONE]` ends the stream.
fn parse_openai_line(line: &str) -> Option<Result<String>> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => {
            let content = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .unwrap_or_default();
            (!content.is_empty()).then_some(Ok(content))
        }
        Err(e) => Some(Err(anyhow!("Failed to parse OpenAI chunk: {e}"))),
    }
}

/// Convert a byte stream into a stream of complete, non-blank lines.
///
/// Bytes are buffered until a newline so multi-byte characters split across
/// network chunks decode correctly.
pub(crate) fn stream_lines<S, E>(byte_stream: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures_util::stream::unfold(
        (Box::pin(byte_stream), Vec::<u8>::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let rest = buffer.split_off(pos + 1);
                    let line = String::from_utf8_lossy(&buffer).trim_end().to_string();
                    buffer = rest;
                    if !line.trim().is_empty() {
                        return Some((Ok(line), (stream, buffer)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        buffer.clear();
                        return Some((Err(anyhow!("Stream read error: {e}")), (stream, buffer)));
                    }
                    None => {
                        if buffer.iter().all(|b| b.is_ascii_whitespace()) {
                            return None;
                        }
                        let line = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        return Some((Ok(line), (stream, buffer)));
                    }
                }
            }
        },
    )
}

/// Create the [`GenerationProvider`] selected in configuration.
pub fn create_generation_provider(config: &GenerationConfig) -> Result<Arc<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(HttpGenerator::openai(config)?)),
        "ollama" => Ok(Arc::new(HttpGenerator::ollama(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
