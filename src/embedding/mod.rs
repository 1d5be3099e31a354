//! Embedding provider implementations.
//!
//! Implements the core [`EmbeddingProvider`] trait for:
//! - **[`DisabledProvider`]**: returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: `POST {url}/v1/embeddings`, key from `OPENAI_API_KEY`.
//! - **[`OllamaProvider`]**: `POST {url}/api/embed` on a local Ollama.
//! - **[`HashingProvider`]**: deterministic feature-hashing vectors, no network.
//!
//! # Error classification
//!
//! Providers make one attempt per call; the Embedding Service owns retry.
//! - HTTP 429, 5xx, timeouts and connection errors → [`RagError::ProviderUnavailable`]
//! - other HTTP 4xx → [`RagError::ProviderRejected`]
//!
//! Inputs longer than `max_input_chars` bytes are cut on a UTF-8 boundary
//! before they are sent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};

use repo_rag_core::embedding::{l2_normalize, EmbeddingProvider};
use repo_rag_core::error::RagError;
use repo_rag_core::lexical::tokenize;

use crate::config::EmbeddingConfig;

/// Truncate `text` to at most `max_bytes`, splitting on a UTF-8 char boundary.
pub fn truncate_to_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Map a non-success HTTP status to the provider error taxonomy.
pub(crate) fn status_error(provider: &str, status: StatusCode, body: &str) -> anyhow::Error {
    let message = format!("{provider} API error {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        RagError::ProviderUnavailable(message).into()
    } else {
        RagError::ProviderRejected(message).into()
    }
}

pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> anyhow::Error {
    RagError::ProviderUnavailable(format!("{provider} connection error: {err}")).into()
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API (or a compatible gateway via `url`).
pub struct OpenAIProvider {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_input_chars: usize,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            max_input_chars: config.max_input_chars,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let input: Vec<&str> = texts
            .iter()
            .map(|t| truncate_to_char_boundary(t, self.max_input_chars))
            .collect();
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
        });

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("OpenAI", e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(status_error("OpenAI", status, &body_text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transport_error("OpenAI", e))?;
        let vectors = parse_openai_response(&json)?;
        check_count("OpenAI", texts.len(), vectors.len())?;
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaProvider {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    max_input_chars: usize,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_input_chars: config.max_input_chars,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let input: Vec<&str> = texts
            .iter()
            .map(|t| truncate_to_char_boundary(t, self.max_input_chars))
            .collect();
        // `truncate` asks Ollama to cut over-long inputs instead of failing.
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
            "truncate": true,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Ollama", e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(status_error("Ollama", status, &body_text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transport_error("Ollama", e))?;
        let vectors = parse_ollama_response(&json)?;
        check_count("Ollama", texts.len(), vectors.len())?;
        Ok(vectors)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

fn check_count(provider: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        bail!("{provider} returned {actual} embeddings for {expected} inputs");
    }
    Ok(())
}

// ============ Hashing Provider ============

/// Offline provider: signed feature hashing of the lexical tokens, L2-normalized.
///
/// Texts sharing identifiers land close together, which is enough for
/// local use and tests without an embedding service.
pub struct HashingProvider {
    model: String,
    dims: usize,
}

impl HashingProvider {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        if self.dims == 0 {
            return v;
        }
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Create the [`EmbeddingProvider`] selected in configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"hashing"` | [`HashingProvider`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        "hashing" => {
            let dims = config
                .dims
                .context("embedding.dims required for hashing provider")?;
            let model = config
                .model
                .clone()
                .unwrap_or_else(|| format!("hashing-{dims}"));
            Ok(Arc::new(HashingProvider::new(model, dims)))
        }
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_rag_core::embedding::cosine_similarity;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_to_char_boundary("short", 10), "short");
        // 'é' is two bytes; cutting at 2 would split it.
        assert_eq!(truncate_to_char_boundary("aé", 2), "a");
        assert_eq!(truncate_to_char_boundary("abcdef", 3), "abc");
    }

    #[test]
    fn status_classification() {
        let e = status_error("X", StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(
            RagError::find(&e),
            Some(RagError::ProviderUnavailable(_))
        ));
        let e = status_error("X", StatusCode::BAD_GATEWAY, "");
        assert!(RagError::is_retryable(&e));
        let e = status_error("X", StatusCode::BAD_REQUEST, "input too long");
        assert!(matches!(
            RagError::find(&e),
            Some(RagError::ProviderRejected(_))
        ));
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn ollama_response_parsing() {
        let json = serde_json::json!({ "embeddings": [[0.5, 0.5], [1.0, 0.0]] });
        assert_eq!(parse_ollama_response(&json).unwrap().len(), 2);
        let bad = serde_json::json!({ "embeddings": [1.0] });
        assert!(parse_ollama_response(&bad).is_err());
    }

    #[tokio::test]
    async fn hashing_provider_is_deterministic_and_normalized() {
        let p = HashingProvider::new("hash", 64);
        let texts = vec![
            "fn parse_request(input: &str)".to_string(),
            "fn parse_request(input: &str)".to_string(),
            "struct Config { bind: String }".to_string(),
        ];
        let v = p.embed(&texts).await.unwrap();
        assert_eq!(v.len(), 3);
        assert_eq!(v[0], v[1]);
        assert_eq!(v[0].len(), 64);
        let norm: f32 = v[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(cosine_similarity(&v[0], &v[1]) > cosine_similarity(&v[0], &v[2]));
    }

    #[test]
    fn disabled_and_unknown_providers() {
        let config = EmbeddingConfig::default();
        let p = create_provider(&config).unwrap();
        assert_eq!(p.model_name(), "disabled");

        let unknown = EmbeddingConfig {
            provider: "bogus".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&unknown).is_err());
    }
}
