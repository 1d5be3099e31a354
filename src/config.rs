use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use repo_rag_core::embedding::DistanceMetric;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/rrag.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible gateway or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    /// Requests per second toward the provider; 0 disables the limiter.
    #[serde(default)]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            max_batch_size: default_max_batch_size(),
            max_batch_bytes: default_max_batch_bytes(),
            max_input_chars: default_max_input_chars(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            timeout_secs: default_embedding_timeout(),
            requests_per_second: 0.0,
            burst: default_burst(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_max_batch_size() -> usize {
    32
}
fn default_max_batch_bytes() -> usize {
    65_536
}
fn default_max_input_chars() -> usize {
    3000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_embedding_timeout() -> u64 {
    30
}
fn default_burst() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default = "default_vector_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_vector_timeout")]
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: default_vector_provider(),
            url: None,
            collection: default_collection(),
            metric: default_metric(),
            timeout_secs: default_vector_timeout(),
        }
    }
}

impl VectorStoreConfig {
    pub fn distance_metric(&self) -> Result<DistanceMetric> {
        DistanceMetric::parse(&self.metric).with_context(|| {
            format!(
                "Unknown vector_store.metric: '{}'. Must be cosine, dot, or euclid.",
                self.metric
            )
        })
    }
}

fn default_vector_provider() -> String {
    "sqlite".to_string()
}
fn default_collection() -> String {
    "code_chunks".to_string()
}
fn default_metric() -> String {
    "cosine".to_string()
}
fn default_vector_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Periodic sweep of un-embedded chunks; 0 disables it.
    #[serde(default)]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_true")]
    pub resume_on_start: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            sweep_interval_secs: 0,
            resume_on_start: true,
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    2000
}
fn default_shutdown_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Weight of the vector list: `hybrid = α·vector + (1-α)·lexical`.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            default_k: default_k(),
            max_k: default_max_k(),
            timeout_secs: default_retrieval_timeout(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.5
}
fn default_k() -> usize {
    10
}
fn default_max_k() -> usize {
    100
}
fn default_retrieval_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            timeout_secs: default_generation_timeout(),
        }
    }
}

fn default_generation_timeout() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_context_chunks")]
    pub context_chunks: usize,
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            context_chunks: default_context_chunks(),
            max_history_turns: default_max_history_turns(),
            max_message_len: default_max_message_len(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

fn default_context_chunks() -> usize {
    8
}
fn default_max_history_turns() -> usize {
    10
}
fn default_max_message_len() -> usize {
    4000
}
fn default_idle_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a TOML config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if config.retrieval.default_k == 0 || config.retrieval.max_k < config.retrieval.default_k {
        bail!("retrieval.default_k must be >= 1 and <= retrieval.max_k");
    }

    if config.pipeline.workers == 0 {
        bail!("pipeline.workers must be >= 1");
    }
    if config.pipeline.max_attempts == 0 {
        bail!("pipeline.max_attempts must be >= 1");
    }

    let embedding = &config.embedding;
    if embedding.max_batch_size == 0 {
        bail!("embedding.max_batch_size must be >= 1");
    }
    if embedding.max_batch_bytes == 0 {
        bail!("embedding.max_batch_bytes must be >= 1");
    }
    if embedding.requests_per_second < 0.0 {
        bail!("embedding.requests_per_second must be >= 0");
    }
    match embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "hashing" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or hashing.",
            other
        ),
    }
    if embedding.is_enabled() {
        if embedding.dims.is_none() || embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                embedding.provider
            );
        }
    }

    match config.vector_store.provider.as_str() {
        "sqlite" | "memory" => {}
        "qdrant" => {
            if config.vector_store.url.is_none() {
                bail!("vector_store.url must be specified when provider is 'qdrant'");
            }
        }
        other => bail!(
            "Unknown vector_store provider: '{}'. Must be sqlite, qdrant, or memory.",
            other
        ),
    }
    config.vector_store.distance_metric()?;

    match config.generation.provider.as_str() {
        "disabled" => {}
        "openai" | "ollama" => {
            if config.generation.model.is_none() {
                bail!(
                    "generation.model must be specified when provider is '{}'",
                    config.generation.provider
                );
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.chat.context_chunks == 0 {
        bail!("chat.context_chunks must be >= 1");
    }

    Ok(())
}
