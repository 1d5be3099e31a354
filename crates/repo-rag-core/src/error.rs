//! Domain error taxonomy.
//!
//! Plumbing errors travel as [`anyhow::Error`]; the variants here are the
//! ones callers make decisions on (retry, degrade, reject). They are
//! recovered from an `anyhow::Error` with [`RagError::find`].

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RagError {
    /// Embedding or generation provider is unreachable, timed out, or rate limited.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider refused the request (client error other than rate limiting).
    #[error("provider rejected request: {0}")]
    ProviderRejected(String),

    /// Vector dimensionality or model disagrees with the configured embedding model.
    #[error("provider mismatch: {0}")]
    ProviderMismatch(String),

    /// Some chunks of a batch failed; the rest were embedded.
    #[error("{failed} of {total} chunks failed to embed")]
    PartialBatchFailure { failed: usize, total: usize },

    /// Vector store or lexical index is unreachable.
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    /// Session is busy or scoped to another repository.
    #[error("session conflict: {0}")]
    SessionConflict(String),

    /// Retrieval returned nothing for the query.
    #[error("no chunks matched the query")]
    RetrievalEmpty,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RagError {
    /// Find a `RagError` anywhere in an `anyhow` error chain.
    pub fn find(err: &anyhow::Error) -> Option<&RagError> {
        err.chain().find_map(|e| e.downcast_ref::<RagError>())
    }

    /// Transient failures worth retrying with backoff.
    pub fn is_retryable(err: &anyhow::Error) -> bool {
        matches!(
            Self::find(err),
            Some(RagError::ProviderUnavailable(_)) | Some(RagError::IndexUnavailable(_))
        )
    }
}
