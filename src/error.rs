//! Error types for the context mesh.
//!
//! Every failure mode in the service maps to one of these kinds. Each
//! carries a `recoverable` signal so callers can decide whether a retry
//! is worthwhile: provider rate limits and backend hiccups are retryable,
//! malformed input and structurally invalid responses are not.
//!
//! Cache failures are deliberately soft — the orchestrator treats any
//! [`MeshError::Cache`] as "proceed without cache" rather than failing
//! the query.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MeshError>;

/// Failure kinds surfaced by the storage layers and the orchestrator.
#[derive(Error, Debug)]
pub enum MeshError {
    /// The embedding provider call failed, or returned output that does
    /// not line up with the request (wrong count, missing vectors).
    #[error("embedding failed: {reason}")]
    EmbeddingFailed { reason: String, recoverable: bool },

    /// Two vectors with different lengths were compared, or a vector of
    /// the wrong dimensionality was handed to a store.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The vector backend failed.
    #[error("vector store error: {reason}")]
    VectorStore { reason: String, recoverable: bool },

    /// The cache backend is unavailable. Always recoverable; callers
    /// should fall back to direct retrieval.
    #[error("cache error: {reason}")]
    Cache { reason: String },

    /// The graph backend failed. A traversal from a missing node is not
    /// an error (it yields an empty analysis); this covers real backend
    /// failures and relationship upserts with missing endpoints.
    #[error("graph error: {reason}")]
    Graph { reason: String, recoverable: bool },

    /// The caller's input is malformed: empty query text, a similarity
    /// threshold outside [0, 1], or a zero result limit.
    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },
}

impl MeshError {
    /// Whether a retry of the same operation could plausibly succeed.
    pub fn recoverable(&self) -> bool {
        match self {
            MeshError::EmbeddingFailed { recoverable, .. } => *recoverable,
            MeshError::DimensionMismatch { .. } => false,
            MeshError::VectorStore { recoverable, .. } => *recoverable,
            MeshError::Cache { .. } => true,
            MeshError::Graph { recoverable, .. } => *recoverable,
            MeshError::InvalidQuery { .. } => false,
        }
    }

    /// Shorthand for a recoverable embedding failure.
    pub fn embedding(reason: impl Into<String>) -> Self {
        MeshError::EmbeddingFailed {
            reason: reason.into(),
            recoverable: true,
        }
    }

    /// Shorthand for a non-recoverable embedding failure (structurally
    /// invalid provider response).
    pub fn embedding_fatal(reason: impl Into<String>) -> Self {
        MeshError::EmbeddingFailed {
            reason: reason.into(),
            recoverable: false,
        }
    }

    /// Shorthand for an invalid-query error.
    pub fn invalid_query(reason: impl Into<String>) -> Self {
        MeshError::InvalidQuery {
            reason: reason.into(),
        }
    }
}
