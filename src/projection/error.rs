//! Error taxonomy for the projection core.
//!
//! Every variant is recoverable: the caller decides whether to correct its
//! input, retry, or fall back to the default basis. [`ProjectionError::kind`]
//! gives a stable machine-readable name for the outer layers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// Malformed request input (empty, non-alphabetic, or too long).
    #[error("invalid word {word:?}: {reason}")]
    InvalidWord { word: String, reason: String },

    /// Too few embeddings to fit a basis.
    #[error("need at least {required} embeddings to fit a basis, got {got}")]
    InsufficientData { required: usize, got: usize },

    /// Embedding length differs from the basis (or the first fit row).
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// The client referenced a basis id that was never fit.
    #[error("unknown basis: {0}")]
    UnknownBasis(String),

    /// The upstream embedding model failed or timed out.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The durable cache could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ProjectionError {
    pub fn invalid_word(word: &str, reason: impl Into<String>) -> Self {
        Self::InvalidWord {
            word: word.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidWord { .. } => "invalid_word",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::UnknownBasis(_) => "unknown_basis",
            Self::EmbeddingUnavailable(_) => "embedding_unavailable",
            Self::Storage(_) => "storage",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProjectionError>;
