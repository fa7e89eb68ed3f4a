//! Error types for the `kb-rag` crate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in knowledge base operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// Invalid chunking parameters, unknown metadata keys, or an otherwise
    /// inconsistent configuration. Never retried.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// An error occurred during embedding generation, including timeouts.
    #[error("Embedding error ({provider}): {message}")]
    EmbeddingError {
        /// The embedding provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// A vector did not match the dimension already established by the index.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The dimension fixed by the index.
        expected: usize,
        /// The dimension of the offending vector.
        actual: usize,
    },

    /// Persisted index or manifest files are missing or inconsistent.
    ///
    /// Callers should rebuild from source documents rather than use a
    /// partially loaded index.
    #[error("Index corruption at {}: {message}", path.display())]
    IndexCorruption {
        /// The file that failed validation.
        path: PathBuf,
        /// A description of the inconsistency.
        message: String,
    },

    /// The query was rejected before touching the index.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// An unexpected filesystem failure outside of index loading.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error in the ingestion or query orchestration.
    #[error("Pipeline error: {0}")]
    PipelineError(String),
}

impl RagError {
    pub(crate) fn embedding(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EmbeddingError { provider: provider.into(), message: message.into() }
    }

    pub(crate) fn corruption(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::IndexCorruption { path: path.into(), message: message.into() }
    }

    /// Whether the failure is transient and the operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::EmbeddingError { .. })
    }

    /// Whether the failure was caused by the caller's input or configuration
    /// rather than by a backend.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::ConfigError(_) | Self::InvalidQuery(_))
    }
}

/// A convenience result type for knowledge base operations.
pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_embedding_errors_are_retryable() {
        assert!(RagError::embedding("fake", "timeout").is_retryable());
        assert!(!RagError::ConfigError("bad".into()).is_retryable());
        assert!(!RagError::DimensionMismatch { expected: 4, actual: 3 }.is_retryable());
        assert!(!RagError::corruption("index.bin", "truncated").is_retryable());
    }

    #[test]
    fn caller_errors_are_distinguished_from_backend_failures() {
        assert!(RagError::InvalidQuery("top_k".into()).is_caller_error());
        assert!(RagError::ConfigError("overlap".into()).is_caller_error());
        assert!(!RagError::embedding("fake", "503").is_caller_error());
    }

    #[test]
    fn corruption_message_names_the_file() {
        let err = RagError::corruption("/tmp/kb_index.bin", "truncated");
        assert_eq!(err.to_string(), "Index corruption at /tmp/kb_index.bin: truncated");
    }
}
