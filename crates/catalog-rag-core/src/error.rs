//! Error taxonomy for the retrieval and answering pipeline.
//!
//! Every fallible core operation returns [`RagError`]. The variants map
//! one-to-one onto the handling policy of the answer orchestrator:
//!
//! | Variant | Policy |
//! |---------|--------|
//! | [`RagError::Config`] | fatal at startup, never retried |
//! | [`RagError::EmbeddingBackend`] / [`RagError::LlmBackend`] | retried with backoff while [`is_transient`](RagError::is_transient) |
//! | [`RagError::BackendTimeout`] | surfaced immediately |
//! | [`RagError::IndexCorruption`] | fatal, the collection must be rebuilt |
//! | [`RagError::InvalidFilter`] | degraded to an empty result by the retriever |
//! | [`RagError::Index`] | storage failure, surfaced |

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur anywhere in the pipeline.
#[derive(Debug, Error)]
pub enum RagError {
    /// Invalid configuration (chunk/overlap parameters, missing backend settings).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The embedding backend failed or was unreachable.
    #[error("Embedding backend error ({provider}): {message}")]
    EmbeddingBackend {
        /// The embedding provider that produced the error.
        provider: String,
        /// HTTP status code, when the backend answered at all.
        status: Option<u16>,
        /// A description of the failure.
        message: String,
    },

    /// The language model backend failed or was unreachable.
    #[error("LLM backend error ({provider}): {message}")]
    LlmBackend {
        /// The LLM provider that produced the error.
        provider: String,
        /// HTTP status code, when the backend answered at all.
        status: Option<u16>,
        /// A description of the failure.
        message: String,
    },

    /// A backend call exceeded its configured timeout.
    #[error("Backend timeout: {operation} did not complete within {timeout:?}")]
    BackendTimeout {
        /// The operation that timed out (e.g. `"embed"`, `"generate"`).
        operation: String,
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// Stored index data is inconsistent and the collection must be rebuilt.
    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    /// A search filter could not be applied.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// The index storage backend failed.
    #[error("Index error ({backend}): {message}")]
    Index {
        /// The index backend that produced the error.
        backend: String,
        /// A description of the failure.
        message: String,
    },
}

impl RagError {
    /// Build an [`RagError::EmbeddingBackend`] without an HTTP status.
    pub fn embedding(provider: impl Into<String>, message: impl Into<String>) -> Self {
        RagError::EmbeddingBackend {
            provider: provider.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Build an [`RagError::LlmBackend`] without an HTTP status.
    pub fn llm(provider: impl Into<String>, message: impl Into<String>) -> Self {
        RagError::LlmBackend {
            provider: provider.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Build an [`RagError::Index`].
    pub fn index(backend: impl Into<String>, message: impl Into<String>) -> Self {
        RagError::Index {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Whether a retry with backoff may succeed.
    ///
    /// Backend errors are transient unless the backend answered with a
    /// client error other than 429. Timeouts, configuration, and index
    /// errors are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            RagError::EmbeddingBackend { status, .. } | RagError::LlmBackend { status, .. } => {
                match status {
                    None => true,
                    Some(code) => *code == 429 || *code >= 500,
                }
            }
            _ => false,
        }
    }

    /// Whether the error means a backend (embedding or LLM) could not serve
    /// the request, as opposed to a local configuration or index problem.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            RagError::EmbeddingBackend { .. }
                | RagError::LlmBackend { .. }
                | RagError::BackendTimeout { .. }
        )
    }
}

/// A convenience result type for pipeline operations.
pub type Result<T> = std::result::Result<T, RagError>;
