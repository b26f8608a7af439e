//! Error taxonomy for the response-orchestration core.
//!
//! Retrieval failures are recovered locally (graceful downgrade to the
//! conversational path) and cache failures are swallowed, so neither
//! appears on most request paths. Everything else is surfaced to the
//! caller with enough detail to tell retryable from non-retryable
//! conditions.

use thiserror::Error;

/// Error types surfaced by the chat core
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Rate limit exceeded: retry after {retry_after_secs} seconds")]
    RateLimited {
        reason: String,
        retry_after_secs: u64,
    },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Provider '{0}' is not available")]
    ProviderUnavailable(String),

    #[error("Provider '{provider}' failed: {reason}")]
    Provider { provider: String, reason: String },

    #[error("Worker script not found: {0}")]
    ScriptNotFound(String),

    #[error("Failed to spawn worker: {0}")]
    WorkerSpawn(String),

    #[error("Worker exited with code {code}: {stderr}")]
    WorkerExit { code: i32, stderr: String },

    #[error("Worker timed out after {0} seconds")]
    WorkerTimeout(u64),
}

impl ChatError {
    /// Whether the caller can reasonably retry the same request.
    ///
    /// Timeouts and unavailable backends are transient; validation
    /// failures and active blocks are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::WorkerTimeout(_)
                | ChatError::ProviderUnavailable(_)
                | ChatError::RetrievalUnavailable(_)
        )
    }
}
