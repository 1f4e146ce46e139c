use thiserror::Error;

/// Errors surfaced by the memory subsystem.
///
/// Degenerate reads (empty index, nothing above threshold, an embedding
/// that resolves to no message) are not errors; they produce empty results.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The embedding provider failed. The calling operation made no state change.
    #[error("embedding generation failed: {0}")]
    EmbeddingGenerationFailed(String),

    /// A fact was added before any user context was stored.
    #[error("user context not initialized")]
    UserContextNotInitialized,

    /// Durable blob read or write failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted snapshot could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for MemoryError {
    fn from(err: std::io::Error) -> Self {
        MemoryError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
