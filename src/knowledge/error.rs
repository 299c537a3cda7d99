//! Knowledge engine errors
//!
//! Every failure carries a stable `kind()` plus a human-readable message.
//! Ingestion and search wrap their underlying cause once, so callers can
//! match on the outer operation and still reach the root cause.

use thiserror::Error;

/// Result alias used across the knowledge engine.
pub type KnowledgeResult<T> = std::result::Result<T, KnowledgeError>;

/// Knowledge engine error taxonomy
#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// File extension outside the supported set
    #[error("unsupported file format \"{0}\"")]
    UnsupportedFormat(String),

    /// Document parsed but contains no text
    #[error("document content is empty")]
    EmptyContent,

    /// Parser could not read the document
    #[error("corrupt document: {0}")]
    CorruptDocument(String),

    /// Embedding provider failure (transient failures are not retried here)
    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    /// Vector store / SQLite failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Target passage does not exist or belongs to another owner
    #[error("file does not exist or is not accessible")]
    NotFoundOrUnauthorized,

    /// Bad pagination, limit or query input
    #[error("validation error: {0}")]
    Validation(String),

    #[error("ingestion failed: {0}")]
    IngestionFailed(#[source] Box<KnowledgeError>),

    #[error("search failed: {0}")]
    SearchFailed(#[source] Box<KnowledgeError>),
}

impl KnowledgeError {
    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::EmptyContent => "empty_content",
            Self::CorruptDocument(_) => "corrupt_document",
            Self::EmbeddingProvider(_) => "embedding_provider_error",
            Self::Storage(_) => "storage_error",
            Self::NotFoundOrUnauthorized => "not_found_or_unauthorized",
            Self::Validation(_) => "validation_error",
            Self::IngestionFailed(_) => "ingestion_failed",
            Self::SearchFailed(_) => "search_failed",
        }
    }

    /// Innermost error behind any `IngestionFailed` / `SearchFailed` wrappers
    pub fn root_cause(&self) -> &KnowledgeError {
        match self {
            Self::IngestionFailed(inner) | Self::SearchFailed(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// Wrap as an ingestion failure.
    ///
    /// Validation errors pass through untouched since nothing was attempted.
    pub fn into_ingestion_failure(self) -> Self {
        match self {
            Self::IngestionFailed(_) | Self::Validation(_) => self,
            other => Self::IngestionFailed(Box::new(other)),
        }
    }

    /// Wrap as a search failure (same pass-through rules as ingestion).
    pub fn into_search_failure(self) -> Self {
        match self {
            Self::SearchFailed(_) | Self::Validation(_) => self,
            other => Self::SearchFailed(Box::new(other)),
        }
    }
}

impl From<rusqlite::Error> for KnowledgeError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<tokio::task::JoinError> for KnowledgeError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::Storage(format!("blocking store task failed: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingestion_wrapping_is_single_level() {
        let err = KnowledgeError::EmptyContent.into_ingestion_failure();
        let err = err.into_ingestion_failure();

        assert_eq!(err.kind(), "ingestion_failed");
        assert!(matches!(err.root_cause(), KnowledgeError::EmptyContent));
        assert!(err.to_string().contains("document content is empty"));
    }

    #[test]
    fn test_validation_is_not_wrapped() {
        let err = KnowledgeError::Validation("limit must be positive".into()).into_search_failure();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn test_sqlite_error_maps_to_storage() {
        let err: KnowledgeError = rusqlite::Error::InvalidQuery.into();
        assert_eq!(err.kind(), "storage_error");
    }
}
