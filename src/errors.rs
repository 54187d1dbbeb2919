use thiserror::Error;

/// Errors surfaced by the matching engine and its collaborators.
///
/// Provider failures are retryable from the caller's point of view; the
/// engine itself never retries.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("no stored preferences for user {0}")]
    ProfileNotFound(String),

    #[error("user {0} has no embedding; generate embeddings before matching")]
    MissingEmbedding(String),

    #[error("embedding provider error: {0}")]
    Provider(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<lancedb::Error> for MatchError {
    fn from(err: lancedb::Error) -> Self {
        MatchError::Database(err.to_string())
    }
}

impl From<arrow_schema::ArrowError> for MatchError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        MatchError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for MatchError {
    fn from(err: reqwest::Error) -> Self {
        MatchError::Provider(err.to_string())
    }
}
