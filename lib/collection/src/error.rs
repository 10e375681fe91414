use thiserror::Error;
use uuid::Uuid;

/// Error kinds distinguishable by variant, never by message string, per the error-sentinel
/// redesign flag: callers match on `CollectionError` variants, not on `.to_string()` output.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("{what} already exists")]
    Exists { what: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("quota reached")]
    QuotaReached,

    #[error("shard {shard_id} is unavailable: {source}")]
    ShardUnavailable { shard_id: Uuid, source: Box<CollectionError> },

    #[error("shard {shard_id} already closed")]
    ShardClosed { shard_id: Uuid },

    #[error("operation timed out")]
    Timeout,

    #[error("conflicting outcome: {what}")]
    Conflict { what: String },

    #[error("{error}")]
    ServiceError { error: String },
}

impl CollectionError {
    pub fn service_error(error: impl Into<String>) -> Self {
        Self::ServiceError { error: error.into() }
    }
}

impl From<shard_engine::EngineError> for CollectionError {
    fn from(err: shard_engine::EngineError) -> Self {
        Self::service_error(err.to_string())
    }
}

impl From<std::io::Error> for CollectionError {
    fn from(err: std::io::Error) -> Self {
        Self::service_error(err.to_string())
    }
}

pub type CollectionResult<T> = Result<T, CollectionError>;
