use thiserror::Error;
use uuid::Uuid;

/// Node-level error kinds, distinguishable by variant rather than by message text.
///
/// `kind_tag`/`from_wire` implement the "error sentinel across RPC" redesign: a response
/// envelope carries this tag as a plain `u8` alongside the display string, so a caller on the
/// far side of a round trip reconstructs the right variant instead of collapsing everything to
/// `ServiceError`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{what} already exists")]
    Exists { what: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("quota reached")]
    QuotaReached,

    #[error("rpc to {dest} timed out")]
    Timeout { dest: String },

    #[error("shard {shard_id} unavailable: {reason}")]
    ShardUnavailable { shard_id: Uuid, reason: String },

    #[error("conflicting outcome: {what}")]
    Conflict { what: String },

    #[error("transport error contacting {dest}: {reason}")]
    Transport { dest: String, reason: String },

    #[error("{error}")]
    ServiceError { error: String },
}

/// Wire tag carried in the RPC response envelope alongside the display string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum ErrorTag {
    Exists = 1,
    NotFound = 2,
    QuotaReached = 3,
    Timeout = 4,
    ShardUnavailable = 5,
    Conflict = 6,
    Transport = 7,
    ServiceError = 0,
}

impl StorageError {
    pub fn service_error(error: impl Into<String>) -> Self {
        Self::ServiceError { error: error.into() }
    }

    pub fn wire_tag(&self) -> ErrorTag {
        match self {
            Self::Exists { .. } => ErrorTag::Exists,
            Self::NotFound { .. } => ErrorTag::NotFound,
            Self::QuotaReached => ErrorTag::QuotaReached,
            Self::Timeout { .. } => ErrorTag::Timeout,
            Self::ShardUnavailable { .. } => ErrorTag::ShardUnavailable,
            Self::Conflict { .. } => ErrorTag::Conflict,
            Self::Transport { .. } => ErrorTag::Transport,
            Self::ServiceError { .. } => ErrorTag::ServiceError,
        }
    }

    /// Reconstructs a best-effort variant from a wire tag and the message string the remote
    /// side sent. The message carries the only detail redb/shard-engine errors leave behind
    /// once they cross the wire; this rebuilds the right shape without ever matching on
    /// message text to decide which variant it is.
    pub fn from_wire(tag: ErrorTag, message: String) -> Self {
        match tag {
            ErrorTag::Exists => Self::Exists { what: message },
            ErrorTag::NotFound => Self::NotFound { what: message },
            ErrorTag::QuotaReached => Self::QuotaReached,
            ErrorTag::Timeout => Self::Timeout { dest: message },
            ErrorTag::ShardUnavailable => {
                Self::ShardUnavailable { shard_id: Uuid::nil(), reason: message }
            }
            ErrorTag::Conflict => Self::Conflict { what: message },
            ErrorTag::Transport => Self::Transport { dest: String::new(), reason: message },
            ErrorTag::ServiceError => Self::ServiceError { error: message },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<collection::CollectionError> for StorageError {
    fn from(err: collection::CollectionError) -> Self {
        match err {
            collection::CollectionError::Exists { what } => Self::Exists { what },
            collection::CollectionError::NotFound { what } => Self::NotFound { what },
            collection::CollectionError::QuotaReached => Self::QuotaReached,
            collection::CollectionError::ShardUnavailable { shard_id, source } => {
                Self::ShardUnavailable { shard_id, reason: source.to_string() }
            }
            collection::CollectionError::ShardClosed { shard_id } => {
                Self::ShardUnavailable { shard_id, reason: "shard already closed".into() }
            }
            collection::CollectionError::Timeout => {
                Self::Timeout { dest: "local shard manager".into() }
            }
            collection::CollectionError::Conflict { what } => Self::Conflict { what },
            collection::CollectionError::ServiceError { error } => Self::ServiceError { error },
        }
    }
}

impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        Self::service_error(err.to_string())
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::service_error(err.to_string())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        Self::service_error(err.to_string())
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        Self::service_error(err.to_string())
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        Self::service_error(err.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        Self::service_error(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::service_error(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StorageError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::service_error(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StorageError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::service_error(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
