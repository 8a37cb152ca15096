use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("{operation} already in progress")]
    AlreadyInProgress { operation: &'static str },

    #[error("no active migration session")]
    NoSession,

    #[error("pagination cursor missing for partition {partition_key}")]
    MissingCursor { partition_key: String },

    #[error("invalid pagination cursor: {0}")]
    InvalidCursor(String),

    #[error("no records found for partition {partition_key}")]
    EmptyPartition { partition_key: String },

    #[error("no eligible candidate found after {attempts} discovery attempts")]
    DiscoveryExhausted { attempts: usize },

    #[error("no usable partition found after {attempts} selection attempts")]
    SelectionFailed { attempts: usize },

    #[error("safety limit of {limit} batches exceeded")]
    SafetyLimitExceeded { limit: usize },

    #[error("migration session was reset while the operation was in flight")]
    SessionReset,
}

pub type Result<T> = std::result::Result<T, BackfillError>;

impl BackfillError {
    /// Pagination-cursor failures. `process_all_batches` ends the session
    /// gracefully on these instead of propagating them.
    pub fn is_cursor_error(&self) -> bool {
        match self {
            BackfillError::MissingCursor { .. } | BackfillError::InvalidCursor(_) => true,
            BackfillError::Store(msg) => msg.to_ascii_lowercase().contains("cursor"),
            _ => false,
        }
    }

    /// Caller misuse rather than environment flakiness.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BackfillError::InvalidArgument(_)
                | BackfillError::AlreadyInProgress { .. }
                | BackfillError::NoSession
                | BackfillError::MissingCursor { .. }
        )
    }
}

impl From<serde_json::Error> for BackfillError {
    fn from(e: serde_json::Error) -> Self {
        BackfillError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for BackfillError {
    fn from(e: std::io::Error) -> Self {
        BackfillError::Config(e.to_string())
    }
}
