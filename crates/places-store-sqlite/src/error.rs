use places_core::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("failed to format timestamp: {0}")]
    Timestamp(String),
}

/// Open-time failures. A store that reports one of these must not be used until the
/// file is repaired.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error(
        "database schema version {found} is newer than supported version {supported}; refusing to downgrade"
    )]
    Downgrade { found: i64, supported: i64 },
    #[error("database schema is invalid: {0}")]
    InvalidSchema(String),
    #[error("migration v{from}->v{to} failed: {reason}")]
    StepFailed {
        from: i64,
        to: i64,
        reason: String,
        /// Whether the pre-step table was confirmed intact after rollback.
        recovered: bool,
    },
}

pub(crate) trait ContextualError {
    fn into_store_error(self, context: String) -> StoreError;
}

impl ContextualError for rusqlite::Error {
    fn into_store_error(self, context: String) -> StoreError {
        StoreError::Storage { context, source: self }
    }
}

impl ContextualError for std::io::Error {
    fn into_store_error(self, context: String) -> StoreError {
        StoreError::Io { context, source: self }
    }
}

/// `.context(..)` for the error types the store wraps.
pub(crate) trait ErrorContext<T> {
    fn context(self, context: &str) -> Result<T, StoreError>;

    fn with_context<F>(self, context: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> String;
}

impl<T, E: ContextualError> ErrorContext<T> for Result<T, E> {
    fn context(self, context: &str) -> Result<T, StoreError> {
        self.map_err(|err| err.into_store_error(context.to_string()))
    }

    fn with_context<F>(self, context: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|err| err.into_store_error(context()))
    }
}
