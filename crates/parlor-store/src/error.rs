use thiserror::Error;

/// Errors produced by the store layer.
///
/// The first four business variants are terminal for a single request and
/// are reported to the caller only. Everything else means the storage itself
/// misbehaved.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed input or a business rule violation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Caller is authenticated but not allowed to touch the resource.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// A referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Uniqueness rule violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The blocking task running a query panicked or was cancelled.
    #[error("Storage task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// `true` when the failure came from storage rather than from the request.
    pub fn is_persistence(&self) -> bool {
        !matches!(
            self,
            StoreError::Validation(_)
                | StoreError::Permission(_)
                | StoreError::NotFound(_)
                | StoreError::Conflict(_)
        )
    }
}

/// Map `QueryReturnedNoRows` to [`StoreError::NotFound`] for `what`.
pub(crate) fn or_not_found(what: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(what.to_string()),
        other => StoreError::Sqlite(other),
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
