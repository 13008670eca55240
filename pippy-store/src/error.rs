//! Store error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Distinguished from I/O errors: callers treat this as "new record".
    #[error("key not found in store")]
    KeyNotFound,

    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("value serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("embedded store failed: {0}")]
    Embedded(#[from] redb::Error),

    #[error("database failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unsupported json path: {0}")]
    JsonPath(String),

    #[error("home directory unavailable")]
    NoHomeDir,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound)
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(err: redb::DatabaseError) -> Self {
        StoreError::Embedded(err.into())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(err: redb::TransactionError) -> Self {
        StoreError::Embedded(err.into())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(err: redb::TableError) -> Self {
        StoreError::Embedded(err.into())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(err: redb::StorageError) -> Self {
        StoreError::Embedded(err.into())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(err: redb::CommitError) -> Self {
        StoreError::Embedded(err.into())
    }
}
