//! Domain errors for the callhook service.

use thiserror::Error;

/// Errors raised by a backend store or by the persistence gateway in front of it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Row {id} already exists in table {table}")]
    Conflict { table: String, id: String },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Operation not supported by this store: {0}")]
    Unsupported(&'static str),

    #[error("Aggregation over {table} exceeds the in-process ceiling of {ceiling} rows")]
    AggregateTooLarge { table: String, ceiling: usize },

    #[error("Injected failure: {0}")]
    Injected(String),
}

impl StoreError {
    /// Whether the error means the row already exists.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors surfaced while dispatching an inbound webhook event.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The caller sent a request it can correct (maps to 400).
    #[error("{0}")]
    MalformedRequest(String),

    /// The body was not a valid event document (maps to 500).
    #[error("Invalid event payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WebhookError {
    /// Whether the caller is at fault.
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::MalformedRequest(_))
    }
}
