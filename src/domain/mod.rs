//! Domain layer for the callhook ingestion service
//!
//! This module contains the event and record models, the query vocabulary
//! shared by every backend store, and the port traits adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

// Re-export error types for convenient access
pub use errors::{StoreError, StoreResult, WebhookError};
