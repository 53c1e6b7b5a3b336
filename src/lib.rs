//! callhook - webhook ingestion layer for a voice-agent call center
//!
//! A voice platform posts call lifecycle events and tool-call requests to a
//! single webhook. callhook answers tool calls inside the platform's latency
//! budget and persists call, lead, transcript and tool-call records without
//! holding the reply on the database.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): event and record models, the query vocabulary, store ports
//! - **Service Layer** (`services`): cache, tool answers, persistence gateway, webhook router
//! - **Adapters** (`adapters`): SQLite document store and an in-memory store
//! - **Infrastructure Layer** (`infrastructure`): configuration, logging, HTTP server
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use callhook::{adapters::memory::InMemoryStore, Config, JsonCache, WebhookRouter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let cache = Arc::new(JsonCache::from_config(&config.cache));
//!     let router = WebhookRouter::from_config(&config, Arc::new(InMemoryStore::new()), cache);
//!     let reply = router.handle(br#"{"type":"health-check"}"#).await;
//!     assert_eq!(reply.status, 200);
//! }
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::errors::{StoreError, StoreResult, WebhookError};
pub use domain::models::{
    AggregateSpec, Aggregation, CallStatus, Config, EventType, Filter, InboundEvent, OrderBy,
    PageRequest, Row, SelectQuery,
};
pub use domain::ports::BackendStore;
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    CacheService, JsonCache, PersistenceGateway, ToolResponseBuilder, WebhookReply, WebhookRouter,
};
