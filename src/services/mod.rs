//! Application services: caching, tool answers, persistence and dispatch.

pub mod background;
pub mod cache_service;
pub mod persistence_gateway;
pub mod pricing;
pub mod query_metrics;
pub mod tool_responses;
pub mod webhook_router;

pub use background::{BackgroundStats, BackgroundWriter};
pub use cache_service::{cache_aside, CacheEntry, CacheService, CacheStats, JsonCache, Lookup, SweeperHandle};
pub use persistence_gateway::{NamedQuery, PersistenceGateway, WriteOutcome};
pub use pricing::{PricingCatalog, Quote};
pub use query_metrics::{timed, MetricsSummary, QueryMetric, QueryMetrics};
pub use tool_responses::{ToolFunction, ToolResponseBuilder};
pub use webhook_router::{RouterStats, WebhookReply, WebhookRouter};
