pub mod config;
pub mod event;
pub mod query;
pub mod record;

pub use config::{
    CacheConfig, Config, DatabaseConfig, GatewayConfig, LoggingConfig, PricingConfig,
    ServerConfig, ServiceArea, ToolsConfig,
};
pub use event::{
    CallPayload, EventType, InboundEvent, ToolCallRequest, ToolCallResult, TranscriptFragment,
};
pub use query::{
    compare_values, ensure_id, row_id, validate_identifier, AggregateFn, AggregateSpec,
    Aggregation, Filter, FilterOp, OrderBy, Page, PageRequest, Row, SelectQuery,
};
pub use record::{
    tables, CallClosure, CallRecord, CallStatus, LeadRecord, SequenceSource, ToolCallLog,
    TranscriptRecord,
};
