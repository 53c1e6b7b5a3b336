//! Logging infrastructure
//!
//! Structured logging using tracing and tracing-subscriber:
//! - JSON or pretty stdout formatting
//! - Optional rolling JSON log files via tracing-appender

pub mod logger;

pub use logger::LoggerImpl;
