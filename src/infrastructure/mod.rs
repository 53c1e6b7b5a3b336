//! Infrastructure layer module
//!
//! Configuration loading, logging setup and the HTTP server that exposes the
//! webhook router. Storage adapters live under `crate::adapters`.

pub mod config;
pub mod http;
pub mod logging;
