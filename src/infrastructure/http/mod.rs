//! HTTP surface for the webhook router.
//!
//! One POST route carries every platform event; `/stats` exposes the
//! cache, query and background-write counters for operators.

pub mod server;

pub use server::{build_app, serve, shutdown_signal, RESPONSE_TIME_HEADER};
