//! Layered configuration: defaults, `.callhook/*.yaml`, then `CALLHOOK_*`
//! environment variables, validated before use.

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
