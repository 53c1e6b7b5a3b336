//! Port trait definitions (Hexagonal Architecture)
//!
//! Adapters under `crate::adapters` implement these traits; the services
//! only ever see the trait objects.

pub mod backend_store;

pub use backend_store::BackendStore;
