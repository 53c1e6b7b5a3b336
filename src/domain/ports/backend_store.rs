use async_trait::async_trait;

use crate::domain::errors::{StoreError, StoreResult};
use crate::domain::models::{AggregateSpec, Row, SelectQuery};

/// Table-style access to the durable backend store.
///
/// Every row carries a string `id` column. Tables are created on first write.
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Insert new rows. Fails with [`StoreError::Conflict`] if an id already exists.
    async fn insert(&self, table: &str, rows: Vec<Row>) -> StoreResult<()>;

    /// Merge `patch` into the row with the given id. Returns the number of rows touched.
    async fn update(&self, table: &str, id: &str, patch: Row) -> StoreResult<u64>;

    /// Insert-or-merge every row, matching existing rows on `conflict_key`.
    ///
    /// All rows are written in a single operation; returns the number of rows written.
    async fn upsert(&self, table: &str, rows: Vec<Row>, conflict_key: &str) -> StoreResult<u64>;

    /// Rows matching the query.
    async fn select(&self, table: &str, query: &SelectQuery) -> StoreResult<Vec<Row>>;

    /// Server-side grouped aggregation.
    ///
    /// Stores without native aggregation keep the default, and callers fall back
    /// to computing the aggregates themselves.
    async fn aggregate(&self, _table: &str, _spec: &AggregateSpec) -> StoreResult<Vec<Row>> {
        Err(StoreError::Unsupported("aggregate"))
    }

    /// Short name used in logs.
    fn backend_name(&self) -> &'static str;
}
