//! Batched, cached access to the backend store.
//!
//! Every read goes through [`cache_aside`] with a key that starts with
//! `"<table>:"`, so a write to a table can drop all of that table's cached
//! reads with a single `"<table>:*"` invalidation. Every read is timed into
//! the shared [`QueryMetrics`] buffer.

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::errors::{StoreError, StoreResult};
use crate::domain::models::{
    compare_values, row_id, AggregateFn, AggregateSpec, Filter, FilterOp, GatewayConfig, OrderBy,
    Page, PageRequest, Row, SelectQuery,
};
use crate::domain::ports::BackendStore;
use crate::services::cache_service::{cache_aside, JsonCache};
use crate::services::query_metrics::{timed, QueryMetrics};

/// A select to run as part of [`PersistenceGateway::parallel_queries`].
#[derive(Debug, Clone)]
pub struct NamedQuery {
    pub name: String,
    pub table: String,
    pub query: SelectQuery,
}

impl NamedQuery {
    pub fn new(name: impl Into<String>, table: impl Into<String>, query: SelectQuery) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            query,
        }
    }
}

/// How [`PersistenceGateway::insert_or_update`] landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
}

pub struct PersistenceGateway {
    store: Arc<dyn BackendStore>,
    cache: Arc<JsonCache>,
    metrics: Arc<QueryMetrics>,
    config: GatewayConfig,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn BackendStore>, cache: Arc<JsonCache>, config: GatewayConfig) -> Self {
        let metrics = Arc::new(QueryMetrics::new(config.metrics_capacity));
        Self {
            store,
            cache,
            metrics,
            config,
        }
    }

    pub fn metrics(&self) -> &Arc<QueryMetrics> {
        &self.metrics
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Fetch rows by id, serving what it can from the cache.
    ///
    /// Missing ids are read with one multi-id select. If that select fails,
    /// each id is read on its own and per-id failures are logged and skipped.
    /// Rows come back in the order their ids were first requested.
    pub async fn batch_fetch_by_ids(
        &self,
        table: &str,
        ids: &[String],
        columns: Option<&[String]>,
    ) -> StoreResult<Vec<Row>> {
        let projection = columns.map_or_else(|| "*".to_string(), |c| c.join(","));
        let key_for = |id: &str| format!("{table}:id:{id}:{projection}");

        let mut found: BTreeMap<String, Row> = BTreeMap::new();
        let mut missing: Vec<String> = Vec::new();
        for id in ids {
            if found.contains_key(id) || missing.contains(id) {
                continue;
            }
            match self.cache.get(&key_for(id)) {
                Some(Value::Object(row)) => {
                    found.insert(id.clone(), row);
                }
                _ => missing.push(id.clone()),
            }
        }

        let cache_hit = missing.is_empty();
        let (fetched, elapsed) = timed(self.fetch_missing(table, &missing, columns)).await;
        self.metrics.record(format!("{table}.batch_fetch"), elapsed, cache_hit);

        let ttl = Some(self.config.read_ttl());
        for row in fetched? {
            let Some(id) = row_id(&row) else { continue };
            let projected = match columns {
                Some(columns) => row
                    .into_iter()
                    .filter(|(key, _)| columns.iter().any(|column| column == key))
                    .collect(),
                None => row,
            };
            self.cache.set(key_for(&id), Value::Object(projected.clone()), ttl);
            found.insert(id, projected);
        }

        let mut rows = Vec::with_capacity(found.len());
        for id in ids {
            if let Some(row) = found.remove(id) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn fetch_missing(&self, table: &str, missing: &[String], columns: Option<&[String]>) -> StoreResult<Vec<Row>> {
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        // The id column is needed to key the cache, whatever the projection.
        let read_columns = columns.map(|columns| {
            let mut columns = columns.to_vec();
            if !columns.iter().any(|c| c == "id") {
                columns.push("id".to_string());
            }
            columns
        });
        let with_columns = |query: SelectQuery| match &read_columns {
            Some(columns) => query.columns(columns.clone()),
            None => query,
        };

        let ids: Vec<Value> = missing.iter().cloned().map(Value::String).collect();
        let batch = with_columns(SelectQuery::new().filter(Filter::is_in("id", ids)));
        match self.store.select(table, &batch).await {
            Ok(rows) => return Ok(rows),
            Err(e) => warn!(table, error = %e, ids = missing.len(), "batch fetch failed, reading ids one by one"),
        }

        let mut rows = Vec::new();
        for id in missing {
            let single = with_columns(SelectQuery::new().filter(Filter::eq("id", id.as_str())));
            match self.store.select(table, &single).await {
                Ok(found) => rows.extend(found),
                Err(e) => warn!(table, id = %id, error = %e, "fetch by id failed"),
            }
        }
        Ok(rows)
    }

    /// Cached select.
    pub async fn select(&self, table: &str, query: &SelectQuery) -> StoreResult<Vec<Row>> {
        let key = format!("{table}:select:{}", serde_json::to_string(query)?);
        let store = Arc::clone(&self.store);
        let owned_table = table.to_string();
        let query = query.clone();

        let value = self
            .cached_read(format!("{table}.select"), key, move || {
                let store = Arc::clone(&store);
                let table = owned_table.clone();
                let query = query.clone();
                async move { to_value(store.select(&table, &query).await?) }
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// One page of rows ordered by `request.order_by`, starting after the cursor.
    pub async fn paginated_query(&self, table: &str, request: &PageRequest) -> StoreResult<Page> {
        let page_size = request.page_size.unwrap_or(self.config.default_page_size).max(1);
        let mut query = SelectQuery {
            filters: request.filters.clone(),
            ..SelectQuery::default()
        };
        if let Some(cursor) = &request.cursor {
            let op = if request.ascending { FilterOp::Gt } else { FilterOp::Lt };
            query = query.filter(Filter::new(request.order_by.as_str(), op, cursor.clone()));
        }
        let order = if request.ascending {
            OrderBy::asc(request.order_by.as_str())
        } else {
            OrderBy::desc(request.order_by.as_str())
        };
        // One extra row tells whether another page exists.
        let query = query.order_by(order).limit(page_size + 1);
        query.validate()?;

        let key = format!("{table}:page:{}", serde_json::to_string(&(request, page_size))?);
        let store = Arc::clone(&self.store);
        let owned_table = table.to_string();
        let order_column = request.order_by.clone();

        let value = self
            .cached_read(format!("{table}.paginate"), key, move || {
                let store = Arc::clone(&store);
                let table = owned_table.clone();
                let query = query.clone();
                let order_column = order_column.clone();
                async move {
                    let mut data = store.select(&table, &query).await?;
                    let has_more = data.len() > page_size;
                    data.truncate(page_size);
                    let next_cursor = if has_more {
                        data.last().and_then(|row| row.get(&order_column)).cloned()
                    } else {
                        None
                    };
                    to_value(Page {
                        data,
                        next_cursor,
                        has_more,
                    })
                }
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Run every query concurrently. A failed query yields `None` and a log line.
    pub async fn parallel_queries(&self, queries: Vec<NamedQuery>) -> BTreeMap<String, Option<Vec<Row>>> {
        let runs = queries.into_iter().map(|named| async move {
            let result = self.select(&named.table, &named.query).await;
            (named, result)
        });

        join_all(runs)
            .await
            .into_iter()
            .map(|(named, result)| match result {
                Ok(rows) => (named.name, Some(rows)),
                Err(e) => {
                    warn!(query = %named.name, table = %named.table, error = %e, "parallel query failed");
                    (named.name, None)
                }
            })
            .collect()
    }

    /// Upsert all rows in one store call, falling back to one call per row.
    ///
    /// Any successful write invalidates the table's cached reads. Fails only
    /// when nothing could be written.
    pub async fn bulk_upsert(&self, table: &str, rows: Vec<Row>, conflict_key: &str) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let written = match self.store.upsert(table, rows.clone(), conflict_key).await {
            Ok(written) => written,
            Err(e) => {
                warn!(table, rows = rows.len(), error = %e, "bulk upsert failed, writing rows one by one");
                let mut written = 0;
                let mut last_error = None;
                for row in rows {
                    match self.store.upsert(table, vec![row], conflict_key).await {
                        Ok(n) => written += n,
                        Err(e) => {
                            warn!(table, error = %e, "upsert failed");
                            last_error = Some(e);
                        }
                    }
                }
                match last_error {
                    Some(e) if written == 0 => return Err(e),
                    _ => written,
                }
            }
        };

        self.invalidate_table(table);
        Ok(written)
    }

    /// Grouped aggregation, natively when the store supports it.
    ///
    /// Otherwise the filtered rows are read and folded here, as long as there
    /// are no more than `aggregate_row_ceiling` of them.
    pub async fn aggregate(&self, table: &str, spec: &AggregateSpec) -> StoreResult<Vec<Row>> {
        spec.validate()?;
        let key = format!("{table}:aggregate:{}", serde_json::to_string(spec)?);
        let store = Arc::clone(&self.store);
        let owned_table = table.to_string();
        let spec = spec.clone();
        let ceiling = self.config.aggregate_row_ceiling;

        let value = self
            .cached_read(format!("{table}.aggregate"), key, move || {
                let store = Arc::clone(&store);
                let table = owned_table.clone();
                let spec = spec.clone();
                async move {
                    match store.aggregate(&table, &spec).await {
                        Err(StoreError::Unsupported(_)) => {}
                        native => return to_value(native?),
                    }

                    info!(table = %table, backend = store.backend_name(), "aggregating in process");
                    let query = SelectQuery {
                        filters: spec.filters.clone(),
                        limit: Some(ceiling + 1),
                        ..SelectQuery::default()
                    };
                    let rows = store.select(&table, &query).await?;
                    if rows.len() > ceiling {
                        return Err(StoreError::AggregateTooLarge { table, ceiling });
                    }
                    to_value(compute_aggregates(&rows, &spec))
                }
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn insert(&self, table: &str, row: Row) -> StoreResult<()> {
        self.store.insert(table, vec![row]).await?;
        self.invalidate_table(table);
        Ok(())
    }

    pub async fn update(&self, table: &str, id: &str, patch: Row) -> StoreResult<u64> {
        let touched = self.store.update(table, id, patch).await?;
        if touched > 0 {
            self.invalidate_table(table);
        }
        Ok(touched)
    }

    /// Insert `row`; if its id already exists, merge `on_conflict` into the stored row instead.
    pub async fn insert_or_update(&self, table: &str, row: Row, on_conflict: Row) -> StoreResult<WriteOutcome> {
        let id = row_id(&row);
        match self.store.insert(table, vec![row]).await {
            Ok(()) => {
                self.invalidate_table(table);
                Ok(WriteOutcome::Inserted)
            }
            Err(e) if e.is_conflict() => {
                let Some(id) = id else { return Err(e) };
                debug!(table, id = %id, "row exists, merging");
                self.update(table, &id, on_conflict).await?;
                Ok(WriteOutcome::Updated)
            }
            Err(e) => Err(e),
        }
    }

    fn invalidate_table(&self, table: &str) -> usize {
        let removed = self.cache.invalidate(&format!("{table}:*"));
        if removed > 0 {
            debug!(table, removed, "invalidated cached reads");
        }
        removed
    }

    async fn cached_read<F, Fut>(&self, label: String, key: String, compute: F) -> StoreResult<Value>
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = StoreResult<Value>> + Send + 'static,
    {
        let read = cache_aside(Arc::clone(&self.cache), key, self.config.read_ttl(), compute);
        let (result, elapsed) = timed(read()).await;
        self.metrics
            .record(label, elapsed, result.as_ref().is_ok_and(|lookup| lookup.cache_hit));
        result.map(|lookup| lookup.value)
    }
}

fn to_value<T: Serialize>(value: T) -> StoreResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Fold rows into one output row per distinct group-by tuple, ordered by that tuple.
///
/// Without group-by columns there is exactly one output row, even for no input.
pub fn compute_aggregates(rows: &[Row], spec: &AggregateSpec) -> Vec<Row> {
    let mut groups: Vec<(Vec<Value>, Vec<&Row>)> = Vec::new();
    if spec.group_by.is_empty() {
        groups.push((Vec::new(), rows.iter().collect()));
    } else {
        for row in rows {
            let key: Vec<Value> = spec
                .group_by
                .iter()
                .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
                .collect();
            match groups.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, members)) => members.push(row),
                None => groups.push((key, vec![row])),
            }
        }
        groups.sort_by(|(a, _), (b, _)| {
            a.iter()
                .zip(b)
                .map(|(x, y)| compare_values(x, y).unwrap_or(Ordering::Equal))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        });
    }

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut out: Row = spec.group_by.iter().cloned().zip(key).collect();
            for aggregation in &spec.aggregates {
                let value = fold(aggregation.func, aggregation.column.as_deref(), &members);
                out.insert(aggregation.output_key(), value);
            }
            out
        })
        .collect()
}

fn fold(func: AggregateFn, column: Option<&str>, rows: &[&Row]) -> Value {
    let Some(column) = column else {
        return match func {
            AggregateFn::Count => Value::from(rows.len()),
            _ => Value::Null,
        };
    };

    let values: Vec<&Value> = rows
        .iter()
        .filter_map(|row| row.get(column))
        .filter(|value| !value.is_null())
        .collect();

    match func {
        AggregateFn::Count => Value::from(values.len()),
        AggregateFn::Min | AggregateFn::Max => {
            let want = if func == AggregateFn::Min { Ordering::Less } else { Ordering::Greater };
            values
                .into_iter()
                .reduce(|best, value| {
                    if compare_values(value, best) == Some(want) {
                        value
                    } else {
                        best
                    }
                })
                .cloned()
                .unwrap_or(Value::Null)
        }
        AggregateFn::Sum | AggregateFn::Avg => {
            let numbers: Vec<&serde_json::Number> = values
                .iter()
                .filter_map(|value| match value {
                    Value::Number(n) => Some(n),
                    _ => None,
                })
                .collect();
            if numbers.is_empty() {
                return Value::Null;
            }
            let total: f64 = numbers.iter().filter_map(|n| n.as_f64()).sum();
            if func == AggregateFn::Avg {
                return Value::from(total / numbers.len() as f64);
            }
            // Integer sums stay integers unless they overflow i64.
            numbers
                .iter()
                .try_fold(0_i64, |sum, n| n.as_i64().and_then(|n| sum.checked_add(n)))
                .map_or_else(|| Value::from(total), Value::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryStore, StoreOp};
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteDocumentStore};
    use crate::domain::models::Aggregation;
    use serde_json::json;
    use std::time::Duration;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn setup(store: Arc<InMemoryStore>) -> (PersistenceGateway, Arc<JsonCache>) {
        let cache = Arc::new(JsonCache::new(100, Duration::from_secs(60)));
        let gateway = PersistenceGateway::new(store, Arc::clone(&cache), GatewayConfig::default());
        (gateway, cache)
    }

    async fn seed_calls(store: &InMemoryStore, count: usize) {
        let rows = (1..=count)
            .map(|i| {
                let status = if i % 3 == 0 { "in-progress" } else { "completed" };
                row(json!({"id": format!("c{i:02}"), "seq": i, "status": status, "duration_seconds": i * 10}))
            })
            .collect();
        store.insert("calls", rows).await.unwrap();
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_batch_fetch_uses_one_read_then_cache() {
        let store = Arc::new(InMemoryStore::new());
        seed_calls(&store, 5).await;
        let (gateway, cache) = setup(Arc::clone(&store));

        let rows = gateway
            .batch_fetch_by_ids("calls", &ids(&["c03", "c01", "nope"]), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], "c03");
        assert_eq!(store.ops_for("calls").len(), 2);
        assert!(cache.peek("calls:id:c01:*").is_some());

        let again = gateway.batch_fetch_by_ids("calls", &ids(&["c01", "c03"]), None).await.unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(store.ops_for("calls").len(), 2);
    }

    #[tokio::test]
    async fn test_batch_fetch_degrades_to_per_id_reads() {
        let store = Arc::new(InMemoryStore::new());
        seed_calls(&store, 3).await;
        store.reject_multi_id_reads(true);
        let (gateway, _) = setup(Arc::clone(&store));

        let rows = gateway
            .batch_fetch_by_ids("calls", &ids(&["c01", "c02", "c03"]), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        let selects = store
            .ops_for("calls")
            .into_iter()
            .filter(|op| matches!(op, StoreOp::Select { .. }))
            .count();
        assert_eq!(selects, 4);
    }

    #[tokio::test]
    async fn test_batch_fetch_projection() {
        let store = Arc::new(InMemoryStore::new());
        seed_calls(&store, 2).await;
        let (gateway, cache) = setup(Arc::clone(&store));

        let columns = vec!["status".to_string()];
        let rows = gateway
            .batch_fetch_by_ids("calls", &ids(&["c01"]), Some(&columns))
            .await
            .unwrap();
        assert_eq!(rows[0].len(), 1);
        assert_eq!(rows[0]["status"], "completed");
        assert!(cache.peek("calls:id:c01:status").is_some());
    }

    #[tokio::test]
    async fn test_pagination_walks_all_rows() {
        let store = Arc::new(InMemoryStore::new());
        seed_calls(&store, 7).await;
        let (gateway, _) = setup(store);

        let first = gateway
            .paginated_query("calls", &PageRequest::new("seq").page_size(3))
            .await
            .unwrap();
        assert_eq!(first.data.len(), 3);
        assert!(first.has_more);
        assert_eq!(first.next_cursor, Some(json!(3)));

        let second = gateway
            .paginated_query("calls", &PageRequest::new("seq").page_size(3).after(json!(3)))
            .await
            .unwrap();
        assert_eq!(second.data[0]["seq"], 4);

        let last = gateway
            .paginated_query("calls", &PageRequest::new("seq").page_size(3).after(json!(6)))
            .await
            .unwrap();
        assert_eq!(last.data.len(), 1);
        assert!(!last.has_more);
        assert_eq!(last.next_cursor, None);
    }

    #[tokio::test]
    async fn test_descending_pagination_with_filter() {
        let store = Arc::new(InMemoryStore::new());
        seed_calls(&store, 6).await;
        let (gateway, _) = setup(store);

        let request = PageRequest::new("seq")
            .descending()
            .page_size(2)
            .filter(Filter::eq("status", "completed"));
        let page = gateway.paginated_query("calls", &request).await.unwrap();
        let seqs: Vec<_> = page.data.iter().map(|r| r["seq"].clone()).collect();
        assert_eq!(seqs, vec![json!(5), json!(4)]);
        assert_eq!(page.next_cursor, Some(json!(4)));
    }

    #[tokio::test]
    async fn test_parallel_queries_isolate_failures() {
        let store = Arc::new(InMemoryStore::new());
        seed_calls(&store, 3).await;
        let (gateway, _) = setup(store);

        let results = gateway
            .parallel_queries(vec![
                NamedQuery::new("open", "calls", SelectQuery::new().filter(Filter::eq("status", "in-progress"))),
                NamedQuery::new("broken", "calls", SelectQuery::new().filter(Filter::eq("bad column", 1))),
                NamedQuery::new("empty", "leads", SelectQuery::new()),
            ])
            .await;

        assert_eq!(results["open"].as_ref().map(Vec::len), Some(1));
        assert_eq!(results["broken"], None);
        assert_eq!(results["empty"].as_ref().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn test_bulk_upsert_invalidates_table_reads() {
        let store = Arc::new(InMemoryStore::new());
        seed_calls(&store, 2).await;
        let (gateway, cache) = setup(Arc::clone(&store));

        let query = SelectQuery::new().filter(Filter::eq("status", "completed"));
        assert_eq!(gateway.select("calls", &query).await.unwrap().len(), 2);
        cache.set("leads:select:x", json!([]), None);

        gateway
            .bulk_upsert("calls", vec![row(json!({"id": "c03", "status": "completed"}))], "id")
            .await
            .unwrap();
        assert!(cache.peek("leads:select:x").is_some());

        let reads_before = store.ops_for("calls").len();
        assert_eq!(gateway.select("calls", &query).await.unwrap().len(), 3);
        assert_eq!(store.ops_for("calls").len(), reads_before + 1);
    }

    #[tokio::test]
    async fn test_bulk_upsert_falls_back_to_sequential() {
        let store = Arc::new(InMemoryStore::new());
        store.reject_batch_upserts(true);
        let (gateway, _) = setup(Arc::clone(&store));

        let rows = vec![row(json!({"id": "a"})), row(json!({"id": "b"}))];
        let written = gateway.bulk_upsert("tool_calls", rows, "id").await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.rows("tool_calls").len(), 2);
    }

    #[tokio::test]
    async fn test_bulk_upsert_fails_when_nothing_written() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_writes_to("tool_calls");
        let (gateway, _) = setup(store);

        let result = gateway.bulk_upsert("tool_calls", vec![row(json!({"id": "a"}))], "id").await;
        assert!(matches!(result, Err(StoreError::Injected(_))));
    }

    #[tokio::test]
    async fn test_aggregate_fallback_in_process() {
        let store = Arc::new(InMemoryStore::new());
        seed_calls(&store, 6).await;
        let (gateway, _) = setup(store);

        let spec = AggregateSpec::new(vec![
            Aggregation::count(),
            Aggregation::of(AggregateFn::Sum, "duration_seconds"),
            Aggregation::of(AggregateFn::Max, "seq"),
        ])
        .group_by("status");
        let groups = gateway.aggregate("calls", &spec).await.unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0]["status"], "completed");
        assert_eq!(groups[0]["count"], 4);
        assert_eq!(groups[0]["sum_duration_seconds"], 10 + 20 + 40 + 50);
        assert_eq!(groups[1]["max_seq"], 6);
    }

    #[tokio::test]
    async fn test_aggregate_fallback_respects_ceiling() {
        let store = Arc::new(InMemoryStore::new());
        seed_calls(&store, 5).await;
        let cache = Arc::new(JsonCache::new(100, Duration::from_secs(60)));
        let config = GatewayConfig {
            aggregate_row_ceiling: 4,
            ..GatewayConfig::default()
        };
        let gateway = PersistenceGateway::new(store, cache, config);

        let spec = AggregateSpec::new(vec![Aggregation::count()]);
        assert!(matches!(
            gateway.aggregate("calls", &spec).await,
            Err(StoreError::AggregateTooLarge { ceiling: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_aggregate_native_on_sqlite() {
        let pool = create_migrated_test_pool().await.unwrap();
        let store = Arc::new(SqliteDocumentStore::new(pool));
        store
            .insert("calls", vec![row(json!({"id": "a", "duration_seconds": 30}))])
            .await
            .unwrap();
        let cache = Arc::new(JsonCache::new(100, Duration::from_secs(60)));
        let gateway = PersistenceGateway::new(store, cache, GatewayConfig::default());

        let spec = AggregateSpec::new(vec![Aggregation::count()]);
        let groups = gateway.aggregate("calls", &spec).await.unwrap();
        assert_eq!(groups[0]["count"], 1);
    }

    #[tokio::test]
    async fn test_reads_record_metrics() {
        let store = Arc::new(InMemoryStore::new());
        let (gateway, _) = setup(store);

        gateway.select("calls", &SelectQuery::new()).await.unwrap();
        gateway.select("calls", &SelectQuery::new()).await.unwrap();

        let metrics = gateway.metrics().snapshot();
        assert_eq!(metrics.len(), 2);
        assert!(!metrics[0].cache_hit);
        assert!(metrics[1].cache_hit);
        assert_eq!(metrics[1].label, "calls.select");
    }

    #[tokio::test]
    async fn test_insert_or_update_merges_on_conflict() {
        let store = Arc::new(InMemoryStore::new());
        let (gateway, _) = setup(Arc::clone(&store));

        let first = gateway
            .insert_or_update("calls", row(json!({"id": "c1", "status": "completed"})), Row::new())
            .await
            .unwrap();
        assert_eq!(first, WriteOutcome::Inserted);

        let second = gateway
            .insert_or_update(
                "calls",
                row(json!({"id": "c1", "status": "in-progress"})),
                row(json!({"phone_number": "5145550000"})),
            )
            .await
            .unwrap();
        assert_eq!(second, WriteOutcome::Updated);

        let stored = store.row("calls", "c1").unwrap();
        assert_eq!(stored["status"], "completed");
        assert_eq!(stored["phone_number"], "5145550000");
    }

    #[test]
    fn test_compute_aggregates_without_groups() {
        let spec = AggregateSpec::new(vec![
            Aggregation::count(),
            Aggregation::of(AggregateFn::Avg, "x"),
            Aggregation::of(AggregateFn::Min, "x"),
        ]);
        let rows = vec![row(json!({"x": 1})), row(json!({"x": 4})), row(json!({"y": 1}))];
        let out = compute_aggregates(&rows, &spec);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["count"], 3);
        assert_eq!(out[0]["avg_x"], 2.5);
        assert_eq!(out[0]["min_x"], 1);

        let empty = compute_aggregates(&[], &spec);
        assert_eq!(empty[0]["count"], 0);
        assert_eq!(empty[0]["avg_x"], Value::Null);
    }

    #[test]
    fn test_integer_sum_overflow_falls_back_to_float() {
        let spec = AggregateSpec::new(vec![Aggregation::of(AggregateFn::Sum, "x")]);

        let small = vec![row(json!({"x": 1})), row(json!({"x": 2}))];
        let out = compute_aggregates(&small, &spec);
        assert_eq!(out[0]["sum_x"], 3);
        assert!(out[0]["sum_x"].is_i64());

        let huge = vec![row(json!({"x": i64::MAX})), row(json!({"x": i64::MAX}))];
        let out = compute_aggregates(&huge, &spec);
        assert!(out[0]["sum_x"].is_f64());
        assert_eq!(out[0]["sum_x"].as_f64(), Some(i64::MAX as f64 * 2.0));

        let mixed = vec![row(json!({"x": 1})), row(json!({"x": 2.5}))];
        assert_eq!(compute_aggregates(&mixed, &spec)[0]["sum_x"], 3.5);
    }
}
