//! Map-backed BackendStore.
//!
//! Has no server-side aggregation, records every operation it receives and
//! can be told to fail, which makes it the store of choice for tests and
//! `serve --memory` runs.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use crate::domain::errors::{StoreError, StoreResult};
use crate::domain::models::{
    compare_values, ensure_id, row_id, validate_identifier, FilterOp, Row, SelectQuery,
};
use crate::domain::ports::BackendStore;

/// One call received by the store, recorded whether or not it succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Insert { table: String, ids: Vec<String> },
    Update { table: String, id: String },
    Upsert { table: String, rows: usize, conflict_key: String },
    Select { table: String },
}

impl StoreOp {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. }
            | Self::Update { table, .. }
            | Self::Upsert { table, .. }
            | Self::Select { table } => table,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_tables: HashSet<String>,
    reject_multi_id_reads: bool,
    reject_batch_upserts: bool,
}

type Tables = BTreeMap<String, BTreeMap<String, Row>>;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    ops: Mutex<Vec<StoreOp>>,
    faults: Mutex<Faults>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to `table` fail until [`heal`](Self::heal) is called.
    pub fn fail_writes_to(&self, table: &str) {
        self.faults.lock().failing_tables.insert(table.to_string());
    }

    pub fn heal(&self, table: &str) {
        self.faults.lock().failing_tables.remove(table);
    }

    /// Reject selects with an `id IN (...)` filter naming more than one id.
    pub fn reject_multi_id_reads(&self, reject: bool) {
        self.faults.lock().reject_multi_id_reads = reject;
    }

    /// Reject upserts carrying more than one row.
    pub fn reject_batch_upserts(&self, reject: bool) {
        self.faults.lock().reject_batch_upserts = reject;
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().clone()
    }

    pub fn ops_for(&self, table: &str) -> Vec<StoreOp> {
        self.ops.lock().iter().filter(|op| op.table() == table).cloned().collect()
    }

    /// Current rows of a table, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Row> {
        self.tables.read().get(table).and_then(|rows| rows.get(id).cloned())
    }

    fn record(&self, op: StoreOp) {
        self.ops.lock().push(op);
    }

    fn check_writable(&self, table: &str) -> StoreResult<()> {
        validate_identifier(table)?;
        if self.faults.lock().failing_tables.contains(table) {
            return Err(StoreError::Injected(format!("writes to {table} are failing")));
        }
        Ok(())
    }
}

/// Shallow merge; `null` in the patch removes the column.
fn merge(target: &mut Row, patch: Row) {
    for (key, value) in patch {
        if key == "id" {
            continue;
        }
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

fn is_multi_id_read(query: &SelectQuery) -> bool {
    query.filters.iter().any(|filter| {
        filter.column == "id"
            && filter.op == FilterOp::In
            && filter.value.as_array().is_some_and(|ids| ids.len() > 1)
    })
}

#[async_trait]
impl BackendStore for InMemoryStore {
    async fn insert(&self, table: &str, rows: Vec<Row>) -> StoreResult<()> {
        let mut rows = rows;
        let ids: Vec<String> = rows.iter_mut().map(ensure_id).collect();
        self.record(StoreOp::Insert {
            table: table.to_string(),
            ids: ids.clone(),
        });
        self.check_writable(table)?;

        let mut tables = self.tables.write();
        let existing = tables.entry(table.to_string()).or_default();
        let mut seen = HashSet::new();
        if let Some(id) = ids.iter().find(|id| existing.contains_key(*id) || !seen.insert(*id)) {
            return Err(StoreError::Conflict {
                table: table.to_string(),
                id: id.clone(),
            });
        }

        existing.extend(ids.into_iter().zip(rows));
        Ok(())
    }

    async fn update(&self, table: &str, id: &str, patch: Row) -> StoreResult<u64> {
        self.record(StoreOp::Update {
            table: table.to_string(),
            id: id.to_string(),
        });
        self.check_writable(table)?;

        let mut tables = self.tables.write();
        match tables.get_mut(table).and_then(|rows| rows.get_mut(id)) {
            Some(row) => {
                merge(row, patch);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn upsert(&self, table: &str, rows: Vec<Row>, conflict_key: &str) -> StoreResult<u64> {
        self.record(StoreOp::Upsert {
            table: table.to_string(),
            rows: rows.len(),
            conflict_key: conflict_key.to_string(),
        });
        self.check_writable(table)?;
        validate_identifier(conflict_key)?;
        if rows.len() > 1 && self.faults.lock().reject_batch_upserts {
            return Err(StoreError::Injected("batch upsert rejected".to_string()));
        }

        let mut tables = self.tables.write();
        let existing = tables.entry(table.to_string()).or_default();
        let mut written = 0;

        for mut row in rows {
            let matched = match row.get(conflict_key) {
                Some(key) if !key.is_null() => existing
                    .iter()
                    .find(|(_, stored)| {
                        stored
                            .get(conflict_key)
                            .is_some_and(|value| compare_values(value, key) == Some(Ordering::Equal))
                    })
                    .map(|(id, _)| id.clone()),
                _ => None,
            };

            match matched {
                Some(id) => {
                    if let Some(stored) = existing.get_mut(&id) {
                        merge(stored, row);
                    }
                }
                None => {
                    let id = ensure_id(&mut row);
                    existing.insert(id, row);
                }
            }
            written += 1;
        }

        Ok(written)
    }

    async fn select(&self, table: &str, query: &SelectQuery) -> StoreResult<Vec<Row>> {
        self.record(StoreOp::Select {
            table: table.to_string(),
        });
        validate_identifier(table)?;
        query.validate()?;
        if is_multi_id_read(query) && self.faults.lock().reject_multi_id_reads {
            return Err(StoreError::Injected("multi-id read rejected".to_string()));
        }

        let mut rows: Vec<Row> = self
            .tables
            .read()
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| query.filters.iter().all(|filter| filter.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order_by {
            rows.sort_by(|a, b| {
                let null = Value::Null;
                let left = a.get(&order.column).unwrap_or(&null);
                let right = b.get(&order.column).unwrap_or(&null);
                let ordering = compare_values(left, right)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| row_id(a).cmp(&row_id(b)));
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        Ok(rows.into_iter().map(|row| query.project(row)).collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
