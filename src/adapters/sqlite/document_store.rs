//! SQLite implementation of the BackendStore.
//!
//! Every logical table lives in the single `records` table as JSON documents
//! keyed by `(tbl, id)`. Column predicates become `json_extract` expressions,
//! merges use `json_patch`, and grouped aggregation runs natively.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::query::QueryAs;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Sqlite, SqlitePool};

use crate::domain::errors::{StoreError, StoreResult};
use crate::domain::models::{
    ensure_id, validate_identifier, AggregateFn, AggregateSpec, Filter, FilterOp, Row, SelectQuery,
};
use crate::domain::ports::BackendStore;

const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn json_path(column: &str) -> String {
    format!("json_extract(doc, '$.{column}')")
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error().is_some_and(|db| db.is_unique_violation())
}

/// Append `AND ...` clauses for each filter, collecting bind values.
fn push_filters(sql: &mut String, bindings: &mut Vec<Value>, filters: &[Filter]) {
    for filter in filters {
        let path = json_path(&filter.column);
        match filter.op {
            FilterOp::In => {
                let candidates = filter.value.as_array().cloned().unwrap_or_default();
                if candidates.is_empty() {
                    sql.push_str(" AND 0");
                    continue;
                }
                let placeholders = vec!["?"; candidates.len()].join(", ");
                sql.push_str(&format!(" AND {path} IN ({placeholders})"));
                bindings.extend(candidates);
            }
            // IS / IS NOT so that missing columns compare as null.
            FilterOp::Eq => {
                sql.push_str(&format!(" AND {path} IS ?"));
                bindings.push(filter.value.clone());
            }
            FilterOp::Neq => {
                sql.push_str(&format!(" AND {path} IS NOT ?"));
                bindings.push(filter.value.clone());
            }
            op => {
                sql.push_str(&format!(" AND {path} {} ?", op.sql()));
                bindings.push(filter.value.clone());
            }
        }
    }
}

/// Bind a JSON scalar the way `json_extract` would return it.
fn bind_json<'q, O>(
    query: QueryAs<'q, Sqlite, O, SqliteArguments<'q>>,
    value: &Value,
) -> QueryAs<'q, Sqlite, O, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn parse_doc(doc: &str) -> StoreResult<Row> {
    Ok(serde_json::from_str(doc)?)
}

fn aggregate_expr(func: AggregateFn, column: Option<&str>) -> String {
    match (func, column) {
        (AggregateFn::Count, None) => "COUNT(*)".to_string(),
        (func, Some(column)) => format!("{}({})", func.as_str().to_uppercase(), json_path(column)),
        (func, None) => format!("{}(NULL)", func.as_str().to_uppercase()),
    }
}

#[async_trait]
impl BackendStore for SqliteDocumentStore {
    async fn insert(&self, table: &str, rows: Vec<Row>) -> StoreResult<()> {
        validate_identifier(table)?;
        let mut tx = self.pool.begin().await?;

        for mut row in rows {
            let id = ensure_id(&mut row);
            let doc = serde_json::to_string(&row)?;
            let result = sqlx::query("INSERT INTO records (tbl, id, doc) VALUES (?, ?, ?)")
                .bind(table)
                .bind(&id)
                .bind(&doc)
                .execute(&mut *tx)
                .await;

            match result {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(StoreError::Conflict {
                        table: table.to_string(),
                        id,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, table: &str, id: &str, mut patch: Row) -> StoreResult<u64> {
        validate_identifier(table)?;
        patch.remove("id");
        let patch = serde_json::to_string(&patch)?;

        let result = sqlx::query(&format!(
            "UPDATE records SET doc = json_patch(doc, ?), updated_at = {NOW} WHERE tbl = ? AND id = ?"
        ))
        .bind(&patch)
        .bind(table)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn upsert(&self, table: &str, rows: Vec<Row>, conflict_key: &str) -> StoreResult<u64> {
        validate_identifier(table)?;
        validate_identifier(conflict_key)?;
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for mut row in rows {
            if conflict_key == "id" {
                let id = ensure_id(&mut row);
                let doc = serde_json::to_string(&row)?;
                sqlx::query(&format!(
                    r#"INSERT INTO records (tbl, id, doc) VALUES (?, ?, ?)
                       ON CONFLICT (tbl, id) DO UPDATE
                       SET doc = json_patch(records.doc, excluded.doc), updated_at = {NOW}"#
                ))
                .bind(table)
                .bind(&id)
                .bind(&doc)
                .execute(&mut *tx)
                .await?;
                written += 1;
                continue;
            }

            let existing: Option<(String,)> = match row.get(conflict_key) {
                Some(key) if !key.is_null() => {
                    let sql = format!(
                        "SELECT id FROM records WHERE tbl = ? AND {} IS ? LIMIT 1",
                        json_path(conflict_key)
                    );
                    bind_json(sqlx::query_as(&sql).bind(table), key)
                        .fetch_optional(&mut *tx)
                        .await?
                }
                _ => None,
            };

            match existing {
                Some((id,)) => {
                    row.remove("id");
                    let patch = serde_json::to_string(&row)?;
                    sqlx::query(&format!(
                        "UPDATE records SET doc = json_patch(doc, ?), updated_at = {NOW} WHERE tbl = ? AND id = ?"
                    ))
                    .bind(&patch)
                    .bind(table)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    let id = ensure_id(&mut row);
                    let doc = serde_json::to_string(&row)?;
                    sqlx::query("INSERT INTO records (tbl, id, doc) VALUES (?, ?, ?)")
                        .bind(table)
                        .bind(&id)
                        .bind(&doc)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            written += 1;
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn select(&self, table: &str, query: &SelectQuery) -> StoreResult<Vec<Row>> {
        validate_identifier(table)?;
        query.validate()?;

        let mut sql = String::from("SELECT doc FROM records WHERE tbl = ?");
        let mut bindings: Vec<Value> = Vec::new();
        push_filters(&mut sql, &mut bindings, &query.filters);

        if let Some(order) = &query.order_by {
            let direction = if order.ascending { "ASC" } else { "DESC" };
            sql.push_str(&format!(" ORDER BY {} {direction}, id {direction}", json_path(&order.column)));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut q = sqlx::query_as::<_, (String,)>(&sql).bind(table);
        for binding in &bindings {
            q = bind_json(q, binding);
        }

        let docs = q.fetch_all(&self.pool).await?;
        docs.iter()
            .map(|(doc,)| parse_doc(doc).map(|row| query.project(row)))
            .collect()
    }

    async fn aggregate(&self, table: &str, spec: &AggregateSpec) -> StoreResult<Vec<Row>> {
        validate_identifier(table)?;
        spec.validate()?;

        let mut fields: Vec<String> = spec
            .group_by
            .iter()
            .map(|column| format!("'{column}', {}", json_path(column)))
            .collect();
        fields.extend(spec.aggregates.iter().map(|aggregation| {
            format!(
                "'{}', {}",
                aggregation.output_key(),
                aggregate_expr(aggregation.func, aggregation.column.as_deref())
            )
        }));

        let mut sql = format!("SELECT json_object({}) FROM records WHERE tbl = ?", fields.join(", "));
        let mut bindings: Vec<Value> = Vec::new();
        push_filters(&mut sql, &mut bindings, &spec.filters);

        if !spec.group_by.is_empty() {
            let keys: Vec<String> = spec.group_by.iter().map(|c| json_path(c)).collect();
            let keys = keys.join(", ");
            sql.push_str(&format!(" GROUP BY {keys} ORDER BY {keys}"));
        }

        let mut q = sqlx::query_as::<_, (String,)>(&sql).bind(table);
        for binding in &bindings {
            q = bind_json(q, binding);
        }

        let docs = q.fetch_all(&self.pool).await?;
        docs.iter().map(|(doc,)| parse_doc(doc)).collect()
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
