//! Query vocabulary shared by every backend store.
//!
//! Rows are JSON documents. Filters, ordering and aggregation are expressed
//! against top-level document fields, so the same query runs unchanged on
//! the SQLite document store and the in-memory store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::domain::errors::{StoreError, StoreResult};

/// A stored row: a JSON object keyed by column name.
pub type Row = Map<String, Value>;

/// The string id of a row, if it has one.
pub fn row_id(row: &Row) -> Option<String> {
    match row.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Make sure the row has an id, generating one if needed, and return it.
pub fn ensure_id(row: &mut Row) -> String {
    if let Some(id) = row_id(row) {
        return id;
    }
    let id = uuid::Uuid::new_v4().to_string();
    row.insert("id".to_string(), Value::String(id.clone()));
    id
}

/// Check that a table or column name is a plain identifier.
///
/// Names end up inside SQL text and JSON paths, so only `[A-Za-z_][A-Za-z0-9_]*` passes.
pub fn validate_identifier(name: &str) -> StoreResult<&str> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOp {
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::In => "IN",
        }
    }
}

/// A single column predicate. For `In`, `value` is an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(column, FilterOp::In, Value::Array(values))
    }

    /// Evaluate the predicate against a row. Missing columns compare as null.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.column).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Eq => compare_values(actual, &self.value) == Some(Ordering::Equal),
            FilterOp::Neq => compare_values(actual, &self.value) != Some(Ordering::Equal),
            FilterOp::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::In => self.value.as_array().is_some_and(|candidates| {
                candidates
                    .iter()
                    .any(|candidate| compare_values(actual, candidate) == Some(Ordering::Equal))
            }),
        }
    }
}

/// Compare two JSON scalars the way SQL would: numbers numerically, strings
/// lexically, booleans as 0/1. Values of unrelated kinds do not compare.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

/// A select against one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    /// Columns to keep; all columns when `None`.
    pub columns: Option<Vec<String>>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Reject identifiers that cannot be embedded safely.
    pub fn validate(&self) -> StoreResult<()> {
        for filter in &self.filters {
            validate_identifier(&filter.column)?;
        }
        if let Some(order) = &self.order_by {
            validate_identifier(&order.column)?;
        }
        for column in self.columns.iter().flatten() {
            validate_identifier(column)?;
        }
        Ok(())
    }

    /// Keep only the projected columns of a row.
    pub fn project(&self, row: Row) -> Row {
        match &self.columns {
            None => row,
            Some(columns) => row
                .into_iter()
                .filter(|(key, _)| columns.iter().any(|column| column == key))
                .collect(),
        }
    }
}

/// A cursor-paginated request. The cursor is the ordering-column value of
/// the last row of the previous page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub order_by: String,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub cursor: Option<Value>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

const fn default_ascending() -> bool {
    true
}

impl PageRequest {
    pub fn new(order_by: impl Into<String>) -> Self {
        Self {
            order_by: order_by.into(),
            ascending: true,
            page_size: None,
            cursor: None,
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    #[must_use]
    pub fn after(mut self, cursor: Value) -> Self {
        self.cursor = Some(cursor);
        self
    }

    #[must_use]
    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// One page of a cursor-paginated result. `next_cursor` is absent on the last page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub data: Vec<Row>,
    pub next_cursor: Option<Value>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

/// One aggregate column. The output key is `<fn>_<column>`, or `count`
/// for a count without a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub func: AggregateFn,
    #[serde(default)]
    pub column: Option<String>,
}

impl Aggregation {
    pub const fn count() -> Self {
        Self {
            func: AggregateFn::Count,
            column: None,
        }
    }

    pub fn of(func: AggregateFn, column: impl Into<String>) -> Self {
        Self {
            func,
            column: Some(column.into()),
        }
    }

    pub fn output_key(&self) -> String {
        match &self.column {
            Some(column) => format!("{}_{}", self.func.as_str(), column),
            None => self.func.as_str().to_string(),
        }
    }
}

/// Grouped aggregation over one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSpec {
    #[serde(default)]
    pub group_by: Vec<String>,
    pub aggregates: Vec<Aggregation>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl AggregateSpec {
    pub fn new(aggregates: Vec<Aggregation>) -> Self {
        Self {
            group_by: Vec::new(),
            aggregates,
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.group_by.push(column.into());
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        for column in &self.group_by {
            validate_identifier(column)?;
        }
        for aggregation in &self.aggregates {
            if let Some(column) = &aggregation.column {
                validate_identifier(column)?;
            }
        }
        for filter in &self.filters {
            validate_identifier(&filter.column)?;
        }
        Ok(())
    }
}
