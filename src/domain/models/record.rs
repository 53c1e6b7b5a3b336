//! Rows written to the backend store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::query::Row;
use crate::domain::errors::{StoreError, StoreResult};

/// Table names used by the ingestion layer.
pub mod tables {
    pub const CALLS: &str = "calls";
    pub const TRANSCRIPTS: &str = "transcripts";
    pub const TOOL_CALLS: &str = "tool_calls";
    pub const LEADS: &str = "leads";
}

/// Serialize a record into a store row.
fn to_row<T: Serialize>(record: &T) -> StoreResult<Row> {
    match serde_json::to_value(record)? {
        Value::Object(row) => Ok(row),
        other => Err(StoreError::Serialization(format!(
            "record serialized to a non-object value: {other}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    InProgress,
    Completed,
}

/// Origin of a transcript row's `sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SequenceSource {
    /// Position assigned by the platform.
    Platform,
    /// Receive time in microseconds since the epoch.
    Received,
}

/// Row of the `calls` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub started_at: DateTime<Utc>,
    pub status: CallStatus,
}

impl CallRecord {
    pub fn to_row(&self) -> StoreResult<Row> {
        to_row(self)
    }

    /// Start fields only, for merging into a row that already exists.
    ///
    /// Status is left out: a call closed by an earlier `call-ended` stays closed.
    pub fn start_patch(&self) -> StoreResult<Row> {
        let mut row = to_row(self)?;
        row.remove("status");
        Ok(row)
    }
}

/// Patch applied to a `calls` row when the call ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallClosure {
    pub id: String,
    pub status: CallStatus,
    pub ended_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
}

impl CallClosure {
    pub fn to_row(&self) -> StoreResult<Row> {
        to_row(self)
    }
}

/// Row of the `transcripts` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub id: String,
    pub call_id: Option<String>,
    pub role: String,
    pub text: String,
    /// Monotonic position of the fragment within its call. Only comparable
    /// between rows with the same `sequence_source`.
    pub sequence: u64,
    pub sequence_source: SequenceSource,
    pub is_final: bool,
    pub spoken_at: DateTime<Utc>,
}

impl TranscriptRecord {
    pub fn to_row(&self) -> StoreResult<Row> {
        to_row(self)
    }
}

/// Row of the `tool_calls` table: one invocation and the answer given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallLog {
    pub id: String,
    pub call_id: Option<String>,
    pub function_name: String,
    pub arguments: Value,
    pub result: Value,
    pub created_at: DateTime<Utc>,
}

impl ToolCallLog {
    pub fn to_row(&self) -> StoreResult<Row> {
        to_row(self)
    }
}

/// Row of the `leads` table, keyed by phone number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub id: String,
    pub phone_number: String,
    pub source: String,
    pub last_call_id: String,
    pub last_contact_at: DateTime<Utc>,
}

impl LeadRecord {
    pub fn to_row(&self) -> StoreResult<Row> {
        to_row(self)
    }
}
