//! Inbound events posted by the voice platform.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::any::type_name;
use std::fmt;
use tracing::warn;

/// Classification of an inbound event by its `type` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    HealthCheck,
    ToolCalls,
    CallStarted,
    Transcript,
    CallEnded,
    /// Any tag this service does not know yet.
    Other(String),
}

impl EventType {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "health-check" => Self::HealthCheck,
            "tool-calls" => Self::ToolCalls,
            "call-started" => Self::CallStarted,
            "transcript" => Self::Transcript,
            "call-ended" => Self::CallEnded,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::HealthCheck => "health-check",
            Self::ToolCalls => "tool-calls",
            Self::CallStarted => "call-started",
            Self::Transcript => "transcript",
            Self::CallEnded => "call-ended",
            Self::Other(tag) => tag,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event as posted to the webhook endpoint.
///
/// Only `type` is mandatory. A payload section that does not match its
/// expected shape is logged and dropped instead of failing the event, so one
/// bad field never costs the platform its tool results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default, deserialize_with = "lenient")]
    pub call: Option<CallPayload>,

    #[serde(default, deserialize_with = "lenient")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,

    #[serde(default, deserialize_with = "lenient")]
    pub transcript: Option<TranscriptFragment>,
}

impl InboundEvent {
    pub fn kind(&self) -> EventType {
        EventType::parse(&self.event_type)
    }

    /// Call id carried by the event, if any.
    pub fn call_id(&self) -> Option<&str> {
        self.call
            .as_ref()
            .and_then(|call| call.id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Deserialize an optional value, treating a mistyped one as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.filter(|value| !value.is_null()).and_then(|value| {
        serde_json::from_value(value)
            .map_err(|error| {
                warn!(field = type_name::<T>(), error = %error, "ignoring malformed event field");
            })
            .ok()
    }))
}

/// Call reference as sent by the platform. Every field is optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallPayload {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,

    #[serde(default, deserialize_with = "lenient")]
    pub phone_number: Option<String>,

    #[serde(default, deserialize_with = "lenient")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, deserialize_with = "lenient")]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default, deserialize_with = "lenient")]
    pub duration_seconds: Option<f64>,

    #[serde(default, deserialize_with = "lenient")]
    pub end_reason: Option<String>,
}

impl CallPayload {
    /// Phone number with surrounding whitespace removed; `None` when blank.
    pub fn phone(&self) -> Option<&str> {
        self.phone_number
            .as_deref()
            .map(str::trim)
            .filter(|number| !number.is_empty())
    }
}

/// A synchronous function-call request. Exactly one result is produced per request.
///
/// Accepts `{id, function: {name, arguments}}` or the flat
/// `{id, functionName, arguments}`. Conversion never fails: an entry with no
/// usable name gets an empty `function_name` and is answered with the
/// unknown-function fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "Value")]
pub struct ToolCallRequest {
    pub id: String,
    pub function_name: String,
    pub arguments: Map<String, Value>,
}

impl From<Value> for ToolCallRequest {
    fn from(raw: Value) -> Self {
        let id = match raw.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => String::new(),
        };
        let function = raw.get("function").filter(|function| function.is_object());
        let function_name = function
            .and_then(|function| function.get("name"))
            .or_else(|| raw.get("functionName"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let arguments = function
            .and_then(|function| function.get("arguments"))
            .or_else(|| raw.get("arguments"))
            .cloned()
            .unwrap_or(Value::Null);

        Self {
            id,
            function_name,
            arguments: arguments_to_map(arguments),
        }
    }
}

/// Arguments arrive as an object or as a JSON-encoded string of one.
fn arguments_to_map(arguments: Value) -> Map<String, Value> {
    match arguments {
        Value::Object(map) => map,
        Value::String(encoded) => match serde_json::from_str::<Value>(&encoded) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}

/// Result returned to the platform for one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub result: Value,
}

/// A fragment of the live transcript. Dropped from its event when `text` is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptFragment {
    #[serde(default = "default_role")]
    pub role: String,

    #[serde(alias = "transcript")]
    pub text: String,

    #[serde(default, deserialize_with = "lenient")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Platform-assigned position of the fragment within its call.
    #[serde(default, deserialize_with = "lenient")]
    pub sequence: Option<u64>,

    #[serde(default, deserialize_with = "lenient")]
    pub is_final: Option<bool>,
}

fn default_role() -> String {
    "unknown".to_string()
}
