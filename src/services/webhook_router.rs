//! Top-level dispatcher for events posted by the voice platform.
//!
//! Tool calls and health checks are answered synchronously. Lifecycle events
//! are acknowledged at once and their durable writes are handed to the
//! [`BackgroundWriter`], so a slow store never shows up in response latency.
//! Call-started is the exception: its call and lead writes run in parallel
//! before the reply, and their failures are logged rather than returned.

use axum::http::StatusCode;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::errors::{StoreResult, WebhookError};
use crate::domain::models::{
    tables, CallClosure, CallRecord, CallStatus, Config, EventType, InboundEvent, LeadRecord, Row,
    SequenceSource, ToolCallLog, ToolCallRequest, ToolCallResult, TranscriptRecord,
};
use crate::domain::ports::BackendStore;
use crate::services::background::{panic_message, BackgroundStats, BackgroundWriter};
use crate::services::cache_service::{CacheStats, JsonCache};
use crate::services::persistence_gateway::PersistenceGateway;
use crate::services::query_metrics::MetricsSummary;
use crate::services::tool_responses::ToolResponseBuilder;

const LEAD_SOURCE: &str = "phone";

/// Status, JSON body and measured handling time of one webhook request.
#[derive(Debug, Clone)]
pub struct WebhookReply {
    pub status: StatusCode,
    pub body: Value,
    pub latency: Duration,
}

/// Diagnostics served on `GET /stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    pub uptime_seconds: u64,
    pub backend: &'static str,
    pub cache: CacheStats,
    pub queries: MetricsSummary,
    pub background: BackgroundStats,
}

pub struct WebhookRouter {
    tools: Arc<ToolResponseBuilder>,
    gateway: Arc<PersistenceGateway>,
    cache: Arc<JsonCache>,
    background: BackgroundWriter,
    started_at: Instant,
}

impl WebhookRouter {
    pub fn new(
        tools: Arc<ToolResponseBuilder>,
        gateway: Arc<PersistenceGateway>,
        cache: Arc<JsonCache>,
        background: BackgroundWriter,
    ) -> Self {
        Self {
            tools,
            gateway,
            cache,
            background,
            started_at: Instant::now(),
        }
    }

    /// Wire the tool builder, gateway and background writer around one shared cache.
    pub fn from_config(config: &Config, store: Arc<dyn BackendStore>, cache: Arc<JsonCache>) -> Self {
        let tools = ToolResponseBuilder::new(Arc::clone(&cache), config.pricing.clone(), &config.tools);
        let gateway = PersistenceGateway::new(store, Arc::clone(&cache), config.gateway.clone());
        Self::new(Arc::new(tools), Arc::new(gateway), cache, BackgroundWriter::new())
    }

    pub fn cache(&self) -> &Arc<JsonCache> {
        &self.cache
    }

    pub fn gateway(&self) -> &Arc<PersistenceGateway> {
        &self.gateway
    }

    pub fn background(&self) -> &BackgroundWriter {
        &self.background
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            backend: self.gateway.backend_name(),
            cache: self.cache.stats(),
            queries: self.gateway.metrics().summary(5),
            background: self.background.stats(),
        }
    }

    /// Handle one raw request body. Never fails: every outcome is a reply.
    pub async fn handle(&self, body: &[u8]) -> WebhookReply {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.dispatch(body)).catch_unwind().await;
        let latency = started.elapsed();

        let (status, body) = match outcome {
            Ok(Ok(body)) => (StatusCode::OK, body),
            Ok(Err(e)) if e.is_client_error() => {
                debug!(error = %e, "rejected webhook request");
                (StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }))
            }
            Ok(Err(e)) => {
                error!(error = %e, "webhook dispatch failed");
                (StatusCode::INTERNAL_SERVER_ERROR, failure_body(&e.to_string(), latency))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(error = %message, "webhook dispatch panicked");
                (StatusCode::INTERNAL_SERVER_ERROR, failure_body(&message, latency))
            }
        };

        WebhookReply { status, body, latency }
    }

    async fn dispatch(&self, body: &[u8]) -> Result<Value, WebhookError> {
        let started = Instant::now();
        let raw: Value = serde_json::from_slice(body)?;
        let kind = raw.get("type").and_then(Value::as_str).map(EventType::parse);

        if kind == Some(EventType::ToolCalls) {
            let has_calls = raw
                .get("toolCalls")
                .and_then(Value::as_array)
                .is_some_and(|calls| !calls.is_empty());
            if !has_calls {
                return Err(WebhookError::MalformedRequest(
                    "toolCalls must be a non-empty array".to_string(),
                ));
            }
        }

        let event: InboundEvent = serde_json::from_value(raw)?;
        debug!(event_type = %event.event_type, call_id = ?event.call_id(), "dispatching webhook event");

        let reply = match event.kind() {
            EventType::HealthCheck => self.health_check(),
            EventType::ToolCalls => self.tool_calls(&event).await,
            EventType::CallStarted => self.call_started(&event).await,
            EventType::Transcript => self.transcript(&event),
            EventType::CallEnded => self.call_ended(&event),
            EventType::Other(tag) => json!({
                "received": true,
                "type": tag,
                "latency": format_latency(started.elapsed()),
            }),
        };
        Ok(reply)
    }

    fn health_check(&self) -> Value {
        json!({
            "status": "ok",
            "uptimeSeconds": self.started_at.elapsed().as_secs(),
            "cacheSize": self.cache.len(),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    async fn tool_calls(&self, event: &InboundEvent) -> Value {
        let requests = event.tool_calls.as_deref().unwrap_or_default();
        let results = self.tools.build(requests).await;

        let logs = tool_call_rows(event.call_id(), requests, &results);
        let gateway = Arc::clone(&self.gateway);
        self.background.spawn("tool_call_log", async move {
            gateway.bulk_upsert(tables::TOOL_CALLS, logs?, "id").await?;
            Ok(())
        });

        json!({ "results": results })
    }

    async fn call_started(&self, event: &InboundEvent) -> Value {
        let call = event.call.clone().unwrap_or_default();
        let call_id = event
            .call_id()
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let now = Utc::now();
        let record = CallRecord {
            id: call_id.clone(),
            phone_number: call.phone().map(str::to_string),
            started_at: call.started_at.unwrap_or(now),
            status: CallStatus::InProgress,
        };

        let call_write = async {
            let row = record.to_row()?;
            let on_conflict = record.start_patch()?;
            self.gateway.insert_or_update(tables::CALLS, row, on_conflict).await
        };
        let lead_write = async {
            let Some(phone) = call.phone() else {
                return Ok(());
            };
            let lead = LeadRecord {
                id: Uuid::new_v4().to_string(),
                phone_number: phone.to_string(),
                source: LEAD_SOURCE.to_string(),
                last_call_id: call_id.clone(),
                last_contact_at: now,
            };
            self.gateway
                .bulk_upsert(tables::LEADS, vec![lead.to_row()?], "phone_number")
                .await
                .map(|_| ())
        };

        let (call_result, lead_result) = tokio::join!(call_write, lead_write);
        if let Err(e) = call_result {
            warn!(call_id = %call_id, error = %e, "failed to record call start");
        }
        if let Err(e) = lead_result {
            warn!(call_id = %call_id, error = %e, "failed to upsert lead");
        }

        json!({ "received": true, "callId": call_id })
    }

    fn transcript(&self, event: &InboundEvent) -> Value {
        if let Some(fragment) = &event.transcript {
            let received_at = Utc::now();
            let (sequence, sequence_source) = match fragment.sequence {
                Some(sequence) => (sequence, SequenceSource::Platform),
                None => (
                    u64::try_from(received_at.timestamp_micros()).unwrap_or_default(),
                    SequenceSource::Received,
                ),
            };
            let record = TranscriptRecord {
                id: Uuid::new_v4().to_string(),
                call_id: event.call_id().map(str::to_string),
                role: fragment.role.clone(),
                text: fragment.text.clone(),
                sequence,
                sequence_source,
                is_final: fragment.is_final.unwrap_or(true),
                spoken_at: fragment.timestamp.unwrap_or(received_at),
            };

            let gateway = Arc::clone(&self.gateway);
            self.background.spawn("transcript", async move {
                gateway.insert(tables::TRANSCRIPTS, record.to_row()?).await
            });
        }

        json!({ "received": true })
    }

    fn call_ended(&self, event: &InboundEvent) -> Value {
        if let (Some(call_id), Some(call)) = (event.call_id(), &event.call) {
            let closure = CallClosure {
                id: call_id.to_string(),
                status: CallStatus::Completed,
                ended_at: call.ended_at.unwrap_or_else(Utc::now),
                duration_seconds: call.duration_seconds,
                end_reason: call.end_reason.clone(),
            };

            let gateway = Arc::clone(&self.gateway);
            self.background.spawn("call_ended", async move {
                gateway.bulk_upsert(tables::CALLS, vec![closure.to_row()?], "id").await?;
                Ok(())
            });
        }

        json!({ "received": true })
    }
}

/// One `tool_calls` row per request, keyed by the platform's tool call id.
fn tool_call_rows(
    call_id: Option<&str>,
    requests: &[ToolCallRequest],
    results: &[ToolCallResult],
) -> StoreResult<Vec<Row>> {
    let created_at = Utc::now();
    requests
        .iter()
        .zip(results)
        .map(|(request, result)| {
            let id = if request.id.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                request.id.clone()
            };
            ToolCallLog {
                id,
                call_id: call_id.map(str::to_string),
                function_name: request.function_name.clone(),
                arguments: Value::Object(request.arguments.clone()),
                result: result.result.clone(),
                created_at,
            }
            .to_row()
        })
        .collect()
}

fn format_latency(latency: Duration) -> String {
    format!("{}ms", latency.as_millis())
}

fn failure_body(message: &str, latency: Duration) -> Value {
    json!({ "error": message, "latency": format_latency(latency) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryStore, StoreOp};
    use crate::domain::errors::StoreError;
    use crate::domain::models::{AggregateSpec, SelectQuery};
    use async_trait::async_trait;

    const DRAIN: Duration = Duration::from_secs(5);

    fn router_with(store: Arc<dyn BackendStore>) -> WebhookRouter {
        let config = Config::default();
        let cache = Arc::new(JsonCache::from_config(&config.cache));
        WebhookRouter::from_config(&config, store, cache)
    }

    fn router() -> (WebhookRouter, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (router_with(store.clone()), store)
    }

    async fn post(router: &WebhookRouter, body: Value) -> WebhookReply {
        router.handle(body.to_string().as_bytes()).await
    }

    #[tokio::test]
    async fn test_health_check() {
        let (router, store) = router();
        let reply = post(&router, json!({"type": "health-check"})).await;

        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["status"], "ok");
        assert!(reply.body["uptimeSeconds"].is_u64());
        assert_eq!(reply.body["cacheSize"], 0);
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_tool_calls_require_non_empty_list() {
        let (router, _) = router();
        for body in [
            json!({"type": "tool-calls"}),
            json!({"type": "tool-calls", "toolCalls": []}),
            json!({"type": "tool-calls", "toolCalls": "nope"}),
        ] {
            let reply = post(&router, body).await;
            assert_eq!(reply.status, StatusCode::BAD_REQUEST);
            assert!(reply.body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_tool_calls_answer_then_write_behind() {
        let (router, store) = router();
        let reply = post(
            &router,
            json!({
                "type": "tool-calls",
                "call": {"id": "call-1"},
                "toolCalls": [{"id": "abc", "function": {"name": "getQuote", "arguments": "{\"serviceType\":\"inspection\"}"}}]
            }),
        )
        .await;

        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["results"][0]["toolCallId"], "abc");
        assert_eq!(reply.body["results"][0]["result"]["price"], "295$");

        assert!(router.background().wait_idle(DRAIN).await);
        let log = store.row("tool_calls", "abc").unwrap();
        assert_eq!(log["call_id"], "call-1");
        assert_eq!(log["function_name"], "getQuote");
        assert_eq!(log["result"]["price"], "295$");
    }

    #[tokio::test]
    async fn test_nameless_tool_call_gets_fallback_alongside_valid_one() {
        let (router, store) = router();
        let reply = post(
            &router,
            json!({
                "type": "tool-calls",
                "toolCalls": [
                    {"id": "good", "function": {"name": "getQuote", "arguments": {"serviceType": "inspection"}}},
                    {"id": "bad", "function": {"arguments": {}}}
                ]
            }),
        )
        .await;

        assert_eq!(reply.status, StatusCode::OK);
        let results = reply.body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["toolCallId"], "good");
        assert_eq!(results[0]["result"]["price"], "295$");
        assert_eq!(results[1]["toolCallId"], "bad");
        assert_eq!(results[1]["result"]["handled"], false);

        assert!(router.background().wait_idle(DRAIN).await);
        assert_eq!(store.row("tool_calls", "bad").unwrap()["function_name"], "");
    }

    #[tokio::test]
    async fn test_mistyped_call_field_does_not_fail_tool_calls() {
        let (router, store) = router();
        let reply = post(
            &router,
            json!({
                "type": "tool-calls",
                "call": {"id": "c1", "startedAt": "yesterday"},
                "toolCalls": [{"id": "t1", "function": {"name": "getQuote", "arguments": {"serviceType": "inspection"}}}]
            }),
        )
        .await;

        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["results"][0]["toolCallId"], "t1");
        assert!(router.background().wait_idle(DRAIN).await);
        assert_eq!(store.row("tool_calls", "t1").unwrap()["call_id"], "c1");
    }

    #[tokio::test]
    async fn test_call_started_without_phone_skips_leads() {
        let (router, store) = router();
        let reply = post(&router, json!({"type": "call-started", "call": {}})).await;

        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["received"], true);
        let call_id = reply.body["callId"].as_str().unwrap();
        assert!(!call_id.is_empty());
        assert!(store.row("calls", call_id).is_some());
        assert!(store.ops_for("leads").is_empty());
    }

    #[tokio::test]
    async fn test_call_started_with_phone_upserts_lead() {
        let (router, store) = router();
        for call_id in ["c1", "c2"] {
            post(
                &router,
                json!({"type": "call-started", "call": {"id": call_id, "phoneNumber": " +15145550100 "}}),
            )
            .await;
        }

        let leads = store.rows("leads");
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0]["phone_number"], "+15145550100");
        assert_eq!(leads[0]["last_call_id"], "c2");
        assert_eq!(store.row("calls", "c1").unwrap()["status"], "in-progress");
    }

    #[tokio::test]
    async fn test_call_started_reports_id_when_store_fails() {
        let (router, store) = router();
        store.fail_writes_to("calls");
        store.fail_writes_to("leads");

        let reply = post(
            &router,
            json!({"type": "call-started", "call": {"id": "c9", "phoneNumber": "5145550100"}}),
        )
        .await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["callId"], "c9");
    }

    #[tokio::test]
    async fn test_late_call_started_keeps_completed_status() {
        let (router, store) = router();
        post(&router, json!({"type": "call-ended", "call": {"id": "c1", "durationSeconds": 42.0}})).await;
        assert!(router.background().wait_idle(DRAIN).await);

        post(&router, json!({"type": "call-started", "call": {"id": "c1", "phoneNumber": "5145550100"}})).await;

        let call = store.row("calls", "c1").unwrap();
        assert_eq!(call["status"], "completed");
        assert_eq!(call["duration_seconds"], 42.0);
        assert_eq!(call["phone_number"], "5145550100");
        assert!(call.contains_key("started_at"));
    }

    #[tokio::test]
    async fn test_call_ended_merges_closure() {
        let (router, store) = router();
        post(&router, json!({"type": "call-started", "call": {"id": "c1"}})).await;
        let reply = post(
            &router,
            json!({"type": "call-ended", "call": {"id": "c1", "endReason": "customer-ended-call"}}),
        )
        .await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(router.background().wait_idle(DRAIN).await);

        let call = store.row("calls", "c1").unwrap();
        assert_eq!(call["status"], "completed");
        assert_eq!(call["end_reason"], "customer-ended-call");
        assert!(call.contains_key("ended_at"));
    }

    #[tokio::test]
    async fn test_call_ended_without_id_writes_nothing() {
        let (router, store) = router();
        let reply = post(&router, json!({"type": "call-ended"})).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(router.background().wait_idle(DRAIN).await);
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_transcript_sequence() {
        let (router, store) = router();
        post(
            &router,
            json!({"type": "transcript", "call": {"id": "c1"}, "transcript": {"role": "user", "text": "allo", "sequence": 7}}),
        )
        .await;
        post(
            &router,
            json!({"type": "transcript", "call": {"id": "c1"}, "transcript": {"transcript": "bonjour"}}),
        )
        .await;
        assert!(router.background().wait_idle(DRAIN).await);

        let rows = store.rows("transcripts");
        assert_eq!(rows.len(), 2);
        let explicit = rows.iter().find(|r| r["text"] == "allo").unwrap();
        assert_eq!(explicit["sequence"], 7);
        assert_eq!(explicit["sequence_source"], "platform");
        let derived = rows.iter().find(|r| r["text"] == "bonjour").unwrap();
        assert!(derived["sequence"].as_u64().unwrap() > 1_000_000_000_000);
        assert_eq!(derived["sequence_source"], "received");
        assert_eq!(derived["role"], "unknown");
    }

    #[tokio::test]
    async fn test_transcript_without_text_is_acknowledged_without_write() {
        let (router, store) = router();
        let reply = post(
            &router,
            json!({"type": "transcript", "call": {"id": "c1"}, "transcript": {"role": "user"}}),
        )
        .await;

        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["received"], true);
        assert!(router.background().wait_idle(DRAIN).await);
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_transcript_without_fragment_is_acknowledged() {
        let (router, store) = router();
        let reply = post(&router, json!({"type": "transcript"})).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_background_failures_stay_invisible() {
        let (router, store) = router();
        store.fail_writes_to("transcripts");
        let reply = post(
            &router,
            json!({"type": "transcript", "transcript": {"text": "allo"}}),
        )
        .await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(router.background().wait_idle(DRAIN).await);
        assert_eq!(router.background().stats().failed, 1);
    }

    #[tokio::test]
    async fn test_unknown_type_is_echoed() {
        let (router, _) = router();
        let reply = post(&router, json!({"type": "speech-update"})).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["received"], true);
        assert_eq!(reply.body["type"], "speech-update");
        assert!(reply.body["latency"].as_str().unwrap().ends_with("ms"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_500_with_message_only() {
        let (router, _) = router();
        for body in [&b"{not json"[..], &br#"{"call": {}}"#[..]] {
            let reply = router.handle(body).await;
            assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
            let fields: Vec<_> = reply.body.as_object().unwrap().keys().cloned().collect();
            assert_eq!(fields, vec!["error".to_string(), "latency".to_string()]);
        }
    }

    struct PanickingStore;

    #[async_trait]
    impl BackendStore for PanickingStore {
        async fn insert(&self, _table: &str, _rows: Vec<Row>) -> StoreResult<()> {
            panic!("store exploded");
        }
        async fn update(&self, _table: &str, _id: &str, _patch: Row) -> StoreResult<u64> {
            Ok(0)
        }
        async fn upsert(&self, _table: &str, _rows: Vec<Row>, _key: &str) -> StoreResult<u64> {
            Ok(0)
        }
        async fn select(&self, _table: &str, _query: &SelectQuery) -> StoreResult<Vec<Row>> {
            Ok(Vec::new())
        }
        async fn aggregate(&self, _table: &str, _spec: &AggregateSpec) -> StoreResult<Vec<Row>> {
            Err(StoreError::Unsupported("aggregate"))
        }
        fn backend_name(&self) -> &'static str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_500() {
        let router = router_with(Arc::new(PanickingStore));
        let reply = post(&router, json!({"type": "call-started", "call": {"id": "c1"}})).await;

        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(reply.body["error"], "store exploded");

        let health = post(&router, json!({"type": "health-check"})).await;
        assert_eq!(health.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_panicking_background_write_still_drains() {
        let router = router_with(Arc::new(PanickingStore));
        let reply = post(&router, json!({"type": "transcript", "transcript": {"text": "allo"}})).await;
        assert_eq!(reply.status, StatusCode::OK);

        assert!(router.background().wait_idle(DRAIN).await);
        let stats = router.background().stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_stats_reflect_activity() {
        let (router, store) = router();
        post(
            &router,
            json!({"type": "tool-calls", "toolCalls": [{"id": "1", "function": {"name": "getQuote", "arguments": {"serviceType": "urgence"}}}]}),
        )
        .await;
        assert!(router.background().wait_idle(DRAIN).await);

        let stats = router.stats();
        assert_eq!(stats.backend, "memory");
        assert_eq!(stats.cache.size, 1);
        assert_eq!(stats.background.completed, 1);
        assert!(store.ops_for("tool_calls").iter().any(|op| matches!(op, StoreOp::Upsert { .. })));
    }
}
