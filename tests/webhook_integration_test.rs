//! End-to-end webhook tests through the axum application.

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use callhook::infrastructure::http::RESPONSE_TIME_HEADER;
use common::{body_json, memory_app, post_json, DRAIN};
use serde_json::json;
use tower::ServiceExt;

#[tokio::test]
async fn test_quote_tool_call_round_trip() {
    let (test, store) = memory_app();
    let payload = json!({
        "type": "tool-calls",
        "call": {"id": "call-1"},
        "toolCalls": [{
            "id": "abc",
            "function": {"name": "getQuote", "arguments": "{\"serviceType\":\"inspection\"}"}
        }]
    });

    let response = test.app.clone().oneshot(post_json("/webhook", &payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(RESPONSE_TIME_HEADER));
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");

    let body = body_json(response).await;
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["toolCallId"], "abc");
    assert_eq!(results[0]["result"]["price"], "295$");

    assert!(test.router.background().wait_idle(DRAIN).await);
    let log = store.row("tool_calls", "abc").expect("tool call logged");
    assert_eq!(log["call_id"], "call-1");
    assert_eq!(log["function_name"], "getQuote");
}

#[tokio::test]
async fn test_repeated_quote_hits_cache() {
    let (test, _) = memory_app();
    let payload = json!({
        "type": "tool-calls",
        "toolCalls": [{"id": "q", "function": {"name": "getQuote", "arguments": {"serviceType": "inspection"}}}]
    });

    for _ in 0..3 {
        let response = test.app.clone().oneshot(post_json("/webhook", &payload)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let stats = test.router.cache().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2);
}

#[tokio::test]
async fn test_call_lifecycle_persists_records() {
    let (test, store) = memory_app();

    let started = json!({"type": "call-started", "call": {"id": "c1", "phoneNumber": "+15145550100"}});
    let response = test.app.clone().oneshot(post_json("/webhook", &started)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["callId"], "c1");

    for (sequence, text) in [(1, "bonjour"), (2, "j'ai un dégât d'eau")] {
        let fragment = json!({
            "type": "transcript",
            "call": {"id": "c1"},
            "transcript": {"role": "user", "text": text, "sequence": sequence}
        });
        let response = test.app.clone().oneshot(post_json("/webhook", &fragment)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let ended = json!({"type": "call-ended", "call": {"id": "c1", "durationSeconds": 65.5, "endReason": "hangup"}});
    let response = test.app.clone().oneshot(post_json("/webhook", &ended)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(test.router.background().wait_idle(DRAIN).await);

    let call = store.row("calls", "c1").unwrap();
    assert_eq!(call["status"], "completed");
    assert_eq!(call["end_reason"], "hangup");
    assert_eq!(store.rows("transcripts").len(), 2);
    assert_eq!(store.rows("leads").len(), 1);
}

#[tokio::test]
async fn test_error_statuses() {
    let (test, _) = memory_app();

    let missing_calls = json!({"type": "tool-calls"});
    let response = test.app.clone().oneshot(post_json("/webhook", &missing_calls)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].is_string());
    assert!(body.get("latency").is_none());

    let request = Request::post("/webhook").body(Body::from("not json")).unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().contains_key(RESPONSE_TIME_HEADER));
    let body = body_json(response).await;
    assert!(body["latency"].as_str().unwrap().ends_with("ms"));
}

#[tokio::test]
async fn test_cors_preflight() {
    let (test, _) = memory_app();
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/webhook")
        .header(header::ORIGIN, "https://dashboard.example")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();

    let response = test.app.oneshot(request).await.unwrap();
    assert!(response.status().is_success());
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

#[tokio::test]
async fn test_stats_reflect_traffic() {
    let (test, _) = memory_app();
    let health = json!({"type": "health-check"});
    let response = test.app.clone().oneshot(post_json("/webhook", &health)).await.unwrap();
    assert_eq!(body_json(response).await["status"], "ok");

    let response = test
        .app
        .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["backend"], "memory");
    assert!(stats["cache"].is_object());
    assert!(stats["background"].is_object());
}
