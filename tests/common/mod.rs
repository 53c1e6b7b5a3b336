//! Shared helpers for integration tests.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use callhook::adapters::memory::InMemoryStore;
use callhook::adapters::sqlite::{create_migrated_test_pool, SqliteDocumentStore};
use callhook::infrastructure::http::build_app;
use callhook::{BackendStore, Config, JsonCache, WebhookRouter};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const DRAIN: Duration = Duration::from_secs(5);

pub struct TestApp {
    pub app: Router,
    pub router: Arc<WebhookRouter>,
}

pub fn app_with_store(store: Arc<dyn BackendStore>) -> TestApp {
    let config = Config::default();
    let cache = Arc::new(JsonCache::from_config(&config.cache));
    let router = Arc::new(WebhookRouter::from_config(&config, store, cache));
    TestApp {
        app: build_app(Arc::clone(&router), &config.server),
        router,
    }
}

pub fn memory_app() -> (TestApp, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    (app_with_store(store.clone()), store)
}

pub async fn sqlite_store() -> Arc<SqliteDocumentStore> {
    let pool = create_migrated_test_pool()
        .await
        .expect("failed to create test pool");
    Arc::new(SqliteDocumentStore::new(pool))
}

pub fn post_json(path: &str, body: &Value) -> Request<Body> {
    Request::post(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("valid request")
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("readable body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("JSON body")
}
