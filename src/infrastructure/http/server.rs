use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::domain::models::ServerConfig;
use crate::services::WebhookRouter;

/// Milliseconds spent handling the event, set on every webhook reply.
pub const RESPONSE_TIME_HEADER: &str = "x-response-time-ms";

async fn handle_webhook(State(router): State<Arc<WebhookRouter>>, body: Bytes) -> Response {
    let reply = router.handle(&body).await;
    let elapsed = reply.latency.as_millis().to_string();

    let mut response = (reply.status, Json(reply.body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(RESPONSE_TIME_HEADER), value);
    }
    response
}

async fn handle_stats(State(router): State<Arc<WebhookRouter>>) -> impl IntoResponse {
    Json(router.stats())
}

/// Build the axum application around a shared router.
pub fn build_app(router: Arc<WebhookRouter>, config: &ServerConfig) -> Router {
    let webhook_route = format!("/{}", config.webhook_path.trim_matches('/'));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(&webhook_route, post(handle_webhook))
        .route("/stats", get(handle_stats))
        .with_state(router)
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Resolves when the process receives Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Serve until `shutdown` resolves, then give pending background writes
/// `drain_timeout` to finish.
pub async fn serve<F>(config: &ServerConfig, router: Arc<WebhookRouter>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_app(Arc::clone(&router), config);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(
        addr = %addr,
        webhook = %format!("/{}", config.webhook_path),
        backend = router.gateway().backend_name(),
        "Webhook server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    let pending = router.background().stats().pending;
    if router.background().wait_idle(config.drain_timeout()).await {
        info!(drained = pending, "Background writes drained");
    } else {
        warn!(
            pending = router.background().stats().pending,
            timeout_secs = config.drain_timeout_secs,
            "Shutdown timed out with background writes still pending"
        );
    }

    Ok(())
}
