//! HTTP surface and control-plane server.
//!
//! One axum router serves the health check, the Prometheus exposition, a
//! minimal embedded webchat page at `/`, and the WebSocket control plane
//! (request/response RPC plus server-pushed events).

pub mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{Html, IntoResponse},
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::gateway::Gateway;

/// Minimal embedded UI; real front-ends speak the WS protocol directly.
const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Agent Gateway</title></head>
<body>
<h1>Agent Gateway</h1>
<p>Control plane: connect a WebSocket to <code>/ws</code> with an
<code>x-api-key</code> header and send <code>req:*</code> frames.</p>
</body>
</html>
"#;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

/// Assemble the router for the configured paths.
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    let settings = gateway.settings().clone();
    let state = AppState { gateway };

    Router::new()
        .route("/", get(index))
        .route(&settings.health_path, get(health))
        .route(&settings.metrics_path, get(metrics))
        .route(&settings.ws_path, get(ws::ws_handler))
        // The control plane is localhost-first; front a reverse proxy with
        // TLS before loosening this.
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    gateway: Arc<Gateway>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), String> {
    let settings = gateway.settings();
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    tracing::info!(addr = %addr, ws_path = %settings.ws_path, "control plane listening");

    let app = build_router(gateway);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| format!("server error: {e}"))
}

async fn index() -> impl IntoResponse {
    Html(INDEX_HTML)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "service": "agent-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.gateway.metrics().render(),
    )
}
