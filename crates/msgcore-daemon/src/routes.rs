//! Axum router and all HTTP handlers for `msgcore-daemon`.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. All handlers are `pub(crate)` so a
//! scenario test can compose the router directly.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;

use crate::{
    api_types::{HealthResponse, StatusResponse, WebhookIngestResponse},
    state::{uptime_secs, AppState},
};

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/metrics", get(metrics_handler))
        .route("/v1/webhooks/:provider", post(webhook_ingest))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(StatusResponse {
            daemon_uptime_secs: uptime_secs(),
            tenant: st.tenant.clone(),
            schema_deployment_complete: st.schema_signal.is_complete(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/metrics
// ---------------------------------------------------------------------------

/// Prometheus scrape endpoint. Renders whatever the process-wide recorder
/// installed at startup (`msgcore_metrics::install_prometheus_recorder`)
/// has accumulated; `spec.md` §1 excludes metrics storage/query, not the
/// scrape surface itself.
pub(crate) async fn metrics_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, st.metrics_handle.render())
}

// ---------------------------------------------------------------------------
// POST /v1/webhooks/{provider}
// ---------------------------------------------------------------------------

/// Ingests one webhook delivery (`spec.md` §4.7). Headers are forwarded as
/// a JSON object so a provider's `WebhookAuthenticator`/`WebhookClassifier`
/// can inspect signature headers without this route knowing their names.
pub(crate) async fn webhook_ingest(
    State(st): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let headers_json = headers_to_json(&headers);
    let envelope = msgcore_webhook::RawEnvelope {
        headers: headers_json,
        body: body.to_vec(),
    };

    let outcome = st.webhook.ingest(&provider, envelope, CancellationToken::new()).await;
    let response: WebhookIngestResponse = outcome.clone().into();
    let status = match outcome {
        msgcore_webhook::IngestOutcome::Accepted { .. } | msgcore_webhook::IngestOutcome::Ignored => StatusCode::OK,
        msgcore_webhook::IngestOutcome::Rejected => StatusCode::UNPROCESSABLE_ENTITY,
        msgcore_webhook::IngestOutcome::UnknownProvider => StatusCode::NOT_FOUND,
        msgcore_webhook::IngestOutcome::Unauthenticated => StatusCode::UNAUTHORIZED,
    };
    (status, Json(response)).into_response()
}

fn headers_to_json(headers: &HeaderMap) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            map.insert(name.as_str().to_string(), serde_json::Value::String(v.to_string()));
        }
    }
    serde_json::Value::Object(map)
}
