//! Scenario: the daemon's HTTP surface answers health/status/metrics and
//! routes a webhook delivery through the in-memory backend end to end.
//! Pure in-process; no network or database required.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use msgcore_daemon::{routes, state::AppState};
use tower::ServiceExt;

async fn call(router: axum::Router, req: Request<Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp.into_body().collect().await.expect("body collect failed").to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

#[tokio::test]
async fn health_reports_service_and_version() {
    let st = Arc::new(AppState::new_in_memory("default").unwrap());

    let req = Request::builder().method("GET").uri("/v1/health").body(Body::empty()).unwrap();
    let (status, body) = call(routes::build_router(st), req).await;

    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "msgcore-daemon");
}

#[tokio::test]
async fn status_reports_schema_deployment_incomplete_before_it_runs() {
    let st = Arc::new(AppState::new_in_memory("acme").unwrap());

    let req = Request::builder().method("GET").uri("/v1/status").body(Body::empty()).unwrap();
    let (status, body) = call(routes::build_router(st), req).await;

    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["tenant"], "acme");
    assert_eq!(json["schema_deployment_complete"], false);
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text_exposition() {
    let st = Arc::new(AppState::new_in_memory("default").unwrap());
    msgcore_metrics::record_claimed("outbox", "default", 1);

    let req = Request::builder().method("GET").uri("/v1/metrics").body(Body::empty()).unwrap();
    let (status, body) = call(routes::build_router(st), req).await;

    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("msgcore_claimed"));
}

#[tokio::test]
async fn webhook_to_unknown_provider_is_rejected_with_404() {
    let st = Arc::new(AppState::new_in_memory("default").unwrap());

    let req = Request::builder()
        .method("POST")
        .uri("/v1/webhooks/stripe")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, body) = call(routes::build_router(st), req).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse_json(body)["outcome"], "unknown_provider");
}
