//! msgcore-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, builds the shared
//! state, runs schema deployment, starts the background dispatcher loops,
//! and serves the HTTP API. All route handlers live in `routes.rs`; all
//! shared state lives in `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use msgcore_daemon::{routes, schema, state, workers};
use msgcore_discovery::{deploy_schema, DatabaseDescriptor};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file
    // does not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let tenant = std::env::var("MSGCORE_TENANT").unwrap_or_else(|_| "default".to_string());
    let backend = std::env::var("MSGCORE_BACKEND").unwrap_or_else(|_| "memory".to_string());

    let shared = Arc::new(match backend.as_str() {
        "postgres" => state::AppState::new_postgres(tenant).await.context("failed to wire Postgres backend")?,
        "memory" => state::AppState::new_in_memory(tenant).context("failed to wire in-memory backend")?,
        other => anyhow::bail!("unknown MSGCORE_BACKEND {other:?}, expected \"memory\" or \"postgres\""),
    });

    let shutdown = CancellationToken::new();

    spawn_schema_deployment(shared.clone(), shutdown.clone());
    workers::spawn_workers(shared.clone(), shutdown.clone());

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!(backend = ?shared.backend, "msgcore-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown_signal());
    let result = server.await.context("server crashed");
    shutdown.cancel();
    result
}

async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn spawn_schema_deployment(shared: Arc<state::AppState>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let result = match (shared.backend, shared.pg_pool.clone()) {
            (state::Backend::Postgres, Some(pool)) => {
                let control_plane = DatabaseDescriptor {
                    name: shared.tenant.clone(),
                    connection_string: String::new(),
                    schema: shared.outbox_config.schema_name.clone(),
                };
                deploy_schema(
                    Arc::new(schema::NoAdditionalDatabases),
                    Arc::new(schema::PgMigrationDeployer { pool }),
                    Some(control_plane),
                    shared.schema_signal.clone(),
                    shutdown,
                )
                .await
            }
            _ => {
                deploy_schema(
                    Arc::new(schema::NoAdditionalDatabases),
                    Arc::new(schema::NoopDeployer),
                    None,
                    shared.schema_signal.clone(),
                    shutdown,
                )
                .await
            }
        };

        if let Err(err) = result {
            tracing::error!(error = %err, "schema deployment failed");
        }
    });
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("MSGCORE_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
