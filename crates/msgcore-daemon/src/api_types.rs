//! Request and response types for every `msgcore-daemon` HTTP endpoint.
//!
//! These are `Serialize + Deserialize` so Axum can encode/decode them and
//! scenario tests can assert against them directly. No business logic
//! lives here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

/// `GET /v1/status` body: a point-in-time snapshot of daemon readiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub daemon_uptime_secs: u64,
    pub tenant: String,
    pub schema_deployment_complete: bool,
}

/// `POST /v1/webhooks/{provider}` body: the raw ingestion outcome,
/// reported verbatim rather than collapsed into an HTTP status code so
/// callers can distinguish "duplicate, already handled" from "accepted
/// for the first time" without re-parsing the response code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookIngestResponse {
    Accepted { duplicate: bool },
    Ignored,
    Rejected,
    UnknownProvider,
    Unauthenticated,
}

impl From<msgcore_webhook::IngestOutcome> for WebhookIngestResponse {
    fn from(outcome: msgcore_webhook::IngestOutcome) -> Self {
        match outcome {
            msgcore_webhook::IngestOutcome::Accepted { duplicate } => Self::Accepted { duplicate },
            msgcore_webhook::IngestOutcome::Ignored => Self::Ignored,
            msgcore_webhook::IngestOutcome::Rejected => Self::Rejected,
            msgcore_webhook::IngestOutcome::UnknownProvider => Self::UnknownProvider,
            msgcore_webhook::IngestOutcome::Unauthenticated => Self::Unauthenticated,
        }
    }
}
