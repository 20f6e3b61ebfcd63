//! Emitted metrics for the messaging core (`spec.md` §6): stable tag keys
//! and the counters/histograms every dispatcher, lease, and webhook
//! component reports through. Storage/query of these metrics is out of
//! scope (`spec.md` §1); this crate only defines the emission surface.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Tag keys used across every emitted metric. Kept as constants so call
/// sites never typo a label name.
pub mod tags {
    pub const QUEUE: &str = "queue";
    pub const STORE: &str = "store";
    pub const PROVIDER: &str = "provider";
    pub const REASON: &str = "reason";
    pub const STATUS: &str = "status";
}

/// Installs the process-wide Prometheus recorder and returns a handle whose
/// `render()` produces the scrape body. Call once at daemon startup.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// One claim batch returned `count` rows for `(queue, store)`.
pub fn record_claimed(queue: &str, store: &str, count: u64) {
    counter!("msgcore_claimed", tags::QUEUE => queue.to_string(), tags::STORE => store.to_string())
        .increment(count);
}

pub fn record_acknowledged(queue: &str, store: &str) {
    counter!("msgcore_acknowledged", tags::QUEUE => queue.to_string(), tags::STORE => store.to_string())
        .increment(1);
}

pub fn record_abandoned(queue: &str, store: &str, reason: &str) {
    counter!(
        "msgcore_abandoned",
        tags::QUEUE => queue.to_string(),
        tags::STORE => store.to_string(),
        tags::REASON => reason.to_string()
    )
    .increment(1);
}

pub fn record_failed(queue: &str, store: &str, reason: &str) {
    counter!(
        "msgcore_failed",
        tags::QUEUE => queue.to_string(),
        tags::STORE => store.to_string(),
        tags::REASON => reason.to_string()
    )
    .increment(1);
}

pub fn record_revived(queue: &str, store: &str) {
    counter!("msgcore_revived", tags::QUEUE => queue.to_string(), tags::STORE => store.to_string())
        .increment(1);
}

pub fn record_reaped(queue: &str, store: &str, count: u64) {
    counter!("msgcore_reaped", tags::QUEUE => queue.to_string(), tags::STORE => store.to_string())
        .increment(count);
}

/// A webhook or inbox dedupe hit (`spec.md` §4.7 step 6).
pub fn record_duplicate(queue: &str, provider: &str) {
    counter!(
        "msgcore_duplicate",
        tags::QUEUE => queue.to_string(),
        tags::PROVIDER => provider.to_string()
    )
    .increment(1);
}

pub fn record_claim_duration_ms(queue: &str, store: &str, millis: f64) {
    histogram!("msgcore_claim_duration_ms", tags::QUEUE => queue.to_string(), tags::STORE => store.to_string())
        .record(millis);
}

pub fn record_ack_duration_ms(queue: &str, store: &str, millis: f64) {
    histogram!("msgcore_ack_duration_ms", tags::QUEUE => queue.to_string(), tags::STORE => store.to_string())
        .record(millis);
}

pub fn record_processing_duration_ms(queue: &str, store: &str, status: &str, millis: f64) {
    histogram!(
        "msgcore_processing_duration_ms",
        tags::QUEUE => queue.to_string(),
        tags::STORE => store.to_string(),
        tags::STATUS => status.to_string()
    )
    .record(millis);
}

pub fn record_lease_renew_duration_ms(resource: &str, millis: f64) {
    histogram!("msgcore_lease_renew_duration_ms", "resource" => resource.to_string()).record(millis);
}
