//! Per-primitive configuration records (`spec.md` §6). Each primitive's
//! options are a plain, serde-deserialisable struct with the spec's
//! defaults baked into `Default`; `dotenvy` loads a `.env.local` file for
//! local development the same way the daemon's entry point does, and
//! typed env vars layer on top of whatever was loaded from YAML.

use std::time::Duration;

use msgcore_types::MissingHandlerBehavior;
use serde::{Deserialize, Serialize};

/// Load `.env.local` into the process environment if present. Silent if
/// missing; production injects env vars directly.
pub fn load_dotenv() {
    let _ = dotenvy::from_filename(".env.local");
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|s| s.parse().ok())
}

/// `spec.md` §6 outbox config: `{ connectionString, schemaName="infra",
/// tableName="Outbox", enableSchemaDeployment, maxAttempts=5,
/// leaseSeconds=30, batchSize, baseBackoff, maxBackoff, cleanupInterval,
/// retentionPeriod }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub connection_string: String,
    pub schema_name: String,
    pub table_name: String,
    pub enable_schema_deployment: bool,
    pub max_attempts: u32,
    pub lease_seconds: i64,
    pub batch_size: i64,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub cleanup_interval: Duration,
    pub retention_period: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            schema_name: "infra".to_string(),
            table_name: "Outbox".to_string(),
            enable_schema_deployment: true,
            max_attempts: 5,
            lease_seconds: 30,
            batch_size: 50,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(3600),
            retention_period: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl OutboxConfig {
    /// Layer `MSGCORE_OUTBOX_*` env vars over whatever was loaded from YAML.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(v) = env_string("MSGCORE_OUTBOX_CONNECTION_STRING") {
            self.connection_string = v;
        }
        if let Some(v) = env_parse::<u32>("MSGCORE_OUTBOX_MAX_ATTEMPTS") {
            self.max_attempts = v;
        }
        if let Some(v) = env_parse::<i64>("MSGCORE_OUTBOX_LEASE_SECONDS") {
            self.lease_seconds = v;
        }
        if let Some(v) = env_parse::<i64>("MSGCORE_OUTBOX_BATCH_SIZE") {
            self.batch_size = v;
        }
        self
    }
}

/// `spec.md` §6 inbox config: same shape as outbox with `tableName="Inbox"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    pub connection_string: String,
    pub schema_name: String,
    pub table_name: String,
    pub enable_schema_deployment: bool,
    pub max_attempts: u32,
    pub lease_seconds: i64,
    pub batch_size: i64,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub cleanup_interval: Duration,
    pub retention_period: Duration,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            schema_name: "infra".to_string(),
            table_name: "Inbox".to_string(),
            enable_schema_deployment: true,
            max_attempts: 5,
            lease_seconds: 30,
            batch_size: 50,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(3600),
            retention_period: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl InboxConfig {
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(v) = env_string("MSGCORE_INBOX_CONNECTION_STRING") {
            self.connection_string = v;
        }
        if let Some(v) = env_parse::<u32>("MSGCORE_INBOX_MAX_ATTEMPTS") {
            self.max_attempts = v;
        }
        if let Some(v) = env_parse::<i64>("MSGCORE_INBOX_LEASE_SECONDS") {
            self.lease_seconds = v;
        }
        if let Some(v) = env_parse::<i64>("MSGCORE_INBOX_BATCH_SIZE") {
            self.batch_size = v;
        }
        self
    }
}

/// `spec.md` §6 scheduler config: `{ schemaName, jobsTable, jobRunsTable,
/// timersTable, enableSchedulerWorkers }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub schema_name: String,
    pub jobs_table: String,
    pub job_runs_table: String,
    pub timers_table: String,
    pub enable_scheduler_workers: bool,
    pub materialise_poll_interval: Duration,
    pub dispatch_lease_seconds: i64,
    pub dispatch_batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schema_name: "infra".to_string(),
            jobs_table: "scheduler_jobs".to_string(),
            job_runs_table: "scheduler_job_runs".to_string(),
            timers_table: "scheduler_timers".to_string(),
            enable_scheduler_workers: true,
            materialise_poll_interval: Duration::from_secs(5),
            dispatch_lease_seconds: 30,
            dispatch_batch_size: 50,
        }
    }
}

/// `spec.md` §6 lease config: `{ schemaName, defaultLeaseDuration=30s,
/// renewPercent=0.6, useGate=false, gateTimeoutMs=200,
/// enableSchemaDeployment }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub schema_name: String,
    pub default_lease_duration: Duration,
    pub renew_percent: f64,
    pub use_gate: bool,
    pub gate_timeout_ms: u64,
    pub enable_schema_deployment: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            schema_name: "infra".to_string(),
            default_lease_duration: Duration::from_secs(30),
            renew_percent: 0.6,
            use_gate: false,
            gate_timeout_ms: 200,
            enable_schema_deployment: true,
        }
    }
}

impl LeaseConfig {
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<f64>("MSGCORE_LEASE_RENEW_PERCENT") {
            self.renew_percent = v;
        }
        if let Some(v) = env_parse::<bool>("MSGCORE_LEASE_USE_GATE") {
            self.use_gate = v;
        }
        self
    }
}

/// `spec.md` §6 idempotency config: `{ schemaName, tableName, lockDuration,
/// lockDurationProvider, enableSchemaDeployment }`. `lock_duration_provider`
/// is modelled as an optional override hook rather than a serialisable
/// field since it is, by construction, a function of the caller's own
/// per-key policy — see `LockDurationProvider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub schema_name: String,
    pub table_name: String,
    pub lock_duration: Duration,
    pub enable_schema_deployment: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            schema_name: "infra".to_string(),
            table_name: "idempotency_keys".to_string(),
            lock_duration: Duration::from_secs(60),
            enable_schema_deployment: true,
        }
    }
}

/// Per-key override of `IdempotencyConfig::lock_duration`. `None` from the
/// provider means "use the configured default"; `spec.md` §5 permits an
/// explicit infinite TTL, modelled here as `Some(Duration::MAX)`.
pub trait LockDurationProvider: Send + Sync {
    fn lock_duration_for(&self, key: &str) -> Option<Duration>;
}

/// `spec.md` §6 webhook config: `{ storeRejected, redactRejectedBody,
/// missingHandlerBehavior, batchSize, leaseSeconds, maxAttempts,
/// baseBackoff, maxBackoff }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub store_rejected: bool,
    pub redact_rejected_body: bool,
    pub missing_handler_behavior: MissingHandlerBehavior,
    pub batch_size: i64,
    pub lease_seconds: i64,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            store_rejected: true,
            redact_rejected_body: true,
            missing_handler_behavior: MissingHandlerBehavior::Retry,
            batch_size: 50,
            lease_seconds: 30,
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Load + merge YAML config layers in order (later files override earlier
/// ones).
pub fn load_layered_yaml<T: for<'de> Deserialize<'de> + Default + Serialize>(
    paths: &[&str],
) -> anyhow::Result<T> {
    let mut merged = serde_json::to_value(T::default())?;
    for path in paths {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {path}: {e}"))?;
        let yaml_val: serde_yaml::Value = serde_yaml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parse yaml {path}: {e}"))?;
        let json_val = serde_json::to_value(yaml_val)?;
        deep_merge(&mut merged, json_val);
    }
    Ok(serde_json::from_value(merged)?)
}

fn deep_merge(dst: &mut serde_json::Value, src: serde_json::Value) {
    match (dst, src) {
        (serde_json::Value::Object(dst_map), serde_json::Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_defaults_match_spec() {
        let cfg = OutboxConfig::default();
        assert_eq!(cfg.schema_name, "infra");
        assert_eq!(cfg.table_name, "Outbox");
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.lease_seconds, 30);
    }

    #[test]
    fn lease_defaults_match_spec() {
        let cfg = LeaseConfig::default();
        assert_eq!(cfg.default_lease_duration, Duration::from_secs(30));
        assert_eq!(cfg.renew_percent, 0.6);
        assert!(!cfg.use_gate);
        assert_eq!(cfg.gate_timeout_ms, 200);
    }

    #[test]
    fn env_override_replaces_default() {
        std::env::set_var("MSGCORE_OUTBOX_MAX_ATTEMPTS", "9");
        let cfg = OutboxConfig::default().apply_env_overrides();
        assert_eq!(cfg.max_attempts, 9);
        std::env::remove_var("MSGCORE_OUTBOX_MAX_ATTEMPTS");
    }
}
