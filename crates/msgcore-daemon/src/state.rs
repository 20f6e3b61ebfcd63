//! Shared runtime state for `msgcore-daemon`.
//!
//! `AppState` wires every primitive's store to one of two backends chosen
//! at startup (`spec.md` §1: "the one in-memory reference implementation
//! used for testing" and "the two concrete storage backends... their DDL
//! and dialect are external"). Handlers receive `State<Arc<AppState>>`.

use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;
use msgcore_config::{IdempotencyConfig, InboxConfig, LeaseConfig, OutboxConfig, SchedulerConfig, WebhookConfig};
use msgcore_discovery::SchemaDeploymentSignal;
use msgcore_lease::{LeaseManager, LeaseManagerConfig};
use msgcore_store::{IdempotencyStore, InboxStore, LeaseStore, OutboxStore, SchedulerStore, TransactionalOutboxIdempotency};
use msgcore_webhook::WebhookIngestor;

/// Static build metadata surfaced in `/v1/health`.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Which concrete store backend this process wired up. `Memory` is the
/// dev/test default (`MSGCORE_BACKEND` unset or `memory`); `Postgres`
/// requires `MSGCORE_DATABASE_URL` (`MSGCORE_BACKEND=postgres`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Postgres,
}

/// Cloneable (Arc) handle shared across every Axum handler and background
/// dispatcher loop.
pub struct AppState {
    pub build: BuildInfo,
    pub backend: Backend,
    pub tenant: String,

    pub outbox: Arc<dyn OutboxStore>,
    pub inbox: Arc<dyn InboxStore>,
    pub scheduler: Arc<dyn SchedulerStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub lease_store: Arc<dyn LeaseStore>,
    pub tx: Arc<dyn TransactionalOutboxIdempotency>,

    /// `Some` only when `backend == Backend::Postgres`; held so `main` can
    /// build a schema deployer over the same pool the stores above use.
    pub pg_pool: Option<sqlx::PgPool>,

    pub lease_manager: Arc<LeaseManager>,
    pub webhook: Arc<WebhookIngestor>,
    pub schema_signal: SchemaDeploymentSignal,
    pub metrics_handle: PrometheusHandle,

    pub outbox_config: OutboxConfig,
    pub inbox_config: InboxConfig,
    pub scheduler_config: SchedulerConfig,
    pub lease_config: LeaseConfig,
    pub idempotency_config: IdempotencyConfig,
    pub webhook_config: WebhookConfig,
}

impl AppState {
    /// Builds every store behind `Backend::Memory`: no external database,
    /// state lives for the lifetime of the process. Used for local
    /// development (`MSGCORE_BACKEND` unset) and for the scenario tests
    /// that exercise the composition root without a Postgres instance.
    pub fn new_in_memory(tenant: impl Into<String>) -> anyhow::Result<Self> {
        use msgcore_memstore::{
            CronCrateSchedule, MemIdempotencyStore, MemInboxStore, MemLeaseStore, MemOutboxStore, MemSchedulerStore,
            MemTransactionalStore,
        };

        let tenant = tenant.into();
        let outbox = Arc::new(MemOutboxStore::new());
        let idempotency = Arc::new(MemIdempotencyStore::new());
        let tx = Arc::new(MemTransactionalStore::new(outbox.clone(), idempotency.clone()));
        let lease_store: Arc<dyn LeaseStore> = Arc::new(MemLeaseStore::new());

        Self::assemble(
            tenant,
            Backend::Memory,
            outbox,
            Arc::new(MemInboxStore::new()),
            Arc::new(MemSchedulerStore::new(Arc::new(CronCrateSchedule))),
            idempotency,
            lease_store,
            tx,
            None,
        )
    }

    /// Connects to Postgres and builds every store against it. Schema
    /// deployment (`spec.md` §4.8) is driven separately from `main` via
    /// `msgcore_discovery::deploy_schema` against `pg_pool`, so that it
    /// runs as an observable, cancellable task rather than blocking
    /// construction (`spec.md` §9 "async void" redesign note).
    pub async fn new_postgres(tenant: impl Into<String>) -> anyhow::Result<Self> {
        use msgcore_postgres::{
            CronCrateSchedule, PgIdempotencyStore, PgInboxStore, PgLeaseStore, PgOutboxStore, PgSchedulerStore,
            PgTransactionalStore,
        };

        let tenant = tenant.into();
        let pool = msgcore_postgres::connect_from_env().await?;

        let outbox: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool.clone()));
        let idempotency: Arc<dyn IdempotencyStore> = Arc::new(PgIdempotencyStore::new(pool.clone()));
        let tx: Arc<dyn TransactionalOutboxIdempotency> = Arc::new(PgTransactionalStore::new(pool.clone()));
        let lease_store: Arc<dyn LeaseStore> = Arc::new(PgLeaseStore::new(pool.clone()));

        Self::assemble(
            tenant,
            Backend::Postgres,
            outbox,
            Arc::new(PgInboxStore::new(pool.clone())),
            Arc::new(PgSchedulerStore::new(pool.clone(), Arc::new(CronCrateSchedule))),
            idempotency,
            lease_store,
            tx,
            Some(pool),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        tenant: String,
        backend: Backend,
        outbox: Arc<dyn OutboxStore>,
        inbox: Arc<dyn InboxStore>,
        scheduler: Arc<dyn SchedulerStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        lease_store: Arc<dyn LeaseStore>,
        tx: Arc<dyn TransactionalOutboxIdempotency>,
        pg_pool: Option<sqlx::PgPool>,
    ) -> anyhow::Result<Self> {
        let lease_config = LeaseConfig::default().apply_env_overrides();
        let lease_manager = Arc::new(LeaseManager::new(
            lease_store.clone(),
            LeaseManagerConfig {
                renew_percent: lease_config.renew_percent,
                use_gate: lease_config.use_gate,
                gate_timeout: Duration::from_millis(lease_config.gate_timeout_ms),
                ..LeaseManagerConfig::default()
            },
        ));

        let webhook_config = WebhookConfig::default();
        let webhook = Arc::new(WebhookIngestor::new(inbox.clone(), webhook_config.clone()));

        let metrics_handle = install_or_reuse_metrics_handle()?;

        Ok(Self {
            build: BuildInfo {
                service: "msgcore-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            backend,
            tenant,
            outbox,
            inbox,
            scheduler,
            idempotency,
            lease_store,
            tx,
            pg_pool,
            lease_manager,
            webhook,
            schema_signal: SchemaDeploymentSignal::new(),
            metrics_handle,
            outbox_config: OutboxConfig::default().apply_env_overrides(),
            inbox_config: InboxConfig::default().apply_env_overrides(),
            scheduler_config: SchedulerConfig::default(),
            lease_config,
            idempotency_config: IdempotencyConfig::default(),
            webhook_config,
        })
    }
}

/// The process-wide Prometheus recorder can only be installed once
/// (`metrics`'s global recorder). Builds it on first call and reuses the
/// same handle for every `AppState` constructed afterwards — relevant
/// whenever a process builds more than one `AppState` in its lifetime,
/// such as this crate's own test binary.
fn install_or_reuse_metrics_handle() -> anyhow::Result<PrometheusHandle> {
    static HANDLE: std::sync::OnceLock<PrometheusHandle> = std::sync::OnceLock::new();
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = msgcore_metrics::install_prometheus_recorder()?;
    Ok(HANDLE.get_or_init(|| handle).clone())
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START.get_or_init(std::time::Instant::now).elapsed().as_secs()
}
