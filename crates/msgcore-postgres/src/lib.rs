//! Postgres-backed implementation of every store contract in
//! `msgcore-store` (`spec.md` §1: "the two concrete storage backends...
//! their DDL and dialect are external").

mod idempotency;
mod inbox;
mod lease;
mod outbox;
mod scheduler;
mod tx;

pub use idempotency::PgIdempotencyStore;
pub use inbox::PgInboxStore;
pub use lease::PgLeaseStore;
pub use outbox::PgOutboxStore;
pub use scheduler::{CronCrateSchedule, PgSchedulerStore};
pub use tx::PgTransactionalStore;

use anyhow::Context;
use msgcore_types::{OwnerToken, StoreError};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

pub const ENV_DB_URL: &str = "MSGCORE_DATABASE_URL";

/// Connect to Postgres using `MSGCORE_DATABASE_URL`.
pub async fn connect_from_env() -> anyhow::Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Run embedded SQLx migrations against `pool` (`spec.md` §4.8 schema
/// deployment). Idempotent: safe to call on every startup.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::SchemaDeploymentFailure {
            database: pool.connect_options().get_database().unwrap_or("?").to_string(),
            reason: e.to_string(),
        })
}

/// Test helper: connect via `MSGCORE_DATABASE_URL` and ensure migrations are
/// applied before a scenario test runs.
pub async fn testkit_db_pool() -> anyhow::Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(pool)
}

fn transient(err: sqlx::Error) -> StoreError {
    StoreError::transient(anyhow::Error::new(err))
}

fn owner_to_uuid(owner: OwnerToken) -> Uuid {
    owner.as_uuid()
}

fn uuid_to_owner(id: Uuid) -> OwnerToken {
    OwnerToken(*id.as_bytes())
}
