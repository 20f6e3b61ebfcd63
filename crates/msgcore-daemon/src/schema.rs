//! Schema deployment glue (`spec.md` §4.8): adapts `msgcore-postgres`'s
//! embedded-migration runner and the in-memory backend's "nothing to
//! deploy" case to the `msgcore-discovery` `DiscoverySource` /
//! `SchemaDeployer` traits, so both backends drive the same observable
//! `SchemaDeploymentSignal` through `deploy_schema`.

use async_trait::async_trait;
use msgcore_discovery::{DatabaseDescriptor, DiscoverySource, SchemaDeployer};
use msgcore_types::StoreError;
use tokio_util::sync::CancellationToken;

/// This daemon process owns exactly one database; multi-tenant discovery
/// of additional per-tenant databases is `DiscoveryRouter`'s job, wired in
/// separately by anything that needs it. The control-plane descriptor
/// passed to `deploy_schema` covers this process's own database.
pub struct NoAdditionalDatabases;

#[async_trait]
impl DiscoverySource for NoAdditionalDatabases {
    async fn discover_databases(&self) -> Result<Vec<DatabaseDescriptor>, StoreError> {
        Ok(Vec::new())
    }
}

pub struct PgMigrationDeployer {
    pub pool: sqlx::PgPool,
}

#[async_trait]
impl SchemaDeployer for PgMigrationDeployer {
    async fn deploy(&self, _descriptor: &DatabaseDescriptor, _cancel: CancellationToken) -> Result<(), StoreError> {
        msgcore_postgres::migrate(&self.pool).await
    }
}

/// Memory backend has no schema to deploy; `deploy_schema` still runs so
/// the signal transitions and any workers gating on it unblock.
pub struct NoopDeployer;

#[async_trait]
impl SchemaDeployer for NoopDeployer {
    async fn deploy(&self, _descriptor: &DatabaseDescriptor, _cancel: CancellationToken) -> Result<(), StoreError> {
        Ok(())
    }
}
