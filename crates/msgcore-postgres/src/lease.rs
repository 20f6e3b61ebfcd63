//! Postgres `LeaseStore`.

use async_trait::async_trait;
use msgcore_store::{LeaseGrant, LeaseRow, LeaseStore};
use msgcore_types::{FencingToken, OwnerToken, StoreError};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;

use crate::{owner_to_uuid, transient, uuid_to_owner};

pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn acquire(
        &self,
        resource_name: &str,
        owner: OwnerToken,
        lease_seconds: i64,
        context_json: Option<Value>,
        _cancel: CancellationToken,
    ) -> Result<Option<LeaseGrant>, StoreError> {
        let row: Option<(i64, chrono::DateTime<chrono::Utc>)> = sqlx::query_as(
            r#"
            insert into infra.leases (resource_name, owner_token, lease_until_utc, fencing_token, context_json)
            values ($1, $2, now() + make_interval(secs => $3), 1, $4)
            on conflict (resource_name) do update
                set owner_token = excluded.owner_token,
                    lease_until_utc = excluded.lease_until_utc,
                    fencing_token = infra.leases.fencing_token + 1,
                    context_json = coalesce(excluded.context_json, infra.leases.context_json)
             where infra.leases.owner_token is null
                or infra.leases.lease_until_utc <= now()
                or infra.leases.owner_token = excluded.owner_token
            returning fencing_token, lease_until_utc
            "#,
        )
        .bind(resource_name)
        .bind(owner_to_uuid(owner))
        .bind(lease_seconds.max(1) as f64)
        .bind(context_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        Ok(row.map(|(fencing_token, lease_until_utc)| LeaseGrant {
            fencing_token: FencingToken(fencing_token),
            lease_until_utc,
        }))
    }

    async fn renew(
        &self,
        resource_name: &str,
        owner: OwnerToken,
        lease_seconds: i64,
        _cancel: CancellationToken,
    ) -> Result<Option<LeaseGrant>, StoreError> {
        let row: Option<(i64, chrono::DateTime<chrono::Utc>)> = sqlx::query_as(
            r#"
            update infra.leases
               set lease_until_utc = now() + make_interval(secs => $3),
                   fencing_token = fencing_token + 1
             where resource_name = $1 and owner_token = $2 and lease_until_utc > now()
            returning fencing_token, lease_until_utc
            "#,
        )
        .bind(resource_name)
        .bind(owner_to_uuid(owner))
        .bind(lease_seconds.max(1) as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        Ok(row.map(|(fencing_token, lease_until_utc)| LeaseGrant {
            fencing_token: FencingToken(fencing_token),
            lease_until_utc,
        }))
    }

    async fn release(
        &self,
        resource_name: &str,
        owner: OwnerToken,
        _cancel: CancellationToken,
    ) -> Result<bool, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            update infra.leases
               set owner_token = null, lease_until_utc = null
             where resource_name = $1 and owner_token = $2
            returning resource_name
            "#,
        )
        .bind(resource_name)
        .bind(owner_to_uuid(owner))
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.is_some())
    }

    async fn get(
        &self,
        resource_name: &str,
        _cancel: CancellationToken,
    ) -> Result<Option<LeaseRow>, StoreError> {
        let row = sqlx::query(
            r#"
            select resource_name, owner_token, lease_until_utc, fencing_token, context_json
            from infra.leases
            where resource_name = $1
            "#,
        )
        .bind(resource_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(LeaseRow {
            resource_name: row.try_get("resource_name").map_err(transient)?,
            owner_token: row
                .try_get::<Option<uuid::Uuid>, _>("owner_token")
                .map_err(transient)?
                .map(uuid_to_owner),
            lease_until_utc: row.try_get("lease_until_utc").map_err(transient)?,
            fencing_token: FencingToken(row.try_get("fencing_token").map_err(transient)?),
            context_json: row.try_get("context_json").map_err(transient)?,
        }))
    }
}
