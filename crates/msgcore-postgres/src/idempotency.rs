//! Postgres `IdempotencyStore`.

use async_trait::async_trait;
use chrono::Duration;
use msgcore_store::{IdempotencyRow, IdempotencyStore};
use msgcore_types::{IdempotencyStatus, StoreError};
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;

use crate::transient;

pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn try_begin(
        &self,
        key: &str,
        caller: &str,
        lock_duration: Duration,
        _cancel: CancellationToken,
    ) -> Result<bool, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            insert into infra.idempotency_keys
                (key, status, locked_until, locked_by, failure_count, created_at, updated_at)
            values ($1, 'IN_PROGRESS', now() + make_interval(secs => $3), $2, 0, now(), now())
            on conflict (key) do update
                set status = 'IN_PROGRESS',
                    locked_until = excluded.locked_until,
                    locked_by = excluded.locked_by,
                    updated_at = now()
             where infra.idempotency_keys.status <> 'COMPLETED'
               and (infra.idempotency_keys.locked_until is null
                    or infra.idempotency_keys.locked_until <= now()
                    or infra.idempotency_keys.locked_by = $2)
            returning key
            "#,
        )
        .bind(key)
        .bind(caller)
        .bind(lock_duration.num_seconds() as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.is_some())
    }

    async fn complete(&self, key: &str, caller: &str, _cancel: CancellationToken) -> Result<(), StoreError> {
        let existing: Option<(String,)> = sqlx::query_as("select key from infra.idempotency_keys where key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        if existing.is_none() {
            return Err(StoreError::not_found(format!("idempotency key {key} not found")));
        }
        sqlx::query(
            r#"
            update infra.idempotency_keys
               set status = 'COMPLETED', completed_at = now(), updated_at = now(), locked_until = null
             where key = $1 and locked_by = $2
            "#,
        )
        .bind(key)
        .bind(caller)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn fail(&self, key: &str, caller: &str, _cancel: CancellationToken) -> Result<(), StoreError> {
        let existing: Option<(String,)> = sqlx::query_as("select key from infra.idempotency_keys where key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        if existing.is_none() {
            return Err(StoreError::not_found(format!("idempotency key {key} not found")));
        }
        sqlx::query(
            r#"
            update infra.idempotency_keys
               set status = 'FAILED', failure_count = failure_count + 1, updated_at = now(), locked_until = null
             where key = $1 and locked_by = $2
            "#,
        )
        .bind(key)
        .bind(caller)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn cleanup(
        &self,
        retention: Duration,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            delete from infra.idempotency_keys
            where status in ('COMPLETED', 'FAILED')
              and coalesce(completed_at, updated_at) <= now() - make_interval(secs => $1)
            "#,
        )
        .bind(retention.num_seconds() as f64)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(result.rows_affected())
    }

    async fn get(&self, key: &str, _cancel: CancellationToken) -> Result<Option<IdempotencyRow>, StoreError> {
        let row = sqlx::query(
            r#"
            select key, status, locked_until, locked_by, failure_count, created_at, updated_at, completed_at
            from infra.idempotency_keys
            where key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(IdempotencyRow {
            key: row.try_get("key").map_err(transient)?,
            status: IdempotencyStatus::parse(&row.try_get::<String, _>("status").map_err(transient)?)?,
            locked_until: row.try_get("locked_until").map_err(transient)?,
            locked_by: row.try_get("locked_by").map_err(transient)?,
            failure_count: row.try_get("failure_count").map_err(transient)?,
            created_at: row.try_get("created_at").map_err(transient)?,
            updated_at: row.try_get("updated_at").map_err(transient)?,
            completed_at: row.try_get("completed_at").map_err(transient)?,
        }))
    }
}
