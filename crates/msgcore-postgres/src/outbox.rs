//! Postgres `OutboxStore`. Claims use `FOR UPDATE SKIP LOCKED` within a
//! single update-returning statement so concurrent dispatchers never claim
//! the same row (`spec.md` §4.1).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use msgcore_store::{OutboxRow, OutboxStore};
use msgcore_types::{Applied, OutboxStatus, OwnerToken, StoreError};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;

use crate::{owner_to_uuid, transient, uuid_to_owner};

pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_outbox(row: sqlx::postgres::PgRow) -> Result<OutboxRow, StoreError> {
    Ok(OutboxRow {
        id: row.try_get("id").map_err(transient)?,
        topic: row.try_get("topic").map_err(transient)?,
        payload: row.try_get("payload").map_err(transient)?,
        correlation_id: row.try_get("correlation_id").map_err(transient)?,
        due_time_utc: row.try_get("due_time_utc").map_err(transient)?,
        status: OutboxStatus::parse(&row.try_get::<String, _>("status").map_err(transient)?)?,
        owner_token: row
            .try_get::<Option<uuid::Uuid>, _>("owner_token")
            .map_err(transient)?
            .map(uuid_to_owner),
        locked_until: row.try_get("locked_until").map_err(transient)?,
        attempts: row.try_get("attempts").map_err(transient)?,
        last_error: row.try_get("last_error").map_err(transient)?,
    })
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn enqueue(
        &self,
        topic: &str,
        payload: Value,
        correlation_id: Option<String>,
        due_time_utc: Option<DateTime<Utc>>,
        _cancel: CancellationToken,
    ) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            insert into infra.outbox (topic, payload, correlation_id, due_time_utc, status)
            values ($1, $2, $3, $4, 'READY')
            returning id
            "#,
        )
        .bind(topic)
        .bind(payload)
        .bind(correlation_id)
        .bind(due_time_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.0)
    }

    async fn claim_due(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        limit: i64,
        _cancel: CancellationToken,
    ) -> Result<Vec<OutboxRow>, StoreError> {
        if limit <= 0 {
            return Err(StoreError::invalid_argument("batchSize must be > 0"));
        }
        let rows = sqlx::query(
            r#"
            with to_claim as (
                select id
                from infra.outbox
                where (status = 'READY' and (due_time_utc is null or due_time_utc <= now()))
                   or (status = 'CLAIMED' and locked_until <= now())
                order by coalesce(due_time_utc, '-infinity'::timestamptz), id
                limit $1
                for update skip locked
            )
            update infra.outbox
               set status = 'CLAIMED',
                   owner_token = $2,
                   locked_until = now() + make_interval(secs => $3),
                   transitioned_at = now()
             where id in (select id from to_claim)
            returning id, topic, payload, correlation_id, due_time_utc, status,
                      owner_token, locked_until, attempts, last_error
            "#,
        )
        .bind(limit)
        .bind(owner_to_uuid(owner))
        .bind(lease_seconds.max(1) as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;

        rows.into_iter().map(row_to_outbox).collect()
    }

    async fn mark_dispatched(
        &self,
        id: i64,
        owner: OwnerToken,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            update infra.outbox
               set status = 'DONE', owner_token = null, locked_until = null, transitioned_at = now()
             where id = $1 and status = 'CLAIMED' and owner_token = $2
            returning id
            "#,
        )
        .bind(id)
        .bind(owner_to_uuid(owner))
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.is_some().into())
    }

    async fn reschedule(
        &self,
        id: i64,
        owner: OwnerToken,
        delay: Duration,
        last_error: &str,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            update infra.outbox
               set status = 'READY',
                   attempts = attempts + 1,
                   due_time_utc = now() + make_interval(secs => $3),
                   last_error = $4,
                   owner_token = null,
                   locked_until = null,
                   transitioned_at = now()
             where id = $1 and status = 'CLAIMED' and owner_token = $2
            returning id
            "#,
        )
        .bind(id)
        .bind(owner_to_uuid(owner))
        .bind(delay.num_seconds() as f64)
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.is_some().into())
    }

    async fn fail(
        &self,
        id: i64,
        owner: OwnerToken,
        last_error: &str,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            update infra.outbox
               set status = 'FAILED', last_error = $3, owner_token = null, locked_until = null,
                   transitioned_at = now()
             where id = $1 and status = 'CLAIMED' and owner_token = $2
            returning id
            "#,
        )
        .bind(id)
        .bind(owner_to_uuid(owner))
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.is_some().into())
    }

    async fn get_next_event_time(
        &self,
        _cancel: CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            r#"
            select min(coalesce(due_time_utc, now()))
            from infra.outbox
            where status = 'READY'
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.and_then(|(t,)| t))
    }

    async fn cleanup(
        &self,
        retention: Duration,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            delete from infra.outbox
            where status in ('DONE', 'FAILED')
              and transitioned_at <= now() - make_interval(secs => $1)
            "#,
        )
        .bind(retention.num_seconds() as f64)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(result.rows_affected())
    }
}
