//! Postgres `InboxStore`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use msgcore_store::{InboxRow, InboxStore};
use msgcore_types::{Applied, InboxStatus, MessageId, OwnerToken, StoreError};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;

use crate::{owner_to_uuid, transient, uuid_to_owner};

pub struct PgInboxStore {
    pool: PgPool,
}

impl PgInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_inbox(row: sqlx::postgres::PgRow) -> Result<InboxRow, StoreError> {
    Ok(InboxRow {
        message_id: MessageId::from(row.try_get::<String, _>("message_id").map_err(transient)?),
        source: row.try_get("source").map_err(transient)?,
        topic: row.try_get("topic").map_err(transient)?,
        payload: row.try_get("payload").map_err(transient)?,
        hash: row.try_get("hash").map_err(transient)?,
        status: InboxStatus::parse(&row.try_get::<String, _>("status").map_err(transient)?)?,
        owner_token: row
            .try_get::<Option<uuid::Uuid>, _>("owner_token")
            .map_err(transient)?
            .map(uuid_to_owner),
        locked_until: row.try_get("locked_until").map_err(transient)?,
        due_time_utc: row.try_get("due_time_utc").map_err(transient)?,
        first_seen_utc: row.try_get("first_seen_utc").map_err(transient)?,
        last_seen_utc: row.try_get("last_seen_utc").map_err(transient)?,
        processed_utc: row.try_get("processed_utc").map_err(transient)?,
        attempts: row.try_get("attempts").map_err(transient)?,
        last_error: row.try_get("last_error").map_err(transient)?,
    })
}

#[async_trait]
impl InboxStore for PgInboxStore {
    async fn already_processed(
        &self,
        message_id: &MessageId,
        source: &str,
        hash: Option<&str>,
        _cancel: CancellationToken,
    ) -> Result<bool, StoreError> {
        let row: (String,) = sqlx::query_as(
            r#"
            insert into infra.inbox (message_id, source, topic, payload, hash, status, attempts)
            values ($1, $2, '', 'null'::jsonb, $3, 'SEEN', 1)
            on conflict (message_id) do update
                set attempts = infra.inbox.attempts + 1,
                    last_seen_utc = now()
            returning status
            "#,
        )
        .bind(message_id.0.as_str())
        .bind(source)
        .bind(hash)
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;
        Ok(InboxStatus::parse(&row.0)?.is_terminal())
    }

    async fn enqueue(
        &self,
        topic: &str,
        source: &str,
        message_id: &MessageId,
        payload: Value,
        hash: Option<&str>,
        due_time_utc: Option<DateTime<Utc>>,
        _cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        // `AlreadyProcessed` may have pre-inserted a content-less placeholder
        // row (`topic=''`, `payload=null`, `spec.md` §4.1); the first real
        // payload for this dedupe key must win that row rather than be
        // coalesced away, while a genuine repeat enqueue still retains the
        // earliest-seen payload until processed.
        sqlx::query(
            r#"
            insert into infra.inbox
                (message_id, source, topic, payload, hash, status, due_time_utc, attempts)
            values ($1, $2, $3, $4, $5, 'SEEN', $6, 1)
            on conflict (message_id) do update
                set last_seen_utc = now(),
                    topic = case when infra.inbox.topic = '' and infra.inbox.payload = 'null'::jsonb
                                 then excluded.topic else infra.inbox.topic end,
                    payload = case when infra.inbox.topic = '' and infra.inbox.payload = 'null'::jsonb
                                 then excluded.payload else infra.inbox.payload end,
                    due_time_utc = case when infra.inbox.topic = '' and infra.inbox.payload = 'null'::jsonb
                                 then excluded.due_time_utc else infra.inbox.due_time_utc end
            "#,
        )
        .bind(message_id.0.as_str())
        .bind(source)
        .bind(topic)
        .bind(payload)
        .bind(hash)
        .bind(due_time_utc)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn mark_processing(
        &self,
        message_id: &MessageId,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            update infra.inbox
               set status = 'PROCESSING'
             where message_id = $1 and status <> 'DONE'
            returning message_id
            "#,
        )
        .bind(message_id.0.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.is_some().into())
    }

    async fn mark_processed(
        &self,
        message_id: &MessageId,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            update infra.inbox
               set status = 'DONE', processed_utc = now(), owner_token = null, locked_until = null
             where message_id = $1
            returning message_id
            "#,
        )
        .bind(message_id.0.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.is_some().into())
    }

    async fn mark_dead(
        &self,
        message_id: &MessageId,
        last_error: &str,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            update infra.inbox
               set status = 'DEAD', last_error = $2, owner_token = null, locked_until = null
             where message_id = $1
            returning message_id
            "#,
        )
        .bind(message_id.0.as_str())
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.is_some().into())
    }

    async fn claim(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        batch_size: i64,
        _cancel: CancellationToken,
    ) -> Result<Vec<InboxRow>, StoreError> {
        if batch_size <= 0 {
            return Err(StoreError::invalid_argument("batchSize must be > 0"));
        }
        let rows = sqlx::query(
            r#"
            with to_claim as (
                select message_id
                from infra.inbox
                where status in ('SEEN', 'PROCESSING')
                  and (locked_until is null or locked_until <= now())
                  and (due_time_utc is null or due_time_utc <= now())
                order by coalesce(due_time_utc, '-infinity'::timestamptz), first_seen_utc
                limit $1
                for update skip locked
            )
            update infra.inbox
               set status = 'PROCESSING', owner_token = $2, locked_until = now() + make_interval(secs => $3)
             where message_id in (select message_id from to_claim)
            returning message_id, source, topic, payload, hash, status, owner_token, locked_until,
                      due_time_utc, first_seen_utc, last_seen_utc, processed_utc, attempts, last_error
            "#,
        )
        .bind(batch_size)
        .bind(owner_to_uuid(owner))
        .bind(lease_seconds.max(1) as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;

        rows.into_iter().map(row_to_inbox).collect()
    }

    async fn ack(
        &self,
        message_id: &MessageId,
        owner: OwnerToken,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            update infra.inbox
               set status = 'DONE', processed_utc = now(), owner_token = null, locked_until = null
             where message_id = $1 and status = 'PROCESSING' and owner_token = $2
            returning message_id
            "#,
        )
        .bind(message_id.0.as_str())
        .bind(owner_to_uuid(owner))
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.is_some().into())
    }

    async fn abandon(
        &self,
        message_id: &MessageId,
        owner: OwnerToken,
        delay: Option<Duration>,
        last_error: &str,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            update infra.inbox
               set status = 'SEEN',
                   attempts = attempts + 1,
                   last_error = $3,
                   owner_token = null,
                   locked_until = null,
                   due_time_utc = case when $4::float8 is null then due_time_utc
                                       else now() + make_interval(secs => $4) end
             where message_id = $1 and status = 'PROCESSING' and owner_token = $2
            returning message_id
            "#,
        )
        .bind(message_id.0.as_str())
        .bind(owner_to_uuid(owner))
        .bind(last_error)
        .bind(delay.map(|d| d.num_seconds() as f64))
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.is_some().into())
    }

    async fn fail(
        &self,
        message_id: &MessageId,
        owner: OwnerToken,
        last_error: &str,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            update infra.inbox
               set status = 'DEAD', last_error = $3, owner_token = null, locked_until = null
             where message_id = $1 and status = 'PROCESSING' and owner_token = $2
            returning message_id
            "#,
        )
        .bind(message_id.0.as_str())
        .bind(owner_to_uuid(owner))
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.is_some().into())
    }

    async fn revive(
        &self,
        message_id: &MessageId,
        delay: Option<Duration>,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            update infra.inbox
               set status = 'SEEN',
                   last_error = null,
                   due_time_utc = case when $2::float8 is null then null else now() + make_interval(secs => $2) end
             where message_id = $1 and status = 'DEAD'
            returning message_id
            "#,
        )
        .bind(message_id.0.as_str())
        .bind(delay.map(|d| d.num_seconds() as f64))
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.is_some().into())
    }

    async fn reap_expired(&self, _cancel: CancellationToken) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            update infra.inbox
               set status = 'SEEN', owner_token = null, locked_until = null
             where status = 'PROCESSING' and locked_until <= now()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(result.rows_affected())
    }

    async fn get(
        &self,
        message_id: &MessageId,
        _cancel: CancellationToken,
    ) -> Result<InboxRow, StoreError> {
        let row = sqlx::query(
            r#"
            select message_id, source, topic, payload, hash, status, owner_token, locked_until,
                   due_time_utc, first_seen_utc, last_seen_utc, processed_utc, attempts, last_error
            from infra.inbox
            where message_id = $1
            "#,
        )
        .bind(message_id.0.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        let row = row.ok_or_else(|| StoreError::not_found(format!("inbox row {message_id} not found")))?;
        row_to_inbox(row)
    }

    async fn cleanup(
        &self,
        retention: Duration,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            delete from infra.inbox
            where status = 'DONE'
              and processed_utc <= now() - make_interval(secs => $1)
            "#,
        )
        .bind(retention.num_seconds() as f64)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(result.rows_affected())
    }
}
