//! Postgres composition of the outbox and idempotency stores into a single
//! atomic "complete + enqueue" unit (`spec.md` §4.6), backed by a real
//! `sqlx::Transaction` so both writes commit or roll back together.

use async_trait::async_trait;
use msgcore_store::{OutboxEnqueueRequest, TransactionalOutboxIdempotency};
use msgcore_types::StoreError;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::transient;

pub struct PgTransactionalStore {
    pool: PgPool,
}

impl PgTransactionalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionalOutboxIdempotency for PgTransactionalStore {
    async fn complete_with_outbox_enqueue(
        &self,
        idempotency_key: &str,
        caller: &str,
        outbox_messages: Vec<OutboxEnqueueRequest>,
        _cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(transient)?;

        let existing: Option<(String,)> =
            sqlx::query_as("select key from infra.idempotency_keys where key = $1 for update")
                .bind(idempotency_key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(transient)?;
        if existing.is_none() {
            return Err(StoreError::not_found(format!(
                "idempotency key {idempotency_key} not found"
            )));
        }

        let completed: Option<(String,)> = sqlx::query_as(
            r#"
            update infra.idempotency_keys
               set status = 'COMPLETED', completed_at = now(), updated_at = now(), locked_until = null
             where key = $1 and locked_by = $2
            returning key
            "#,
        )
        .bind(idempotency_key)
        .bind(caller)
        .fetch_optional(&mut *tx)
        .await
        .map_err(transient)?;

        if completed.is_none() {
            // Locked by a different caller: nothing to do, roll back cleanly.
            tx.rollback().await.map_err(transient)?;
            return Ok(());
        }

        for req in outbox_messages {
            sqlx::query(
                r#"
                insert into infra.outbox (topic, payload, correlation_id, due_time_utc, status)
                values ($1, $2, $3, $4, 'READY')
                "#,
            )
            .bind(req.topic)
            .bind(req.payload)
            .bind(req.correlation_id)
            .bind(req.due_time_utc)
            .execute(&mut *tx)
            .await
            .map_err(transient)?;
        }

        tx.commit().await.map_err(transient)?;
        Ok(())
    }
}
