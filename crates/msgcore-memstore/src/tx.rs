//! In-memory composition of the outbox and idempotency stores into a single
//! atomic "complete + enqueue" unit (`spec.md` §4.6 exactly-once executor).

use async_trait::async_trait;
use chrono::Utc;
use msgcore_store::{OutboxEnqueueRequest, TransactionalOutboxIdempotency};
use msgcore_types::{IdempotencyStatus, StoreError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::idempotency::MemIdempotencyStore;
use crate::outbox::MemOutboxStore;

/// Composes `MemOutboxStore` and `MemIdempotencyStore` so that completing an
/// idempotency key and enqueuing its outbox messages happen under a single
/// critical section: the idempotency lock is held for the whole operation,
/// so no concurrent caller can observe the key as `Completed` with its
/// outbox messages not yet visible.
pub struct MemTransactionalStore {
    outbox: Arc<MemOutboxStore>,
    idempotency: Arc<MemIdempotencyStore>,
}

impl MemTransactionalStore {
    pub fn new(outbox: Arc<MemOutboxStore>, idempotency: Arc<MemIdempotencyStore>) -> Self {
        Self { outbox, idempotency }
    }
}

#[async_trait]
impl TransactionalOutboxIdempotency for MemTransactionalStore {
    async fn complete_with_outbox_enqueue(
        &self,
        idempotency_key: &str,
        caller: &str,
        outbox_messages: Vec<OutboxEnqueueRequest>,
        _cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        let mut idem_state = self.idempotency.state.lock().await;
        let now = Utc::now();
        let row = idem_state
            .rows
            .get_mut(idempotency_key)
            .ok_or_else(|| StoreError::not_found(format!("idempotency key {idempotency_key} not found")))?;
        if row.locked_by.as_deref() != Some(caller) {
            return Ok(());
        }

        let mut outbox_state = self.outbox.state.lock().await;
        for req in outbox_messages {
            let id = outbox_state.next_id;
            outbox_state.next_id += 1;
            outbox_state.rows.push(crate::outbox::Entry {
                row: msgcore_store::OutboxRow {
                    id,
                    topic: req.topic,
                    payload: req.payload,
                    correlation_id: req.correlation_id,
                    due_time_utc: req.due_time_utc,
                    status: msgcore_types::OutboxStatus::Ready,
                    owner_token: None,
                    locked_until: None,
                    attempts: 0,
                    last_error: None,
                },
                transitioned_at: now,
            });
        }
        drop(outbox_state);

        row.status = IdempotencyStatus::Completed;
        row.completed_at = Some(now);
        row.updated_at = now;
        row.locked_until = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgcore_store::{IdempotencyStore, OutboxStore};

    #[tokio::test]
    async fn completion_enqueues_outbox_messages_atomically() {
        let outbox = Arc::new(MemOutboxStore::new());
        let idempotency = Arc::new(MemIdempotencyStore::new());
        let tx = MemTransactionalStore::new(outbox.clone(), idempotency.clone());
        let cancel = CancellationToken::new();

        idempotency
            .try_begin("order-123", "worker-1", chrono::Duration::seconds(30), cancel.clone())
            .await
            .unwrap();

        tx.complete_with_outbox_enqueue(
            "order-123",
            "worker-1",
            vec![OutboxEnqueueRequest {
                topic: "orders.confirmed".to_string(),
                payload: serde_json::json!({"orderId": "123"}),
                correlation_id: None,
                due_time_utc: None,
            }],
            cancel.clone(),
        )
        .await
        .unwrap();

        let row = idempotency.get("order-123", cancel.clone()).await.unwrap().unwrap();
        assert_eq!(row.status, IdempotencyStatus::Completed);

        let claimed = outbox
            .claim_due(msgcore_types::OwnerToken::generate(), 30, 10, cancel)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].topic, "orders.confirmed");
    }

    #[tokio::test]
    async fn completion_is_a_no_op_for_a_foreign_caller() {
        let outbox = Arc::new(MemOutboxStore::new());
        let idempotency = Arc::new(MemIdempotencyStore::new());
        let tx = MemTransactionalStore::new(outbox.clone(), idempotency.clone());
        let cancel = CancellationToken::new();

        idempotency
            .try_begin("order-123", "worker-1", chrono::Duration::seconds(30), cancel.clone())
            .await
            .unwrap();

        tx.complete_with_outbox_enqueue("order-123", "worker-2", vec![], cancel.clone())
            .await
            .unwrap();

        let row = idempotency.get("order-123", cancel).await.unwrap().unwrap();
        assert_eq!(row.status, IdempotencyStatus::InProgress);
    }
}
