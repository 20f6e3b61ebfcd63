use async_trait::async_trait;
use msgcore_types::StoreError;
use tokio_util::sync::CancellationToken;

use crate::outbox::OutboxEnqueueRequest;

/// The transactional seam the exactly-once executor requires (`spec.md`
/// §4.6): `idempotency.Complete(key)` and the handler's side-effect outbox
/// enqueues must participate in one database transaction, so a crash
/// between the two can never leave a completed-but-unpublished operation.
///
/// Modelled as a single atomic call rather than a generic "run in
/// transaction" closure so every backend — Postgres with a real
/// `sqlx::Transaction`, or the in-memory store with a process-local lock —
/// can offer the same guarantee without exposing its transaction type
/// across the trait boundary.
#[async_trait]
pub trait TransactionalOutboxIdempotency: Send + Sync {
    /// Atomically: enqueue every message in `outbox_messages`, then
    /// transition `idempotency_key` to Completed. Either both happen or
    /// neither does.
    async fn complete_with_outbox_enqueue(
        &self,
        idempotency_key: &str,
        caller: &str,
        outbox_messages: Vec<OutboxEnqueueRequest>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError>;
}
