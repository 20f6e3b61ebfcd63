//! Exactly-once executor (`spec.md` §4.6): composes a lease, the
//! idempotency store, and the transactional outbox-enqueue seam to run a
//! handler at-most-once while still publishing its side effects
//! at-least-once.

use std::future::Future;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use msgcore_lease::LeaseManager;
use msgcore_store::{IdempotencyStore, OutboxEnqueueRequest, TransactionalOutboxIdempotency};
use msgcore_types::StoreError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What a handler hands back to the executor: its own result plus the
/// outbox messages that must be enqueued in the same transaction as
/// `idempotency.Complete`.
#[derive(Debug, Clone)]
pub struct HandlerOutput<T> {
    pub value: T,
    pub outbox_messages: Vec<OutboxEnqueueRequest>,
}

impl<T> HandlerOutput<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            outbox_messages: Vec::new(),
        }
    }

    pub fn with_outbox(value: T, outbox_messages: Vec<OutboxEnqueueRequest>) -> Self {
        Self { value, outbox_messages }
    }
}

/// Result of a `run()` call.
#[derive(Debug)]
pub enum ExecutionOutcome<T> {
    /// The handler ran exactly once and its side effects are enqueued.
    Executed(T),
    /// Another caller holds the lease or the idempotency key, or the key
    /// is already `Completed`. The handler never ran.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The handler itself returned an error; `idempotency.Fail` was called
    /// and the key is reopenable by the next `run()`.
    #[error("handler failed: {0}")]
    HandlerFailed(String),
}

pub struct ExactlyOnceExecutor {
    lease_manager: Arc<LeaseManager>,
    idempotency: Arc<dyn IdempotencyStore>,
    tx: Arc<dyn TransactionalOutboxIdempotency>,
    lock_duration: ChronoDuration,
    lease_seconds: i64,
}

impl ExactlyOnceExecutor {
    pub fn new(
        lease_manager: Arc<LeaseManager>,
        idempotency: Arc<dyn IdempotencyStore>,
        tx: Arc<dyn TransactionalOutboxIdempotency>,
        lock_duration: ChronoDuration,
        lease_seconds: i64,
    ) -> Self {
        Self {
            lease_manager,
            idempotency,
            tx,
            lock_duration,
            lease_seconds,
        }
    }

    /// Runs `handler` under the exactly-once contract keyed by `key`
    /// (`spec.md` §4.6 steps 1-4).
    pub async fn run<T, F, Fut>(&self, key: &str, handler: F) -> Result<ExecutionOutcome<T>, ExecutorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HandlerOutput<T>, String>>,
    {
        let resource = format!("idempotency:{key}");
        let cancel = CancellationToken::new();

        let Some(lease) = self
            .lease_manager
            .acquire(&resource, self.lease_seconds, cancel.clone())
            .await?
        else {
            debug!(key, "exactly-once run skipped: lease not acquired");
            return Ok(ExecutionOutcome::Skipped);
        };

        let caller = lease.owner().to_string();
        let began = self
            .idempotency
            .try_begin(key, &caller, self.lock_duration, cancel.clone())
            .await?;
        if !began {
            debug!(key, "exactly-once run skipped: idempotency key already claimed");
            lease.release().await;
            return Ok(ExecutionOutcome::Skipped);
        }

        let result = handler().await;
        let outcome = match result {
            Ok(output) => {
                self.tx
                    .complete_with_outbox_enqueue(key, &caller, output.outbox_messages, cancel.clone())
                    .await?;
                Ok(ExecutionOutcome::Executed(output.value))
            }
            Err(handler_error) => {
                self.idempotency.fail(key, &caller, cancel.clone()).await?;
                Err(ExecutorError::HandlerFailed(handler_error))
            }
        };

        lease.release().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgcore_lease::LeaseManagerConfig;
    use msgcore_memstore::{MemIdempotencyStore, MemLeaseStore, MemOutboxStore, MemTransactionalStore};
    use msgcore_store::OutboxStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor() -> (ExactlyOnceExecutor, Arc<MemOutboxStore>) {
        let lease_store = Arc::new(MemLeaseStore::new());
        let idempotency = Arc::new(MemIdempotencyStore::new());
        let outbox = Arc::new(MemOutboxStore::new());
        let tx = Arc::new(MemTransactionalStore::new(outbox.clone(), idempotency.clone()));
        let lease_manager = Arc::new(LeaseManager::new(lease_store, LeaseManagerConfig::default()));
        (
            ExactlyOnceExecutor::new(lease_manager, idempotency, tx, ChronoDuration::seconds(30), 30),
            outbox,
        )
    }

    #[tokio::test]
    async fn handler_runs_exactly_once_for_concurrent_callers() {
        let (executor, outbox) = executor();
        let executor = Arc::new(executor);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let executor = executor.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .run("order-123", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(HandlerOutput::with_outbox(
                            "ok",
                            vec![OutboxEnqueueRequest {
                                topic: "orders.confirmed".to_string(),
                                payload: serde_json::json!({"orderId": "123"}),
                                correlation_id: None,
                                due_time_utc: None,
                            }],
                        ))
                    })
                    .await
            }));
        }

        let mut executed = 0;
        for h in handles {
            if let ExecutionOutcome::Executed(_) = h.await.unwrap().unwrap() {
                executed += 1;
            }
        }
        assert_eq!(executed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let claimed = outbox
            .claim_due(msgcore_types::OwnerToken::generate(), 30, 10, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn third_run_is_skipped_until_retention_elapses() {
        let (executor, _outbox) = executor();

        let first = executor
            .run("k1", || async { Ok(HandlerOutput::new(1)) })
            .await
            .unwrap();
        assert!(matches!(first, ExecutionOutcome::Executed(1)));

        let second = executor
            .run("k1", || async { Ok(HandlerOutput::new(2)) })
            .await
            .unwrap();
        assert!(matches!(second, ExecutionOutcome::Skipped));
    }

    #[tokio::test]
    async fn failed_handler_does_not_enqueue_and_reopens_the_key() {
        let (executor, outbox) = executor();

        let result = executor
            .run("k2", || async {
                Err::<HandlerOutput<()>, _>("boom".to_string())
            })
            .await;
        assert!(matches!(result, Err(ExecutorError::HandlerFailed(ref e)) if e == "boom"));

        let claimed = outbox
            .claim_due(msgcore_types::OwnerToken::generate(), 30, 10, CancellationToken::new())
            .await
            .unwrap();
        assert!(claimed.is_empty());

        // Failed is reopenable: a later run may retry.
        let retry = executor
            .run("k2", || async { Ok(HandlerOutput::new(42)) })
            .await
            .unwrap();
        assert!(matches!(retry, ExecutionOutcome::Executed(42)));
    }
}
