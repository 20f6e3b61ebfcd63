use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msgcore_types::{IdempotencyStatus, StoreError};
use tokio_util::sync::CancellationToken;

/// `spec.md` §3 `IdempotencyRow`.
#[derive(Debug, Clone)]
pub struct IdempotencyRow {
    pub key: String,
    pub status: IdempotencyStatus,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub failure_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Abstract idempotency store contract (`spec.md` §4.1): a `TryBegin`/
/// `Complete`/`Fail` gate with TTL lock and cleanup.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Opens a serializable read-for-update; returns `false` if
    /// `status == Completed` or a non-expired foreign lock is held.
    /// Otherwise upserts `status = InProgress` with `locked_by = caller`
    /// and `locked_until = now + lock_duration`.
    async fn try_begin(
        &self,
        key: &str,
        caller: &str,
        lock_duration: chrono::Duration,
        cancel: CancellationToken,
    ) -> Result<bool, StoreError>;

    /// Transition to Completed (terminal).
    async fn complete(&self, key: &str, caller: &str, cancel: CancellationToken) -> Result<(), StoreError>;

    /// Transition to Failed (reopenable by the next `TryBegin`).
    async fn fail(&self, key: &str, caller: &str, cancel: CancellationToken) -> Result<(), StoreError>;

    /// Delete Completed/Failed rows whose `completed_at`/`updated_at` is
    /// older than `retention`. Returns rows removed.
    async fn cleanup(
        &self,
        retention: chrono::Duration,
        cancel: CancellationToken,
    ) -> Result<u64, StoreError>;

    async fn get(&self, key: &str, cancel: CancellationToken) -> Result<Option<IdempotencyRow>, StoreError>;
}
