use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msgcore_types::{Applied, OutboxStatus, OwnerToken, StoreError};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// `spec.md` §3 `OutboxRow`.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub topic: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub due_time_utc: Option<DateTime<Utc>>,
    pub status: OutboxStatus,
    pub owner_token: Option<OwnerToken>,
    pub locked_until: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

/// Abstract, dialect-neutral outbox store contract (`spec.md` §4.1).
///
/// Implementations must guarantee:
/// - `ClaimDue` is atomic per row and skips rows locked by concurrent
///   claimants.
/// - FIFO ordering by `(dueTimeUtc, insertion order)`.
/// - Mutations made with a stale owner token are silent no-ops (`Applied(false)`),
///   never errors.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a Ready row. Returns the new row id.
    async fn enqueue(
        &self,
        topic: &str,
        payload: Value,
        correlation_id: Option<String>,
        due_time_utc: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> Result<i64, StoreError>;

    /// Claim up to `limit` Ready rows whose `due_time_utc` is null or <= now.
    /// Returns `InvalidArgument` if `limit <= 0`.
    async fn claim_due(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        limit: i64,
        cancel: CancellationToken,
    ) -> Result<Vec<OutboxRow>, StoreError>;

    /// Terminal Done transition. Owner-scoped.
    async fn mark_dispatched(
        &self,
        id: i64,
        owner: OwnerToken,
        cancel: CancellationToken,
    ) -> Result<Applied, StoreError>;

    /// Back to Ready; `attempts += 1`; `due_time_utc = now + delay`. Owner-scoped.
    async fn reschedule(
        &self,
        id: i64,
        owner: OwnerToken,
        delay: chrono::Duration,
        last_error: &str,
        cancel: CancellationToken,
    ) -> Result<Applied, StoreError>;

    /// Terminal Failed transition. Owner-scoped.
    async fn fail(
        &self,
        id: i64,
        owner: OwnerToken,
        last_error: &str,
        cancel: CancellationToken,
    ) -> Result<Applied, StoreError>;

    /// Earliest `due_time_utc` among Ready rows, used by the dispatcher to
    /// bound its idle-poll sleep.
    async fn get_next_event_time(
        &self,
        cancel: CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Delete Done/Failed rows older than `retention`. Returns rows removed.
    async fn cleanup(
        &self,
        retention: chrono::Duration,
        cancel: CancellationToken,
    ) -> Result<u64, StoreError>;
}

/// A single outbox message to be enqueued as part of an exactly-once
/// transaction (`spec.md` §4.6).
#[derive(Debug, Clone)]
pub struct OutboxEnqueueRequest {
    pub topic: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub due_time_utc: Option<DateTime<Utc>>,
}
