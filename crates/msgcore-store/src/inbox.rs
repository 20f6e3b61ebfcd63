use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msgcore_types::{Applied, InboxStatus, MessageId, OwnerToken, StoreError};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// `spec.md` §3 `InboxRow`.
#[derive(Debug, Clone)]
pub struct InboxRow {
    pub message_id: MessageId,
    pub source: String,
    pub topic: String,
    pub payload: Value,
    pub hash: Option<String>,
    pub status: InboxStatus,
    pub owner_token: Option<OwnerToken>,
    pub locked_until: Option<DateTime<Utc>>,
    pub due_time_utc: Option<DateTime<Utc>>,
    pub first_seen_utc: DateTime<Utc>,
    pub last_seen_utc: DateTime<Utc>,
    pub processed_utc: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

/// Abstract, dialect-neutral inbox store contract (`spec.md` §4.1). Mirrors
/// the outbox contract and adds dedupe-on-ingest semantics.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Upsert the row (Seen, `attempts += 1`) and return whether it was
    /// already marked Done. `firstSeenUtc` is preserved across repeat calls.
    async fn already_processed(
        &self,
        message_id: &MessageId,
        source: &str,
        hash: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<bool, StoreError>;

    /// Upsert with topic/payload/due-time coalescing so duplicate enqueues
    /// retain the earliest-seen payload until processed.
    async fn enqueue(
        &self,
        topic: &str,
        source: &str,
        message_id: &MessageId,
        payload: Value,
        hash: Option<&str>,
        due_time_utc: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError>;

    /// Operator-visible transition, independent of claim ownership.
    async fn mark_processing(
        &self,
        message_id: &MessageId,
        cancel: CancellationToken,
    ) -> Result<Applied, StoreError>;

    /// Operator-visible terminal Done transition, independent of claim ownership.
    async fn mark_processed(
        &self,
        message_id: &MessageId,
        cancel: CancellationToken,
    ) -> Result<Applied, StoreError>;

    /// Operator-visible terminal Dead transition, independent of claim ownership.
    async fn mark_dead(
        &self,
        message_id: &MessageId,
        last_error: &str,
        cancel: CancellationToken,
    ) -> Result<Applied, StoreError>;

    /// Claim rows whose status is Seen or Processing with an expired/null
    /// `locked_until` and `due_time_utc` reached. Returns `InvalidArgument`
    /// if `batch_size <= 0`.
    async fn claim(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        batch_size: i64,
        cancel: CancellationToken,
    ) -> Result<Vec<InboxRow>, StoreError>;

    /// Owner-scoped ack: terminal Done.
    async fn ack(
        &self,
        message_id: &MessageId,
        owner: OwnerToken,
        cancel: CancellationToken,
    ) -> Result<Applied, StoreError>;

    /// Owner-scoped abandon: back to Seen, optionally delayed, records `lastError`.
    async fn abandon(
        &self,
        message_id: &MessageId,
        owner: OwnerToken,
        delay: Option<chrono::Duration>,
        last_error: &str,
        cancel: CancellationToken,
    ) -> Result<Applied, StoreError>;

    /// Owner-scoped terminal Dead transition.
    async fn fail(
        &self,
        message_id: &MessageId,
        owner: OwnerToken,
        last_error: &str,
        cancel: CancellationToken,
    ) -> Result<Applied, StoreError>;

    /// Requeue a Dead row back to Seen with an optional delay.
    async fn revive(
        &self,
        message_id: &MessageId,
        delay: Option<chrono::Duration>,
        cancel: CancellationToken,
    ) -> Result<Applied, StoreError>;

    /// Transition abandoned Processing rows with expired `locked_until` back
    /// to Seen.
    async fn reap_expired(&self, cancel: CancellationToken) -> Result<u64, StoreError>;

    /// Fetch a row by message id. `NotFound` if absent.
    async fn get(
        &self,
        message_id: &MessageId,
        cancel: CancellationToken,
    ) -> Result<InboxRow, StoreError>;

    /// Delete Done rows older than `retention`. Returns rows removed.
    async fn cleanup(
        &self,
        retention: chrono::Duration,
        cancel: CancellationToken,
    ) -> Result<u64, StoreError>;
}
