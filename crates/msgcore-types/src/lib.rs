//! Shared identifiers, tokens, and the error taxonomy used by every store
//! contract and dispatcher in the messaging core.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque message identifier, unique per inbox source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 128-bit random identifier of the current claim holder. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerToken(pub [u8; 16]);

impl OwnerToken {
    /// Generate a fresh random owner token. Callers must not reuse a token
    /// across distinct claims.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_uuid())
    }
}

/// Monotonically increasing per-lease counter, returned on acquire/renew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FencingToken(pub i64);

impl FencingToken {
    pub const ZERO: FencingToken = FencingToken(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbox row lifecycle state (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Ready,
    Claimed,
    Done,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Ready => "READY",
            OutboxStatus::Claimed => "CLAIMED",
            OutboxStatus::Done => "DONE",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "READY" => Ok(OutboxStatus::Ready),
            "CLAIMED" => Ok(OutboxStatus::Claimed),
            "DONE" => Ok(OutboxStatus::Done),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(StoreError::invalid_argument(format!(
                "invalid outbox status: {other}"
            ))),
        }
    }

    /// Terminal states are never re-claimed (`spec.md` §3 invariant).
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Done | OutboxStatus::Failed)
    }
}

/// Inbox row lifecycle state (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboxStatus {
    Seen,
    Processing,
    Done,
    Dead,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Seen => "SEEN",
            InboxStatus::Processing => "PROCESSING",
            InboxStatus::Done => "DONE",
            InboxStatus::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "SEEN" => Ok(InboxStatus::Seen),
            "PROCESSING" => Ok(InboxStatus::Processing),
            "DONE" => Ok(InboxStatus::Done),
            "DEAD" => Ok(InboxStatus::Dead),
            other => Err(StoreError::invalid_argument(format!(
                "invalid inbox status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InboxStatus::Done)
    }
}

/// Scheduler timer / job-run lifecycle state. Shared between `TimerRow` and
/// `JobRunRow` (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerItemStatus {
    Ready,
    Claimed,
    Done,
    Failed,
}

impl SchedulerItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerItemStatus::Ready => "READY",
            SchedulerItemStatus::Claimed => "CLAIMED",
            SchedulerItemStatus::Done => "DONE",
            SchedulerItemStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "READY" => Ok(SchedulerItemStatus::Ready),
            "CLAIMED" => Ok(SchedulerItemStatus::Claimed),
            "DONE" => Ok(SchedulerItemStatus::Done),
            "FAILED" => Ok(SchedulerItemStatus::Failed),
            other => Err(StoreError::invalid_argument(format!(
                "invalid scheduler item status: {other}"
            ))),
        }
    }
}

/// Idempotency row lifecycle state (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::InProgress => "IN_PROGRESS",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "IN_PROGRESS" => Ok(IdempotencyStatus::InProgress),
            "COMPLETED" => Ok(IdempotencyStatus::Completed),
            "FAILED" => Ok(IdempotencyStatus::Failed),
            other => Err(StoreError::invalid_argument(format!(
                "invalid idempotency status: {other}"
            ))),
        }
    }
}

/// Webhook event lifecycle state (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventStatus {
    Pending,
    Processing,
    Completed,
    FailedRetryable,
    Poisoned,
    Rejected,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Pending => "PENDING",
            WebhookEventStatus::Processing => "PROCESSING",
            WebhookEventStatus::Completed => "COMPLETED",
            WebhookEventStatus::FailedRetryable => "FAILED_RETRYABLE",
            WebhookEventStatus::Poisoned => "POISONED",
            WebhookEventStatus::Rejected => "REJECTED",
        }
    }
}

/// Missing-handler policy for inbox/webhook dispatch (`spec.md` §4.4, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum MissingHandlerBehavior {
    Complete,
    Retry,
    Poison,
}

/// The error taxonomy defined in `spec.md` §7. Every store-contract
/// operation returns `Result<_, StoreError>`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Caller violated a pre-condition (empty id, non-positive batch size,
    /// negative delay). Always surfaced.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested row missing where existence was asserted. Always surfaced.
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend I/O failure. Retried at the dispatcher level for claimed
    /// work, or surfaced to the caller for synchronous operations.
    #[error("transient store error: {0}")]
    TransientStore(#[source] anyhow::Error),

    /// Lease observed expired or renewal denied.
    #[error("lease lost for resource {resource}")]
    LostLease { resource: String },

    /// Schema deployment failed for a discovered database.
    #[error("schema deployment failed for {database}: {reason}")]
    SchemaDeploymentFailure { database: String, reason: String },
}

impl StoreError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        StoreError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        StoreError::NotFound(msg.into())
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        StoreError::TransientStore(err.into())
    }
}

/// Conflict / owner-mismatch is deliberately NOT a `StoreError` variant:
/// per `spec.md` §7 it is a silent no-op, surfaced as `applied: false` from
/// the mutating call rather than raised. `Applied` is the return wrapper
/// every owner-scoped mutation (`Ack`/`Abandon`/`Fail`/`Renew`/`Release`)
/// uses to let the caller distinguish "no work" from "not mine" (§9
/// redesign note) without either case being an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied(pub bool);

impl Applied {
    pub const YES: Applied = Applied(true);
    pub const NO: Applied = Applied(false);

    pub fn is_applied(&self) -> bool {
        self.0
    }
}

impl From<bool> for Applied {
    fn from(b: bool) -> Self {
        Applied(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_tokens_are_random_and_distinct() {
        let a = OwnerToken::generate();
        let b = OwnerToken::generate();
        assert_ne!(a, b, "two generated owner tokens must not collide");
    }

    #[test]
    fn fencing_token_strictly_increases() {
        let t0 = FencingToken::ZERO;
        let t1 = t0.next();
        let t2 = t1.next();
        assert!(t1 > t0);
        assert!(t2 > t1);
    }

    #[test]
    fn outbox_status_round_trips() {
        for s in [
            OutboxStatus::Ready,
            OutboxStatus::Claimed,
            OutboxStatus::Done,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(s.as_str()).unwrap().as_str(), s.as_str());
        }
    }

    #[test]
    fn terminal_outbox_states_are_done_and_failed_only() {
        assert!(OutboxStatus::Done.is_terminal());
        assert!(OutboxStatus::Failed.is_terminal());
        assert!(!OutboxStatus::Ready.is_terminal());
        assert!(!OutboxStatus::Claimed.is_terminal());
    }
}
