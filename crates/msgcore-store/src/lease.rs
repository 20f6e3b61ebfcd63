use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msgcore_types::{FencingToken, OwnerToken, StoreError};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// `spec.md` §3 `LeaseRow`.
#[derive(Debug, Clone)]
pub struct LeaseRow {
    pub resource_name: String,
    pub owner_token: Option<OwnerToken>,
    pub lease_until_utc: Option<DateTime<Utc>>,
    pub fencing_token: FencingToken,
    pub context_json: Option<Value>,
}

/// Outcome of a successful `Acquire`/`Renew` call.
#[derive(Debug, Clone, Copy)]
pub struct LeaseGrant {
    pub fencing_token: FencingToken,
    pub lease_until_utc: DateTime<Utc>,
}

/// Abstract lease store contract (`spec.md` §4.1). The fenced variant is the
/// only lease contract this codebase implements (`DESIGN.md` Open Question).
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Succeeds iff the row is free, expired, or already owned by `owner`.
    /// On success, `fencing_token` strictly increases and is returned.
    async fn acquire(
        &self,
        resource_name: &str,
        owner: OwnerToken,
        lease_seconds: i64,
        context_json: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Option<LeaseGrant>, StoreError>;

    /// Succeeds iff the row is still owned by `owner` and not expired;
    /// `fencing_token` strictly increases.
    async fn renew(
        &self,
        resource_name: &str,
        owner: OwnerToken,
        lease_seconds: i64,
        cancel: CancellationToken,
    ) -> Result<Option<LeaseGrant>, StoreError>;

    /// Nulls ownership fields. Owner-scoped; non-owner release is a silent
    /// no-op (`false`).
    async fn release(
        &self,
        resource_name: &str,
        owner: OwnerToken,
        cancel: CancellationToken,
    ) -> Result<bool, StoreError>;

    async fn get(
        &self,
        resource_name: &str,
        cancel: CancellationToken,
    ) -> Result<Option<LeaseRow>, StoreError>;
}
