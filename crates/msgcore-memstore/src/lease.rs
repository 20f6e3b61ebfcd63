//! In-memory reference implementation of `LeaseStore`.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use msgcore_store::{LeaseGrant, LeaseRow, LeaseStore};
use msgcore_types::{FencingToken, OwnerToken, StoreError};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct State {
    rows: HashMap<String, LeaseRow>,
}

/// In-memory `LeaseStore`. Single-process only.
pub struct MemLeaseStore {
    state: Mutex<State>,
}

impl Default for MemLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemLeaseStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl LeaseStore for MemLeaseStore {
    async fn acquire(
        &self,
        resource_name: &str,
        owner: OwnerToken,
        lease_seconds: i64,
        context_json: Option<Value>,
        _cancel: CancellationToken,
    ) -> Result<Option<LeaseGrant>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let row = state
            .rows
            .entry(resource_name.to_string())
            .or_insert_with(|| LeaseRow {
                resource_name: resource_name.to_string(),
                owner_token: None,
                lease_until_utc: None,
                fencing_token: FencingToken::ZERO,
                context_json: None,
            });

        let free = row.owner_token.is_none()
            || row.lease_until_utc.map(|u| u <= now).unwrap_or(true)
            || row.owner_token == Some(owner);

        if !free {
            return Ok(None);
        }

        row.owner_token = Some(owner);
        row.lease_until_utc = Some(now + Duration::seconds(lease_seconds.max(1)));
        row.fencing_token = row.fencing_token.next();
        row.context_json = context_json.or_else(|| row.context_json.clone());

        Ok(Some(LeaseGrant {
            fencing_token: row.fencing_token,
            lease_until_utc: row.lease_until_utc.unwrap(),
        }))
    }

    async fn renew(
        &self,
        resource_name: &str,
        owner: OwnerToken,
        lease_seconds: i64,
        _cancel: CancellationToken,
    ) -> Result<Option<LeaseGrant>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let Some(row) = state.rows.get_mut(resource_name) else {
            return Ok(None);
        };

        let owned_and_live = row.owner_token == Some(owner)
            && row.lease_until_utc.map(|u| u > now).unwrap_or(false);
        if !owned_and_live {
            return Ok(None);
        }

        row.lease_until_utc = Some(now + Duration::seconds(lease_seconds.max(1)));
        row.fencing_token = row.fencing_token.next();

        Ok(Some(LeaseGrant {
            fencing_token: row.fencing_token,
            lease_until_utc: row.lease_until_utc.unwrap(),
        }))
    }

    async fn release(
        &self,
        resource_name: &str,
        owner: OwnerToken,
        _cancel: CancellationToken,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.rows.get_mut(resource_name) else {
            return Ok(false);
        };
        if row.owner_token != Some(owner) {
            return Ok(false);
        }
        row.owner_token = None;
        row.lease_until_utc = None;
        Ok(true)
    }

    async fn get(
        &self,
        resource_name: &str,
        _cancel: CancellationToken,
    ) -> Result<Option<LeaseRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.get(resource_name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_is_exclusive_and_fencing_token_advances() {
        let store = MemLeaseStore::new();
        let cancel = CancellationToken::new();
        let owner_a = OwnerToken::generate();
        let grant_a = store
            .acquire("scheduler:materialise", owner_a, 30, None, cancel.clone())
            .await
            .unwrap()
            .expect("should acquire a free lease");
        assert_eq!(grant_a.fencing_token, FencingToken::ZERO.next());

        let owner_b = OwnerToken::generate();
        let blocked = store
            .acquire("scheduler:materialise", owner_b, 30, None, cancel.clone())
            .await
            .unwrap();
        assert!(blocked.is_none());

        let renewed = store
            .renew("scheduler:materialise", owner_a, 30, cancel.clone())
            .await
            .unwrap()
            .expect("owner should renew its own lease");
        assert!(renewed.fencing_token > grant_a.fencing_token);

        let released = store.release("scheduler:materialise", owner_b, cancel.clone()).await.unwrap();
        assert!(!released);
        let released = store.release("scheduler:materialise", owner_a, cancel).await.unwrap();
        assert!(released);
    }

    #[tokio::test]
    async fn acquire_after_expiry_grants_a_new_owner() {
        let store = MemLeaseStore::new();
        let cancel = CancellationToken::new();
        let owner_a = OwnerToken::generate();
        store
            .acquire("webhook:partition:0", owner_a, 1, None, cancel.clone())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let owner_b = OwnerToken::generate();
        let grant = store
            .acquire("webhook:partition:0", owner_b, 30, None, cancel)
            .await
            .unwrap();
        assert!(grant.is_some());
    }
}
