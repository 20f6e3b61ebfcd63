//! In-memory reference implementation of `IdempotencyStore`.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use msgcore_store::{IdempotencyRow, IdempotencyStore};
use msgcore_types::{IdempotencyStatus, StoreError};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub(crate) struct State {
    pub(crate) rows: HashMap<String, IdempotencyRow>,
}

/// In-memory `IdempotencyStore`. Single-process only.
pub struct MemIdempotencyStore {
    pub(crate) state: Mutex<State>,
}

impl Default for MemIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemIdempotencyStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl IdempotencyStore for MemIdempotencyStore {
    async fn try_begin(
        &self,
        key: &str,
        caller: &str,
        lock_duration: Duration,
        _cancel: CancellationToken,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(row) = state.rows.get_mut(key) {
            if row.status == IdempotencyStatus::Completed {
                return Ok(false);
            }
            let foreign_lock_held = row
                .locked_until
                .map(|l| l > now)
                .unwrap_or(false)
                && row.locked_by.as_deref() != Some(caller);
            if foreign_lock_held {
                return Ok(false);
            }
            row.status = IdempotencyStatus::InProgress;
            row.locked_by = Some(caller.to_string());
            row.locked_until = Some(now + lock_duration);
            row.updated_at = now;
            return Ok(true);
        }

        state.rows.insert(
            key.to_string(),
            IdempotencyRow {
                key: key.to_string(),
                status: IdempotencyStatus::InProgress,
                locked_until: Some(now + lock_duration),
                locked_by: Some(caller.to_string()),
                failure_count: 0,
                created_at: now,
                updated_at: now,
                completed_at: None,
            },
        );
        Ok(true)
    }

    async fn complete(&self, key: &str, caller: &str, _cancel: CancellationToken) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let row = state
            .rows
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(format!("idempotency key {key} not found")))?;
        if row.locked_by.as_deref() != Some(caller) {
            return Ok(());
        }
        row.status = IdempotencyStatus::Completed;
        row.completed_at = Some(now);
        row.updated_at = now;
        row.locked_until = None;
        Ok(())
    }

    async fn fail(&self, key: &str, caller: &str, _cancel: CancellationToken) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let row = state
            .rows
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(format!("idempotency key {key} not found")))?;
        if row.locked_by.as_deref() != Some(caller) {
            return Ok(());
        }
        row.status = IdempotencyStatus::Failed;
        row.failure_count += 1;
        row.updated_at = now;
        row.locked_until = None;
        Ok(())
    }

    async fn cleanup(
        &self,
        retention: Duration,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let before = state.rows.len();
        state.rows.retain(|_, r| {
            let terminal = matches!(
                r.status,
                IdempotencyStatus::Completed | IdempotencyStatus::Failed
            );
            if !terminal {
                return true;
            }
            let reference = r.completed_at.unwrap_or(r.updated_at);
            now - reference <= retention
        });
        Ok((before - state.rows.len()) as u64)
    }

    async fn get(&self, key: &str, _cancel: CancellationToken) -> Result<Option<IdempotencyRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_key_is_terminal() {
        let store = MemIdempotencyStore::new();
        let cancel = CancellationToken::new();
        assert!(store
            .try_begin("key-1", "worker-1", Duration::seconds(30), cancel.clone())
            .await
            .unwrap());
        store.complete("key-1", "worker-1", cancel.clone()).await.unwrap();

        assert!(!store
            .try_begin("key-1", "worker-2", Duration::seconds(30), cancel)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn in_progress_lock_blocks_a_foreign_caller_until_it_expires() {
        let store = MemIdempotencyStore::new();
        let cancel = CancellationToken::new();
        assert!(store
            .try_begin("key-2", "worker-1", Duration::seconds(1), cancel.clone())
            .await
            .unwrap());
        assert!(!store
            .try_begin("key-2", "worker-2", Duration::seconds(30), cancel.clone())
            .await
            .unwrap());

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(store
            .try_begin("key-2", "worker-2", Duration::seconds(30), cancel)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn fail_from_a_foreign_caller_is_a_silent_no_op() {
        let store = MemIdempotencyStore::new();
        let cancel = CancellationToken::new();
        store
            .try_begin("key-3", "worker-1", Duration::seconds(30), cancel.clone())
            .await
            .unwrap();
        store.fail("key-3", "worker-2", cancel.clone()).await.unwrap();

        let row = store.get("key-3", cancel).await.unwrap().unwrap();
        assert_eq!(row.status, IdempotencyStatus::InProgress);
        assert_eq!(row.failure_count, 0);
    }
}
