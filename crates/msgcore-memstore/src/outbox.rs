//! In-memory reference implementation of `OutboxStore` (`spec.md` §1: "the
//! one in-memory reference implementation used for testing").

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use msgcore_store::{OutboxRow, OutboxStore};
use msgcore_types::{Applied, OutboxStatus, OwnerToken, StoreError};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub(crate) struct Entry {
    pub(crate) row: OutboxRow,
    /// Last time this row transitioned state; used by `cleanup` retention.
    pub(crate) transitioned_at: DateTime<Utc>,
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) rows: Vec<Entry>,
    pub(crate) next_id: i64,
}

/// In-memory `OutboxStore`. Single-process only; intended for tests and the
/// reference implementation called out by `spec.md` §1.
pub struct MemOutboxStore {
    pub(crate) state: Mutex<State>,
}

impl Default for MemOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemOutboxStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                rows: Vec::new(),
                next_id: 1,
            }),
        }
    }
}

#[async_trait]
impl OutboxStore for MemOutboxStore {
    async fn enqueue(
        &self,
        topic: &str,
        payload: Value,
        correlation_id: Option<String>,
        due_time_utc: Option<DateTime<Utc>>,
        _cancel: CancellationToken,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        let now = Utc::now();
        state.rows.push(Entry {
            row: OutboxRow {
                id,
                topic: topic.to_string(),
                payload,
                correlation_id,
                due_time_utc,
                status: OutboxStatus::Ready,
                owner_token: None,
                locked_until: None,
                attempts: 0,
                last_error: None,
            },
            transitioned_at: now,
        });
        Ok(id)
    }

    async fn claim_due(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        limit: i64,
        _cancel: CancellationToken,
    ) -> Result<Vec<OutboxRow>, StoreError> {
        if limit <= 0 {
            return Err(StoreError::invalid_argument("batchSize must be > 0"));
        }
        let now = Utc::now();
        let lock_until = now + Duration::seconds(lease_seconds.max(1));
        let mut state = self.state.lock().await;

        let mut candidates: Vec<usize> = state
            .rows
            .iter()
            .enumerate()
            .filter(|(_, e)| match e.row.status {
                OutboxStatus::Ready => e.row.due_time_utc.map(|d| d <= now).unwrap_or(true),
                // Stale-claim recovery: a crashed dispatcher's claim expires
                // and becomes reclaimable.
                OutboxStatus::Claimed => e.row.locked_until.map(|l| l <= now).unwrap_or(false),
                _ => false,
            })
            .map(|(i, _)| i)
            .collect();

        candidates.sort_by_key(|&i| {
            let row = &state.rows[i].row;
            (row.due_time_utc.unwrap_or(DateTime::<Utc>::MIN_UTC), row.id)
        });

        let mut out = Vec::new();
        for idx in candidates.into_iter().take(limit as usize) {
            let entry = &mut state.rows[idx];
            entry.row.status = OutboxStatus::Claimed;
            entry.row.owner_token = Some(owner);
            entry.row.locked_until = Some(lock_until);
            entry.transitioned_at = now;
            out.push(entry.row.clone());
        }
        Ok(out)
    }

    async fn mark_dispatched(
        &self,
        id: i64,
        owner: OwnerToken,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for entry in state.rows.iter_mut() {
            if entry.row.id == id {
                if entry.row.status == OutboxStatus::Claimed && entry.row.owner_token == Some(owner)
                {
                    entry.row.status = OutboxStatus::Done;
                    entry.row.owner_token = None;
                    entry.row.locked_until = None;
                    entry.transitioned_at = now;
                    return Ok(Applied::YES);
                }
                return Ok(Applied::NO);
            }
        }
        Ok(Applied::NO)
    }

    async fn reschedule(
        &self,
        id: i64,
        owner: OwnerToken,
        delay: Duration,
        last_error: &str,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for entry in state.rows.iter_mut() {
            if entry.row.id == id {
                if entry.row.status == OutboxStatus::Claimed && entry.row.owner_token == Some(owner)
                {
                    entry.row.status = OutboxStatus::Ready;
                    entry.row.attempts += 1;
                    entry.row.due_time_utc = Some(now + delay);
                    entry.row.last_error = Some(last_error.to_string());
                    entry.row.owner_token = None;
                    entry.row.locked_until = None;
                    entry.transitioned_at = now;
                    return Ok(Applied::YES);
                }
                return Ok(Applied::NO);
            }
        }
        Ok(Applied::NO)
    }

    async fn fail(
        &self,
        id: i64,
        owner: OwnerToken,
        last_error: &str,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for entry in state.rows.iter_mut() {
            if entry.row.id == id {
                if entry.row.status == OutboxStatus::Claimed && entry.row.owner_token == Some(owner)
                {
                    entry.row.status = OutboxStatus::Failed;
                    entry.row.last_error = Some(last_error.to_string());
                    entry.row.owner_token = None;
                    entry.row.locked_until = None;
                    entry.transitioned_at = now;
                    return Ok(Applied::YES);
                }
                return Ok(Applied::NO);
            }
        }
        Ok(Applied::NO)
    }

    async fn get_next_event_time(
        &self,
        _cancel: CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        let mut next: Option<DateTime<Utc>> = None;
        for entry in state.rows.iter() {
            if entry.row.status != OutboxStatus::Ready {
                continue;
            }
            let candidate = entry.row.due_time_utc.unwrap_or_else(Utc::now);
            next = Some(match next {
                Some(n) if n <= candidate => n,
                _ => candidate,
            });
        }
        Ok(next)
    }

    async fn cleanup(
        &self,
        retention: Duration,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let before = state.rows.len();
        state.rows.retain(|e| {
            !(e.row.status.is_terminal() && now - e.transitioned_at > retention)
        });
        Ok((before - state.rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_claim_is_reclaimed_after_lock_expiry() {
        let store = MemOutboxStore::new();
        let cancel = CancellationToken::new();
        store
            .enqueue("topic.a", serde_json::json!({}), None, None, cancel.clone())
            .await
            .unwrap();

        let owner_a = OwnerToken::generate();
        let claimed = store.claim_due(owner_a, 1, 10, cancel.clone()).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // owner_a never acks or fails; once its 1-second lock expires the row
        // becomes reclaimable by a different owner.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let owner_b = OwnerToken::generate();
        let reclaimed = store.claim_due(owner_b, 30, 10, cancel.clone()).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, claimed[0].id);

        let applied = store.mark_dispatched(claimed[0].id, owner_a, cancel).await.unwrap();
        assert!(!applied.is_applied());
    }

    #[tokio::test]
    async fn mutation_with_stale_owner_is_a_silent_no_op() {
        let store = MemOutboxStore::new();
        let cancel = CancellationToken::new();
        let id = store
            .enqueue("topic.a", serde_json::json!({}), None, None, cancel.clone())
            .await
            .unwrap();
        let owner = OwnerToken::generate();
        store.claim_due(owner, 30, 10, cancel.clone()).await.unwrap();

        let other = OwnerToken::generate();
        let applied = store
            .fail(id, other, "boom", cancel)
            .await
            .unwrap();
        assert!(!applied.is_applied());
    }

    #[tokio::test]
    async fn claim_due_rejects_non_positive_limit() {
        let store = MemOutboxStore::new();
        let err = store
            .claim_due(OwnerToken::generate(), 30, 0, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }
}
