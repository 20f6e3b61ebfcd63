//! In-memory reference implementation of `InboxStore`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use msgcore_store::{InboxRow, InboxStore};
use msgcore_types::{Applied, InboxStatus, MessageId, OwnerToken, StoreError};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct State {
    rows: HashMap<MessageId, InboxRow>,
}

/// In-memory `InboxStore`. Single-process only; intended for tests and the
/// reference implementation called out by `spec.md` §1.
pub struct MemInboxStore {
    state: Mutex<State>,
}

impl Default for MemInboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemInboxStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl InboxStore for MemInboxStore {
    async fn already_processed(
        &self,
        message_id: &MessageId,
        source: &str,
        hash: Option<&str>,
        _cancel: CancellationToken,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let row = state.rows.entry(message_id.clone()).or_insert_with(|| InboxRow {
            message_id: message_id.clone(),
            source: source.to_string(),
            topic: String::new(),
            payload: Value::Null,
            hash: hash.map(|h| h.to_string()),
            status: InboxStatus::Seen,
            owner_token: None,
            locked_until: None,
            due_time_utc: None,
            first_seen_utc: now,
            last_seen_utc: now,
            processed_utc: None,
            attempts: 0,
            last_error: None,
        });
        if row.attempts > 0 || row.first_seen_utc != now {
            row.attempts += 1;
        } else {
            row.attempts = 1;
        }
        row.last_seen_utc = now;
        Ok(row.status.is_terminal())
    }

    async fn enqueue(
        &self,
        topic: &str,
        source: &str,
        message_id: &MessageId,
        payload: Value,
        hash: Option<&str>,
        due_time_utc: Option<DateTime<Utc>>,
        _cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        match state.rows.get_mut(message_id) {
            Some(row) if row.topic.is_empty() && row.payload.is_null() => {
                // `AlreadyProcessed` pre-inserted a content-less placeholder row
                // (`spec.md` §4.1); this is the first real payload for this
                // dedupe key, so it must win rather than be coalesced away.
                row.topic = topic.to_string();
                row.payload = payload;
                row.due_time_utc = due_time_utc;
                row.last_seen_utc = now;
            }
            Some(row) if row.status.is_terminal() => {
                // Already Done: retain the earliest-seen payload, just bump bookkeeping.
                row.last_seen_utc = now;
            }
            Some(row) => {
                // Coalesce: keep the earliest payload/topic/due-time until processed.
                row.last_seen_utc = now;
            }
            None => {
                state.rows.insert(
                    message_id.clone(),
                    InboxRow {
                        message_id: message_id.clone(),
                        source: source.to_string(),
                        topic: topic.to_string(),
                        payload,
                        hash: hash.map(|h| h.to_string()),
                        status: InboxStatus::Seen,
                        owner_token: None,
                        locked_until: None,
                        due_time_utc,
                        first_seen_utc: now,
                        last_seen_utc: now,
                        processed_utc: None,
                        attempts: 1,
                        last_error: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn mark_processing(
        &self,
        message_id: &MessageId,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let mut state = self.state.lock().await;
        match state.rows.get_mut(message_id) {
            Some(row) if !row.status.is_terminal() => {
                row.status = InboxStatus::Processing;
                Ok(Applied::YES)
            }
            _ => Ok(Applied::NO),
        }
    }

    async fn mark_processed(
        &self,
        message_id: &MessageId,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let mut state = self.state.lock().await;
        match state.rows.get_mut(message_id) {
            Some(row) => {
                row.status = InboxStatus::Done;
                row.processed_utc = Some(Utc::now());
                row.owner_token = None;
                row.locked_until = None;
                Ok(Applied::YES)
            }
            None => Ok(Applied::NO),
        }
    }

    async fn mark_dead(
        &self,
        message_id: &MessageId,
        last_error: &str,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let mut state = self.state.lock().await;
        match state.rows.get_mut(message_id) {
            Some(row) => {
                row.status = InboxStatus::Dead;
                row.last_error = Some(last_error.to_string());
                row.owner_token = None;
                row.locked_until = None;
                Ok(Applied::YES)
            }
            None => Ok(Applied::NO),
        }
    }

    async fn claim(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        batch_size: i64,
        _cancel: CancellationToken,
    ) -> Result<Vec<InboxRow>, StoreError> {
        if batch_size <= 0 {
            return Err(StoreError::invalid_argument("batchSize must be > 0"));
        }
        let now = Utc::now();
        let lock_until = now + Duration::seconds(lease_seconds.max(1));
        let mut state = self.state.lock().await;

        let mut eligible: Vec<MessageId> = state
            .rows
            .values()
            .filter(|r| {
                let status_ok = matches!(r.status, InboxStatus::Seen | InboxStatus::Processing);
                let lock_ok = r.locked_until.map(|l| l <= now).unwrap_or(true);
                let due_ok = r.due_time_utc.map(|d| d <= now).unwrap_or(true);
                status_ok && lock_ok && due_ok
            })
            .map(|r| r.message_id.clone())
            .collect();
        eligible.sort_by(|a, b| {
            let ra = &state.rows[a];
            let rb = &state.rows[b];
            ra.due_time_utc
                .cmp(&rb.due_time_utc)
                .then(ra.first_seen_utc.cmp(&rb.first_seen_utc))
        });

        let mut out = Vec::new();
        for id in eligible.into_iter().take(batch_size as usize) {
            let row = state.rows.get_mut(&id).unwrap();
            row.status = InboxStatus::Processing;
            row.owner_token = Some(owner);
            row.locked_until = Some(lock_until);
            out.push(row.clone());
        }
        Ok(out)
    }

    async fn ack(
        &self,
        message_id: &MessageId,
        owner: OwnerToken,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let mut state = self.state.lock().await;
        match state.rows.get_mut(message_id) {
            Some(row) if row.status == InboxStatus::Processing && row.owner_token == Some(owner) => {
                row.status = InboxStatus::Done;
                row.processed_utc = Some(Utc::now());
                row.owner_token = None;
                row.locked_until = None;
                Ok(Applied::YES)
            }
            _ => Ok(Applied::NO),
        }
    }

    async fn abandon(
        &self,
        message_id: &MessageId,
        owner: OwnerToken,
        delay: Option<Duration>,
        last_error: &str,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        match state.rows.get_mut(message_id) {
            Some(row) if row.status == InboxStatus::Processing && row.owner_token == Some(owner) => {
                row.status = InboxStatus::Seen;
                row.attempts += 1;
                row.last_error = Some(last_error.to_string());
                row.owner_token = None;
                row.locked_until = None;
                if let Some(d) = delay {
                    row.due_time_utc = Some(now + d);
                }
                Ok(Applied::YES)
            }
            _ => Ok(Applied::NO),
        }
    }

    async fn fail(
        &self,
        message_id: &MessageId,
        owner: OwnerToken,
        last_error: &str,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let mut state = self.state.lock().await;
        match state.rows.get_mut(message_id) {
            Some(row) if row.status == InboxStatus::Processing && row.owner_token == Some(owner) => {
                row.status = InboxStatus::Dead;
                row.last_error = Some(last_error.to_string());
                row.owner_token = None;
                row.locked_until = None;
                Ok(Applied::YES)
            }
            _ => Ok(Applied::NO),
        }
    }

    async fn revive(
        &self,
        message_id: &MessageId,
        delay: Option<Duration>,
        _cancel: CancellationToken,
    ) -> Result<Applied, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        match state.rows.get_mut(message_id) {
            Some(row) if row.status == InboxStatus::Dead => {
                row.status = InboxStatus::Seen;
                row.due_time_utc = delay.map(|d| now + d);
                row.last_error = None;
                Ok(Applied::YES)
            }
            _ => Ok(Applied::NO),
        }
    }

    async fn reap_expired(&self, _cancel: CancellationToken) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut count = 0u64;
        for row in state.rows.values_mut() {
            if row.status == InboxStatus::Processing && row.locked_until.map(|l| l <= now).unwrap_or(false)
            {
                row.status = InboxStatus::Seen;
                row.owner_token = None;
                row.locked_until = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get(
        &self,
        message_id: &MessageId,
        _cancel: CancellationToken,
    ) -> Result<InboxRow, StoreError> {
        let state = self.state.lock().await;
        state
            .rows
            .get(message_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("inbox row {message_id} not found")))
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
            !(r.status.is_terminal()
                && r.processed_utc.map(|p| now - p > retention).unwrap_or(false))
        });
        Ok((before - state.rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn already_processed_is_false_until_marked_done() {
        let store = MemInboxStore::new();
        let cancel = CancellationToken::new();
        let id = MessageId::from("evt-1");

        assert!(!store.already_processed(&id, "stripe", None, cancel.clone()).await.unwrap());
        assert!(!store.already_processed(&id, "stripe", None, cancel.clone()).await.unwrap());

        let row = store.get(&id, cancel.clone()).await.unwrap();
        assert_eq!(row.attempts, 2);

        store.mark_processed(&id, cancel.clone()).await.unwrap();
        assert!(store.already_processed(&id, "stripe", None, cancel).await.unwrap());
    }

    #[tokio::test]
    async fn claim_is_owner_scoped_and_ack_terminal() {
        let store = MemInboxStore::new();
        let cancel = CancellationToken::new();
        let id = MessageId::from("evt-2");
        store
            .enqueue("topic.a", "stripe", &id, serde_json::json!({}), None, None, cancel.clone())
            .await
            .unwrap();

        let owner = OwnerToken::generate();
        let claimed = store.claim(owner, 30, 10, cancel.clone()).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let other = OwnerToken::generate();
        let applied = store.ack(&id, other, cancel.clone()).await.unwrap();
        assert!(!applied.is_applied());

        let applied = store.ack(&id, owner, cancel).await.unwrap();
        assert!(applied.is_applied());
    }

    #[tokio::test]
    async fn revive_resets_dead_message_to_seen() {
        let store = MemInboxStore::new();
        let cancel = CancellationToken::new();
        let id = MessageId::from("evt-3");
        store
            .enqueue("topic.a", "stripe", &id, serde_json::json!({}), None, None, cancel.clone())
            .await
            .unwrap();
        let owner = OwnerToken::generate();
        store.claim(owner, 30, 10, cancel.clone()).await.unwrap();
        store.fail(&id, owner, "unrecoverable", cancel.clone()).await.unwrap();

        let row = store.get(&id, cancel.clone()).await.unwrap();
        assert_eq!(row.status, InboxStatus::Dead);

        let applied = store.revive(&id, None, cancel.clone()).await.unwrap();
        assert!(applied.is_applied());
        let row = store.get(&id, cancel).await.unwrap();
        assert_eq!(row.status, InboxStatus::Seen);
    }
}
