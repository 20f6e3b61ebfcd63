//! Inbox dispatcher (`spec.md` §4.4): claim/ack/abandon/fail/revive loop
//! dispatching to in-process topic handlers, with a missing-handler policy
//! distinct from the outbox dispatcher's unconditional failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use msgcore_lease::LeaseManager;
use msgcore_store::{InboxRow, InboxStore};
use msgcore_types::{MessageId, MissingHandlerBehavior, OwnerToken};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const NO_HANDLER_FOR_TOPIC: &str = "no-handler-for-topic";

#[derive(Debug, Clone)]
pub struct InboxMessage {
    pub message_id: MessageId,
    pub source: String,
    pub topic: String,
    pub payload: Value,
    pub attempts: i32,
}

impl From<&InboxRow> for InboxMessage {
    fn from(row: &InboxRow) -> Self {
        Self {
            message_id: row.message_id.clone(),
            source: row.source.clone(),
            topic: row.topic.clone(),
            payload: row.payload.clone(),
            attempts: row.attempts,
        }
    }
}

/// In-process inbox topic handler (`spec.md` §6 handler registration
/// surface).
#[async_trait]
pub trait InboxHandler: Send + Sync {
    fn topic(&self) -> &str;
    async fn handle(&self, message: InboxMessage) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct InboxDispatcherConfig {
    pub tenant: String,
    pub lease_seconds: i64,
    pub batch_size: i64,
    pub max_attempts: u32,
    pub base_backoff: ChronoDuration,
    pub max_backoff: ChronoDuration,
    pub idle_poll: StdDuration,
    pub missing_handler_behavior: MissingHandlerBehavior,
}

impl InboxDispatcherConfig {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            lease_seconds: 30,
            batch_size: 50,
            max_attempts: 5,
            base_backoff: ChronoDuration::seconds(1),
            max_backoff: ChronoDuration::seconds(300),
            idle_poll: StdDuration::from_secs(5),
            missing_handler_behavior: MissingHandlerBehavior::Retry,
        }
    }
}

/// Exponential backoff `min(maxBackoff, base * 2^attempts)`, shared with the
/// outbox dispatcher's retry cadence (`spec.md` §4.3 step 4, reused by §4.4).
pub fn backoff_delay(attempts: i32, base: ChronoDuration, max: ChronoDuration) -> ChronoDuration {
    let factor = 1i64.checked_shl(attempts.max(0) as u32).unwrap_or(i64::MAX);
    let scaled = base.num_milliseconds().saturating_mul(factor);
    ChronoDuration::milliseconds(scaled.min(max.num_milliseconds()))
}

pub struct InboxDispatcher {
    store: Arc<dyn InboxStore>,
    lease_manager: Arc<LeaseManager>,
    handlers: HashMap<String, Arc<dyn InboxHandler>>,
    config: InboxDispatcherConfig,
}

impl InboxDispatcher {
    pub fn new(
        store: Arc<dyn InboxStore>,
        lease_manager: Arc<LeaseManager>,
        config: InboxDispatcherConfig,
    ) -> Self {
        Self {
            store,
            lease_manager,
            handlers: HashMap::new(),
            config,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn InboxHandler>) {
        self.handlers.insert(handler.topic().to_string(), handler);
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let resource = format!("inbox:{}", self.config.tenant);
        let lease = match self
            .lease_manager
            .acquire(&resource, self.config.lease_seconds, shutdown.clone())
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                info!(resource, "inbox dispatcher did not acquire lease, another worker holds it");
                return;
            }
            Err(err) => {
                warn!(resource, error = %err, "inbox dispatcher failed to acquire lease");
                return;
            }
        };

        let cancel = lease.cancellation_token();
        info!(tenant = %self.config.tenant, "inbox dispatcher started");

        while !cancel.is_cancelled() {
            let owner = lease.owner();
            match self
                .store
                .claim(owner, self.config.lease_seconds, self.config.batch_size, cancel.clone())
                .await
            {
                Ok(rows) if !rows.is_empty() => {
                    msgcore_metrics::record_claimed("inbox", &self.config.tenant, rows.len() as u64);
                    for row in rows {
                        self.dispatch_one(row, owner, cancel.clone()).await;
                    }
                }
                Ok(_) => self.idle_sleep(&cancel).await,
                Err(err) => {
                    warn!(tenant = %self.config.tenant, error = %err, "inbox claim failed");
                    self.idle_sleep(&cancel).await;
                }
            }
        }

        info!(tenant = %self.config.tenant, "inbox dispatcher stopping");
        lease.release().await;
    }

    async fn dispatch_one(&self, row: InboxRow, owner: OwnerToken, cancel: CancellationToken) {
        let message_id = row.message_id.clone();
        let attempts = row.attempts;
        let message = InboxMessage::from(&row);

        let handler = self.handlers.get(&row.topic).cloned();
        let result = match handler {
            Some(h) => h.handle(message).await,
            None => {
                self.apply_missing_handler_policy(&message_id, owner, attempts, cancel).await;
                return;
            }
        };

        match result {
            Ok(()) => {
                if let Err(err) = self.store.ack(&message_id, owner, cancel).await {
                    warn!(%message_id, error = %err, "inbox ack failed");
                }
                msgcore_metrics::record_acknowledged("inbox", &self.config.tenant);
            }
            Err(last_error) => {
                if (attempts + 1) < self.config.max_attempts as i32 {
                    let delay = backoff_delay(attempts, self.config.base_backoff, self.config.max_backoff);
                    if let Err(err) = self
                        .store
                        .abandon(&message_id, owner, Some(delay), &last_error, cancel)
                        .await
                    {
                        warn!(%message_id, error = %err, "inbox abandon failed");
                    }
                    msgcore_metrics::record_abandoned("inbox", &self.config.tenant, &last_error);
                } else {
                    if let Err(err) = self.store.fail(&message_id, owner, &last_error, cancel).await {
                        warn!(%message_id, error = %err, "inbox fail failed");
                    }
                    msgcore_metrics::record_failed("inbox", &self.config.tenant, &last_error);
                }
            }
        }
    }

    /// `spec.md` §4.4 missing-handler policy: `Complete` acks outright,
    /// `Retry` abandons with backoff until `maxAttempts` then poisons,
    /// `Poison` fails immediately.
    async fn apply_missing_handler_policy(
        &self,
        message_id: &MessageId,
        owner: OwnerToken,
        attempts: i32,
        cancel: CancellationToken,
    ) {
        match self.config.missing_handler_behavior {
            MissingHandlerBehavior::Complete => {
                let _ = self.store.ack(message_id, owner, cancel).await;
                msgcore_metrics::record_acknowledged("inbox", &self.config.tenant);
            }
            MissingHandlerBehavior::Retry => {
                if (attempts + 1) < self.config.max_attempts as i32 {
                    let delay = backoff_delay(attempts, self.config.base_backoff, self.config.max_backoff);
                    let _ = self
                        .store
                        .abandon(message_id, owner, Some(delay), NO_HANDLER_FOR_TOPIC, cancel)
                        .await;
                    msgcore_metrics::record_abandoned("inbox", &self.config.tenant, NO_HANDLER_FOR_TOPIC);
                } else {
                    let _ = self.store.fail(message_id, owner, NO_HANDLER_FOR_TOPIC, cancel).await;
                    msgcore_metrics::record_failed("inbox", &self.config.tenant, NO_HANDLER_FOR_TOPIC);
                }
            }
            MissingHandlerBehavior::Poison => {
                let _ = self.store.fail(message_id, owner, NO_HANDLER_FOR_TOPIC, cancel).await;
                msgcore_metrics::record_failed("inbox", &self.config.tenant, NO_HANDLER_FOR_TOPIC);
            }
        }
    }

    /// The inbox store exposes no single next-due-time query (unlike the
    /// outbox's `getNextEventTime`), so the idle wait is a flat poll
    /// interval (`spec.md` §4.4).
    async fn idle_sleep(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.idle_poll) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgcore_lease::LeaseManagerConfig;
    use msgcore_memstore::{MemInboxStore, MemLeaseStore};
    use std::sync::Mutex;

    struct RecordingHandler {
        topic: String,
        seen: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl InboxHandler for RecordingHandler {
        fn topic(&self) -> &str {
            &self.topic
        }

        async fn handle(&self, message: InboxMessage) -> Result<(), String> {
            self.seen.lock().unwrap().push(message.payload);
            Ok(())
        }
    }

    #[tokio::test]
    async fn s2_inbox_dedupe_handler_invoked_once_with_first_seen_payload() {
        let inbox = Arc::new(MemInboxStore::new());
        let id = MessageId::from("m1");
        let source = "s1";

        // First ingest: `AlreadyProcessed` then `Enqueue` (`spec.md` §4.7
        // steps 6-7), the same order a real ingestor drives.
        inbox
            .already_processed(&id, source, None, CancellationToken::new())
            .await
            .unwrap();
        inbox
            .enqueue("topic.a", source, &id, serde_json::json!("p1"), None, None, CancellationToken::new())
            .await
            .unwrap();

        // Second ingest with a different payload: coalesced, earliest payload
        // wins, but `AlreadyProcessed` still bumps attempts on every ingest.
        inbox
            .already_processed(&id, source, None, CancellationToken::new())
            .await
            .unwrap();
        inbox
            .enqueue("topic.a", source, &id, serde_json::json!("p2"), None, None, CancellationToken::new())
            .await
            .unwrap();

        let row = inbox.get(&id, CancellationToken::new()).await.unwrap();
        assert_eq!(row.attempts, 2, "each ingest's AlreadyProcessed call bumps attempts");
        assert_eq!(row.payload, serde_json::json!("p1"));

        let lease_store = Arc::new(MemLeaseStore::new());
        let lease_manager = Arc::new(LeaseManager::new(lease_store, LeaseManagerConfig::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = InboxDispatcher::new(inbox, lease_manager, InboxDispatcherConfig::new("tenant-a"));
        dispatcher.register(Arc::new(RecordingHandler {
            topic: "topic.a".to_string(),
            seen: seen.clone(),
        }));

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move { dispatcher.run(shutdown_clone).await });
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), &[serde_json::json!("p1")]);
    }

    #[tokio::test]
    async fn missing_handler_poison_fails_immediately() {
        let inbox = Arc::new(MemInboxStore::new());
        let id = MessageId::from("m2");
        inbox
            .enqueue("unhandled.topic", "s1", &id, serde_json::json!({}), None, None, CancellationToken::new())
            .await
            .unwrap();

        let lease_store = Arc::new(MemLeaseStore::new());
        let lease_manager = Arc::new(LeaseManager::new(lease_store, LeaseManagerConfig::default()));
        let mut config = InboxDispatcherConfig::new("tenant-a");
        config.missing_handler_behavior = MissingHandlerBehavior::Poison;
        let dispatcher = InboxDispatcher::new(inbox.clone(), lease_manager, config);

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move { dispatcher.run(shutdown_clone).await });
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let row = inbox.get(&id, CancellationToken::new()).await.unwrap();
        assert_eq!(row.status, msgcore_types::InboxStatus::Dead);
    }
}
