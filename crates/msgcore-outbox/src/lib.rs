//! Outbox dispatcher (`spec.md` §4.3): claim/ack/retry/fail loop dispatching
//! to in-process topic handlers, one per tenant database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use msgcore_lease::LeaseManager;
use msgcore_store::{OutboxRow, OutboxStore};
use msgcore_types::OwnerToken;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Stable error string used when a claimed row's topic has no registered
/// handler (`spec.md` §4.3).
pub const NO_HANDLER_FOR_TOPIC: &str = "no-handler-for-topic";

/// The payload and metadata handed to an outbox handler.
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub id: i64,
    pub topic: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub attempts: i32,
}

impl From<&OutboxRow> for OutboxMessage {
    fn from(row: &OutboxRow) -> Self {
        Self {
            id: row.id,
            topic: row.topic.clone(),
            payload: row.payload.clone(),
            correlation_id: row.correlation_id.clone(),
            attempts: row.attempts,
        }
    }
}

/// In-process outbox topic handler (`spec.md` §6 handler registration
/// surface).
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    fn topic(&self) -> &str;
    async fn handle(&self, message: OutboxMessage) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct OutboxDispatcherConfig {
    pub tenant: String,
    pub lease_seconds: i64,
    pub batch_size: i64,
    pub max_attempts: u32,
    pub base_backoff: ChronoDuration,
    pub max_backoff: ChronoDuration,
    pub idle_poll: StdDuration,
}

impl OutboxDispatcherConfig {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            lease_seconds: 30,
            batch_size: 50,
            max_attempts: 5,
            base_backoff: ChronoDuration::seconds(1),
            max_backoff: ChronoDuration::seconds(300),
            idle_poll: StdDuration::from_secs(5),
        }
    }
}

/// Exponential backoff `min(maxBackoff, base * 2^attempts)` (`spec.md`
/// §4.3 step 4).
pub fn backoff_delay(attempts: i32, base: ChronoDuration, max: ChronoDuration) -> ChronoDuration {
    let factor = 1i64.checked_shl(attempts.max(0) as u32).unwrap_or(i64::MAX);
    let scaled = base.num_milliseconds().saturating_mul(factor);
    ChronoDuration::milliseconds(scaled.min(max.num_milliseconds()))
}

pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    lease_manager: Arc<LeaseManager>,
    handlers: HashMap<String, Arc<dyn OutboxHandler>>,
    config: OutboxDispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        lease_manager: Arc<LeaseManager>,
        config: OutboxDispatcherConfig,
    ) -> Self {
        Self {
            store,
            lease_manager,
            handlers: HashMap::new(),
            config,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn OutboxHandler>) {
        self.handlers.insert(handler.topic().to_string(), handler);
    }

    /// Runs the claim→handle→ack loop until `shutdown` fires or the lease
    /// is lost. Returns immediately (without error) if another worker
    /// already holds the tenant's lease (`spec.md` §4.3 step 1).
    pub async fn run(&self, shutdown: CancellationToken) {
        let resource = format!("outbox:{}", self.config.tenant);
        let lease = match self
            .lease_manager
            .acquire(&resource, self.config.lease_seconds, shutdown.clone())
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                info!(resource, "outbox dispatcher did not acquire lease, another worker holds it");
                return;
            }
            Err(err) => {
                warn!(resource, error = %err, "outbox dispatcher failed to acquire lease");
                return;
            }
        };

        let cancel = lease.cancellation_token();
        info!(tenant = %self.config.tenant, "outbox dispatcher started");

        while !cancel.is_cancelled() {
            let owner = lease.owner();
            match self
                .store
                .claim_due(owner, self.config.lease_seconds, self.config.batch_size, cancel.clone())
                .await
            {
                Ok(rows) if !rows.is_empty() => {
                    msgcore_metrics::record_claimed("outbox", &self.config.tenant, rows.len() as u64);
                    for row in rows {
                        self.dispatch_one(row, owner, cancel.clone()).await;
                    }
                }
                Ok(_) => self.idle_sleep(&cancel).await,
                Err(err) => {
                    warn!(tenant = %self.config.tenant, error = %err, "outbox claim failed");
                    self.idle_sleep(&cancel).await;
                }
            }
        }

        info!(tenant = %self.config.tenant, "outbox dispatcher stopping");
        lease.release().await;
    }

    async fn dispatch_one(&self, row: OutboxRow, owner: OwnerToken, cancel: CancellationToken) {
        let topic = row.topic.clone();
        let id = row.id;
        let attempts = row.attempts;
        let message = OutboxMessage::from(&row);

        let result = match self.handlers.get(&topic) {
            Some(handler) => handler.handle(message).await,
            None => Err(NO_HANDLER_FOR_TOPIC.to_string()),
        };

        match result {
            Ok(()) => {
                if let Err(err) = self.store.mark_dispatched(id, owner, cancel).await {
                    warn!(id, error = %err, "mark_dispatched failed");
                }
                msgcore_metrics::record_acknowledged("outbox", &self.config.tenant);
            }
            Err(last_error) => {
                if (attempts + 1) < self.config.max_attempts as i32 {
                    let delay = backoff_delay(attempts, self.config.base_backoff, self.config.max_backoff);
                    if let Err(err) = self.store.reschedule(id, owner, delay, &last_error, cancel).await {
                        warn!(id, error = %err, "reschedule failed");
                    }
                    msgcore_metrics::record_abandoned("outbox", &self.config.tenant, &last_error);
                } else {
                    if let Err(err) = self.store.fail(id, owner, &last_error, cancel).await {
                        warn!(id, error = %err, "fail failed");
                    }
                    msgcore_metrics::record_failed("outbox", &self.config.tenant, &last_error);
                }
            }
        }
    }

    async fn idle_sleep(&self, cancel: &CancellationToken) {
        let next_event = self
            .store
            .get_next_event_time(cancel.clone())
            .await
            .ok()
            .flatten();
        let sleep_for = idle_sleep_duration(next_event, self.config.idle_poll);
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

/// `max(idlePoll, nextEventTime - now)` (`spec.md` §4.3 step 5), floored at
/// zero when the next event is already due.
fn idle_sleep_duration(next_event: Option<DateTime<Utc>>, idle_poll: StdDuration) -> StdDuration {
    match next_event {
        None => idle_poll,
        Some(t) => {
            let until = t - Utc::now();
            let until_std = until.to_std().unwrap_or(StdDuration::ZERO);
            until_std.max(idle_poll)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgcore_lease::LeaseManagerConfig;
    use msgcore_memstore::{MemLeaseStore, MemOutboxStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingHandler {
        topic: String,
        seen: Arc<Mutex<Vec<Value>>>,
        fail_times: AtomicUsize,
    }

    #[async_trait]
    impl OutboxHandler for RecordingHandler {
        fn topic(&self) -> &str {
            &self.topic
        }

        async fn handle(&self, message: OutboxMessage) -> Result<(), String> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err("transient".to_string());
            }
            self.seen.lock().unwrap().push(message.payload);
            Ok(())
        }
    }

    #[tokio::test]
    async fn s1_outbox_round_trip_dispatches_exactly_once() {
        let outbox = Arc::new(MemOutboxStore::new());
        let lease_store = Arc::new(MemLeaseStore::new());
        let lease_manager = Arc::new(LeaseManager::new(lease_store, LeaseManagerConfig::default()));

        outbox
            .enqueue("o.t", serde_json::json!("p"), None, None, CancellationToken::new())
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = OutboxDispatcher::new(
            outbox.clone(),
            lease_manager,
            OutboxDispatcherConfig::new("tenant-a"),
        );
        dispatcher.register(Arc::new(RecordingHandler {
            topic: "o.t".to_string(),
            seen: seen.clone(),
            fail_times: AtomicUsize::new(0),
        }));

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move { dispatcher.run(shutdown_clone).await });

        tokio::time::sleep(StdDuration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), &[serde_json::json!("p")]);
    }

    #[tokio::test]
    async fn unknown_topic_is_treated_as_handler_failure() {
        let outbox = Arc::new(MemOutboxStore::new());
        let lease_store = Arc::new(MemLeaseStore::new());
        let lease_manager = Arc::new(LeaseManager::new(lease_store, LeaseManagerConfig::default()));

        let id = outbox
            .enqueue("unregistered.topic", serde_json::json!({}), None, None, CancellationToken::new())
            .await
            .unwrap();

        let mut config = OutboxDispatcherConfig::new("tenant-a");
        config.max_attempts = 1;
        let dispatcher = OutboxDispatcher::new(outbox.clone(), lease_manager, config);

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move { dispatcher.run(shutdown_clone).await });
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let row = outbox
            .claim_due(msgcore_types::OwnerToken::generate(), 30, 10, CancellationToken::new())
            .await
            .unwrap();
        // max_attempts = 1 means the very first failure is terminal.
        assert!(row.is_empty(), "row should be terminal (Failed), not re-claimable");
        let _ = id;
    }

    #[test]
    fn backoff_caps_at_max_backoff() {
        let base = ChronoDuration::seconds(1);
        let max = ChronoDuration::seconds(60);
        assert_eq!(backoff_delay(0, base, max), ChronoDuration::seconds(1));
        assert_eq!(backoff_delay(3, base, max), ChronoDuration::seconds(8));
        assert_eq!(backoff_delay(10, base, max), max);
    }
}
