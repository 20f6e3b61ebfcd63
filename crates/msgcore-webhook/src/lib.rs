//! Webhook ingestion and processing (`spec.md` §4.7): authenticate →
//! classify → dedupe → enqueue on the way in, and the inbox dispatcher on
//! the way out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use msgcore_config::WebhookConfig;
use msgcore_inbox::{InboxDispatcher, InboxDispatcherConfig, InboxHandler};
use msgcore_store::InboxStore;
use msgcore_types::MessageId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Inbound HTTP request data, already stripped of transport concerns.
#[derive(Debug, Clone)]
pub struct RawEnvelope {
    pub headers: serde_json::Value,
    pub body: Vec<u8>,
}

/// `spec.md` §3 glossary `WebhookEventRecord`, stored as the inbox payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub provider: String,
    pub dedupe_key: String,
    pub status: WebhookRecordStatus,
    pub attempt_count: i32,
    pub body: String,
    pub headers: serde_json::Value,
    pub partition_key: Option<String>,
}

/// Mirrors `msgcore_types::WebhookEventStatus`, duplicated locally so the
/// stored JSON payload is self-describing without a dependency edge back
/// into the claim-ownership vocabulary that status enum is really for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookRecordStatus {
    Pending,
    Processing,
    Completed,
    FailedRetryable,
    Poisoned,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeDisposition {
    Accepted,
    Ignored,
    Rejected,
}

/// What the provider's classifier decided about one envelope (`spec.md`
/// §4.7 step 3).
#[derive(Debug, Clone)]
pub struct ClassifiedEnvelope {
    pub disposition: EnvelopeDisposition,
    pub event_type: String,
    pub provider_event_id: Option<String>,
    pub dedupe_key: Option<String>,
    pub partition_key: Option<String>,
    pub summary: serde_json::Value,
}

#[async_trait]
pub trait WebhookAuthenticator: Send + Sync {
    async fn authenticate(&self, envelope: &RawEnvelope) -> bool;
}

#[async_trait]
pub trait WebhookClassifier: Send + Sync {
    async fn classify(&self, envelope: &RawEnvelope) -> ClassifiedEnvelope;
}

/// `spec.md` §6 "Webhook provider: `{ name, authenticator, classifier,
/// handlers[] }`". `handlers` are keyed by event type the same way an inbox
/// handler is keyed by topic, since events are enqueued under a topic equal
/// to their event type.
#[derive(Clone)]
pub struct WebhookProvider {
    pub name: String,
    pub authenticator: Arc<dyn WebhookAuthenticator>,
    pub classifier: Arc<dyn WebhookClassifier>,
    pub handlers: Vec<Arc<dyn InboxHandler>>,
}

/// Routes a partition key to the inbox store that owns it (`spec.md` §4.7
/// step 5). Absent a match, ingestion falls back to the default inbox.
pub trait PartitionRouter: Send + Sync {
    fn route(&self, partition_key: &str) -> Option<Arc<dyn InboxStore>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted { duplicate: bool },
    Ignored,
    Rejected,
    UnknownProvider,
    Unauthenticated,
}

const DEFAULT_TOPIC: &str = "webhook";

pub struct WebhookIngestor {
    providers: HashMap<String, WebhookProvider>,
    default_inbox: Arc<dyn InboxStore>,
    partition_router: Option<Arc<dyn PartitionRouter>>,
    config: WebhookConfig,
}

impl WebhookIngestor {
    pub fn new(default_inbox: Arc<dyn InboxStore>, config: WebhookConfig) -> Self {
        Self {
            providers: HashMap::new(),
            default_inbox,
            partition_router: None,
            config,
        }
    }

    pub fn with_partition_router(mut self, router: Arc<dyn PartitionRouter>) -> Self {
        self.partition_router = Some(router);
        self
    }

    pub fn register_provider(&mut self, provider: WebhookProvider) {
        self.providers.insert(provider.name.clone(), provider);
    }

    /// Names of every registered provider, so a composition root can spawn
    /// one processing loop (`build_processor`) per provider without
    /// otherwise reaching into this ingestor's internals.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn provider(&self, name: &str) -> Option<WebhookProvider> {
        self.providers.get(name).cloned()
    }

    /// Runs `spec.md` §4.7 ingestion steps 1-7 for one envelope.
    pub async fn ingest(
        &self,
        provider_name: &str,
        envelope: RawEnvelope,
        cancel: CancellationToken,
    ) -> IngestOutcome {
        let Some(provider) = self.providers.get(provider_name) else {
            return IngestOutcome::UnknownProvider;
        };

        if !provider.authenticator.authenticate(&envelope).await {
            if self.config.store_rejected {
                self.store_rejected(provider_name, &envelope, None, cancel.clone()).await;
            }
            return IngestOutcome::Unauthenticated;
        }

        let classified = provider.classifier.classify(&envelope).await;
        match classified.disposition {
            EnvelopeDisposition::Ignored => return IngestOutcome::Ignored,
            EnvelopeDisposition::Rejected => {
                if self.config.store_rejected {
                    self.store_rejected(provider_name, &envelope, Some(&classified), cancel.clone())
                        .await;
                }
                return IngestOutcome::Rejected;
            }
            EnvelopeDisposition::Accepted => {}
        }

        let dedupe_key = resolve_dedupe_key(provider_name, &envelope, &classified);
        let inbox = classified
            .partition_key
            .as_deref()
            .and_then(|k| self.partition_router.as_ref().and_then(|r| r.route(k)))
            .unwrap_or_else(|| self.default_inbox.clone());

        let message_id = MessageId::from(dedupe_key.clone());
        // `already_processed` upserts dedupe bookkeeping but only reports
        // Done (`spec.md` §4.1); the ingest edge's notion of "duplicate"
        // (§4.7 step 6, S6) is broader — a resubmission that arrives while
        // the first delivery is still Seen/Processing is a duplicate too.
        // `get` runs first so it observes whether the row existed *before*
        // this call's upsert.
        let seen_before = inbox.get(&message_id, cancel.clone()).await.is_ok();
        let already_done = match inbox
            .already_processed(&message_id, provider_name, None, cancel.clone())
            .await
        {
            Ok(already) => already,
            Err(err) => {
                debug!(provider = provider_name, error = %err, "already_processed check failed");
                false
            }
        };
        if seen_before || already_done {
            msgcore_metrics::record_duplicate(&event_topic(&classified), provider_name);
            return IngestOutcome::Accepted { duplicate: true };
        }

        let record = WebhookEventRecord {
            provider: provider_name.to_string(),
            dedupe_key: dedupe_key.clone(),
            status: WebhookRecordStatus::Pending,
            attempt_count: 0,
            body: body_as_string(&envelope.body, false),
            headers: envelope.headers.clone(),
            partition_key: classified.partition_key.clone(),
        };

        let topic = event_topic(&classified);
        let payload = serde_json::to_value(&record).unwrap_or(serde_json::Value::Null);
        let hash = Some(hex::encode(Sha256::digest(&envelope.body)));
        if let Err(err) = inbox
            .enqueue(&topic, provider_name, &message_id, payload, hash.as_deref(), None, cancel)
            .await
        {
            debug!(provider = provider_name, error = %err, "webhook enqueue failed");
        }

        IngestOutcome::Accepted { duplicate: false }
    }

    async fn store_rejected(
        &self,
        provider_name: &str,
        envelope: &RawEnvelope,
        classified: Option<&ClassifiedEnvelope>,
        cancel: CancellationToken,
    ) {
        let dedupe_key = format!(
            "{provider_name}:rejected:{}",
            hex::encode(Sha256::digest(&envelope.body))
        );
        let message_id = MessageId::from(dedupe_key.clone());
        let record = WebhookEventRecord {
            provider: provider_name.to_string(),
            dedupe_key,
            status: WebhookRecordStatus::Rejected,
            attempt_count: 0,
            body: body_as_string(&envelope.body, self.config.redact_rejected_body),
            headers: envelope.headers.clone(),
            partition_key: classified.and_then(|c| c.partition_key.clone()),
        };
        let payload = serde_json::to_value(&record).unwrap_or(serde_json::Value::Null);
        if let Err(err) = self
            .default_inbox
            .enqueue("webhook.rejected", provider_name, &message_id, payload, None, None, cancel.clone())
            .await
        {
            debug!(provider = provider_name, error = %err, "failed to store rejected envelope");
            return;
        }
        let _ = self.default_inbox.mark_dead(&message_id, "rejected", cancel).await;
    }
}

fn event_topic(classified: &ClassifiedEnvelope) -> String {
    if classified.event_type.is_empty() {
        DEFAULT_TOPIC.to_string()
    } else {
        classified.event_type.clone()
    }
}

/// `spec.md` §4.7 step 4: classifier output, else `provider:providerEventId`,
/// else `provider:sha256:<hex of body>`.
fn resolve_dedupe_key(provider_name: &str, envelope: &RawEnvelope, classified: &ClassifiedEnvelope) -> String {
    if let Some(key) = &classified.dedupe_key {
        return key.clone();
    }
    if let Some(event_id) = &classified.provider_event_id {
        return format!("{provider_name}:{event_id}");
    }
    format!("{provider_name}:sha256:{}", hex::encode(Sha256::digest(&envelope.body)))
}

fn body_as_string(body: &[u8], redact: bool) -> String {
    if redact {
        format!("<redacted {} bytes>", body.len())
    } else {
        String::from_utf8_lossy(body).into_owned()
    }
}

/// Builds the inbox dispatcher that processes stored `WebhookEventRecord`s
/// for one provider (`spec.md` §4.7 processing pipeline): same topic-keyed
/// claim/ack/abandon/fail loop as any other inbox traffic, with the
/// provider's handlers registered by event type.
pub fn build_processor(
    inbox: Arc<dyn InboxStore>,
    lease_manager: Arc<msgcore_lease::LeaseManager>,
    tenant: impl Into<String>,
    provider: &WebhookProvider,
    config: &WebhookConfig,
) -> InboxDispatcher {
    let mut dispatcher_config = InboxDispatcherConfig::new(tenant);
    dispatcher_config.batch_size = config.batch_size;
    dispatcher_config.lease_seconds = config.lease_seconds;
    dispatcher_config.max_attempts = config.max_attempts;
    dispatcher_config.base_backoff = chrono::Duration::from_std(config.base_backoff).unwrap_or(chrono::Duration::seconds(1));
    dispatcher_config.max_backoff = chrono::Duration::from_std(config.max_backoff).unwrap_or(chrono::Duration::seconds(300));
    dispatcher_config.missing_handler_behavior = config.missing_handler_behavior;

    let mut dispatcher = InboxDispatcher::new(inbox, lease_manager, dispatcher_config);
    for handler in &provider.handlers {
        dispatcher.register(handler.clone());
    }
    dispatcher
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgcore_inbox::InboxMessage;
    use msgcore_lease::{LeaseManager, LeaseManagerConfig};
    use msgcore_memstore::{MemInboxStore, MemLeaseStore};
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    struct AlwaysAuth;
    #[async_trait]
    impl WebhookAuthenticator for AlwaysAuth {
        async fn authenticate(&self, _envelope: &RawEnvelope) -> bool {
            true
        }
    }

    struct RejectAuth;
    #[async_trait]
    impl WebhookAuthenticator for RejectAuth {
        async fn authenticate(&self, _envelope: &RawEnvelope) -> bool {
            false
        }
    }

    struct BounceClassifier;
    #[async_trait]
    impl WebhookClassifier for BounceClassifier {
        async fn classify(&self, _envelope: &RawEnvelope) -> ClassifiedEnvelope {
            ClassifiedEnvelope {
                disposition: EnvelopeDisposition::Accepted,
                event_type: "Bounce".to_string(),
                provider_event_id: Some("42".to_string()),
                dedupe_key: None,
                partition_key: None,
                summary: serde_json::json!({}),
            }
        }
    }

    struct BounceHandler {
        calls: Arc<Mutex<u32>>,
    }
    #[async_trait]
    impl InboxHandler for BounceHandler {
        fn topic(&self) -> &str {
            "Bounce"
        }
        async fn handle(&self, _message: InboxMessage) -> Result<(), String> {
            *self.calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn envelope(body: &str) -> RawEnvelope {
        RawEnvelope {
            headers: serde_json::json!({}),
            body: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn s6_webhook_bounce_dedupes_and_processes_exactly_once() {
        let inbox = Arc::new(MemInboxStore::new());
        let mut ingestor = WebhookIngestor::new(inbox.clone(), WebhookConfig::default());
        ingestor.register_provider(WebhookProvider {
            name: "stripe".to_string(),
            authenticator: Arc::new(AlwaysAuth),
            classifier: Arc::new(BounceClassifier),
            handlers: Vec::new(),
        });

        let first = ingestor.ingest("stripe", envelope("body-1"), CancellationToken::new()).await;
        assert_eq!(first, IngestOutcome::Accepted { duplicate: false });

        let second = ingestor.ingest("stripe", envelope("body-1"), CancellationToken::new()).await;
        assert_eq!(second, IngestOutcome::Accepted { duplicate: true });

        let calls = Arc::new(Mutex::new(0));
        let lease_manager = Arc::new(LeaseManager::new(Arc::new(MemLeaseStore::new()), LeaseManagerConfig::default()));
        let provider = WebhookProvider {
            name: "stripe".to_string(),
            authenticator: Arc::new(AlwaysAuth),
            classifier: Arc::new(BounceClassifier),
            handlers: vec![Arc::new(BounceHandler { calls: calls.clone() })],
        };
        let dispatcher = build_processor(inbox, lease_manager, "tenant-a", &provider, &WebhookConfig::default());

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move { dispatcher.run(shutdown_clone).await });
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn unauthenticated_envelope_is_rejected_and_optionally_stored() {
        let inbox = Arc::new(MemInboxStore::new());
        let mut ingestor = WebhookIngestor::new(inbox.clone(), WebhookConfig::default());
        ingestor.register_provider(WebhookProvider {
            name: "stripe".to_string(),
            authenticator: Arc::new(RejectAuth),
            classifier: Arc::new(BounceClassifier),
            handlers: Vec::new(),
        });

        let outcome = ingestor.ingest("stripe", envelope("body-x"), CancellationToken::new()).await;
        assert_eq!(outcome, IngestOutcome::Unauthenticated);
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected_outright() {
        let inbox = Arc::new(MemInboxStore::new());
        let ingestor = WebhookIngestor::new(inbox, WebhookConfig::default());
        let outcome = ingestor.ingest("unknown", envelope("x"), CancellationToken::new()).await;
        assert_eq!(outcome, IngestOutcome::UnknownProvider);
    }
}
