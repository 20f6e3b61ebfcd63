//! Background loops spawned once at startup: the outbox and inbox
//! dispatchers, the scheduler's materialiser and dispatcher, and one
//! webhook processor per registered provider. Each is a thin
//! `tokio::spawn` around the loop the owning crate already defines
//! (`spec.md` §4.3-§4.7); this module only wires store + lease manager +
//! config into each and gates every loop on schema deployment completing
//! first (`spec.md` §9 "async void" redesign note: workers must not start
//! against an undeployed schema).

use std::sync::Arc;

use msgcore_outbox::{OutboxDispatcher, OutboxDispatcherConfig};
use msgcore_scheduler::{Dispatcher as SchedulerDispatcher, DispatcherConfig as SchedulerDispatcherConfig, Materialiser, MaterialiserConfig};
use msgcore_webhook::build_processor;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::state::AppState;

/// Spawns every enabled background loop and returns immediately; loops run
/// until `shutdown` fires.
pub fn spawn_workers(state: Arc<AppState>, shutdown: CancellationToken) {
    // Outbox and inbox dispatchers have no "disabled" flag of their own in
    // `spec.md` §6; only the scheduler does.
    spawn_gated(state.clone(), shutdown.clone(), |state, cancel| async move {
        let mut dispatcher_config = OutboxDispatcherConfig::new(state.tenant.clone());
        dispatcher_config.lease_seconds = state.outbox_config.lease_seconds;
        dispatcher_config.batch_size = state.outbox_config.batch_size;
        dispatcher_config.max_attempts = state.outbox_config.max_attempts;
        dispatcher_config.base_backoff = chrono::Duration::from_std(state.outbox_config.base_backoff).unwrap_or(chrono::Duration::seconds(1));
        dispatcher_config.max_backoff = chrono::Duration::from_std(state.outbox_config.max_backoff).unwrap_or(chrono::Duration::seconds(300));
        let dispatcher = OutboxDispatcher::new(state.outbox.clone(), state.lease_manager.clone(), dispatcher_config);
        info!(tenant = %state.tenant, "starting outbox dispatcher");
        dispatcher.run(cancel).await;
    });

    spawn_gated(state.clone(), shutdown.clone(), |state, cancel| async move {
        let mut dispatcher_config = msgcore_inbox::InboxDispatcherConfig::new(state.tenant.clone());
        dispatcher_config.lease_seconds = state.inbox_config.lease_seconds;
        dispatcher_config.batch_size = state.inbox_config.batch_size;
        dispatcher_config.max_attempts = state.inbox_config.max_attempts;
        dispatcher_config.base_backoff = chrono::Duration::from_std(state.inbox_config.base_backoff).unwrap_or(chrono::Duration::seconds(1));
        dispatcher_config.max_backoff = chrono::Duration::from_std(state.inbox_config.max_backoff).unwrap_or(chrono::Duration::seconds(300));
        let dispatcher = msgcore_inbox::InboxDispatcher::new(state.inbox.clone(), state.lease_manager.clone(), dispatcher_config);
        info!(tenant = %state.tenant, "starting inbox dispatcher");
        dispatcher.run(cancel).await;
    });

    if state.scheduler_config.enable_scheduler_workers {
        spawn_gated(state.clone(), shutdown.clone(), |state, cancel| async move {
            let config = MaterialiserConfig::new(state.tenant.clone());
            let materialiser = Materialiser::new(state.scheduler.clone(), state.lease_manager.clone(), config);
            info!(tenant = %state.tenant, "starting scheduler materialiser");
            materialiser.run(cancel).await;
        });

        spawn_gated(state.clone(), shutdown.clone(), |state, cancel| async move {
            let mut config = SchedulerDispatcherConfig::new(state.tenant.clone());
            config.lease_seconds = state.scheduler_config.dispatch_lease_seconds;
            config.batch_size = state.scheduler_config.dispatch_batch_size;
            let dispatcher = SchedulerDispatcher::new(state.scheduler.clone(), state.outbox.clone(), state.lease_manager.clone(), config);
            info!(tenant = %state.tenant, "starting scheduler dispatcher");
            dispatcher.run(cancel).await;
        });
    }

    for provider in state.webhook.provider_names() {
        let state = state.clone();
        let shutdown = shutdown.clone();
        spawn_gated(state.clone(), shutdown, move |state, cancel| async move {
            let Some(provider) = state.webhook.provider(&provider) else {
                return;
            };
            let dispatcher = build_processor(
                state.inbox.clone(),
                state.lease_manager.clone(),
                state.tenant.clone(),
                &provider,
                &state.webhook_config,
            );
            info!(tenant = %state.tenant, provider = %provider.name, "starting webhook processor");
            dispatcher.run(cancel).await;
        });
    }
}

/// Spawns `body` as a background task that first waits for schema
/// deployment to complete, then runs until `shutdown` fires.
fn spawn_gated<F, Fut>(state: Arc<AppState>, shutdown: CancellationToken, body: F)
where
    F: FnOnce(Arc<AppState>, CancellationToken) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        state.schema_signal.wait_until_complete().await;
        body(state, shutdown).await;
    });
}
