//! Scheduler (`spec.md` §4.5): a fenced materialiser that promotes due cron
//! jobs into Ready job-runs, and a timer/run dispatcher that claims due
//! timers and job-runs and republishes them through the outbox.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use msgcore_lease::LeaseManager;
use msgcore_store::{JobRunRow, OutboxStore, SchedulerStore, TimerRow};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct MaterialiserConfig {
    pub tenant: String,
    pub lease_seconds: i64,
    pub poll_interval: StdDuration,
}

impl MaterialiserConfig {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            lease_seconds: 30,
            poll_interval: StdDuration::from_secs(5),
        }
    }
}

/// Holds `scheduler:materialise:<tenant>` and periodically promotes due
/// cron jobs into Ready job-runs (`spec.md` §4.5).
pub struct Materialiser {
    store: Arc<dyn SchedulerStore>,
    lease_manager: Arc<LeaseManager>,
    config: MaterialiserConfig,
}

impl Materialiser {
    pub fn new(store: Arc<dyn SchedulerStore>, lease_manager: Arc<LeaseManager>, config: MaterialiserConfig) -> Self {
        Self { store, lease_manager, config }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let resource = format!("scheduler:materialise:{}", self.config.tenant);
        let lease = match self
            .lease_manager
            .acquire(&resource, self.config.lease_seconds, shutdown.clone())
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                info!(resource, "materialiser did not acquire lease, another worker holds it");
                return;
            }
            Err(err) => {
                warn!(resource, error = %err, "materialiser failed to acquire lease");
                return;
            }
        };

        let cancel = lease.cancellation_token();
        info!(tenant = %self.config.tenant, "materialiser started");

        while !cancel.is_cancelled() {
            match self
                .store
                .create_job_runs_from_due_jobs(lease.fencing_token(), cancel.clone())
                .await
            {
                Ok(created) if created > 0 => {
                    info!(tenant = %self.config.tenant, created, "materialised job runs");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(tenant = %self.config.tenant, error = %err, "materialise failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(tenant = %self.config.tenant, "materialiser stopping");
        lease.release().await;
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub tenant: String,
    pub lease_seconds: i64,
    pub batch_size: i64,
    pub idle_poll: StdDuration,
}

impl DispatcherConfig {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            lease_seconds: 30,
            batch_size: 50,
            idle_poll: StdDuration::from_secs(5),
        }
    }
}

/// Claims due timers and job-runs and republishes them through the outbox
/// with a synthetic topic equal to the row's own topic, then acks the
/// scheduler row (`spec.md` §4.5: "delivered through the same at-least-once
/// path as other outbox traffic").
pub struct Dispatcher {
    scheduler_store: Arc<dyn SchedulerStore>,
    outbox_store: Arc<dyn OutboxStore>,
    lease_manager: Arc<LeaseManager>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        scheduler_store: Arc<dyn SchedulerStore>,
        outbox_store: Arc<dyn OutboxStore>,
        lease_manager: Arc<LeaseManager>,
        config: DispatcherConfig,
    ) -> Self {
        Self { scheduler_store, outbox_store, lease_manager, config }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let resource = format!("scheduler:dispatch:{}", self.config.tenant);
        let lease = match self
            .lease_manager
            .acquire(&resource, self.config.lease_seconds, shutdown.clone())
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                info!(resource, "scheduler dispatcher did not acquire lease, another worker holds it");
                return;
            }
            Err(err) => {
                warn!(resource, error = %err, "scheduler dispatcher failed to acquire lease");
                return;
            }
        };

        let cancel = lease.cancellation_token();
        info!(tenant = %self.config.tenant, "scheduler dispatcher started");

        while !cancel.is_cancelled() {
            let owner = lease.owner();
            let timers = self
                .scheduler_store
                .claim_timers(owner, self.config.lease_seconds, self.config.batch_size, cancel.clone())
                .await;
            let runs = self
                .scheduler_store
                .claim_job_runs(owner, self.config.lease_seconds, self.config.batch_size, cancel.clone())
                .await;

            let mut did_work = false;
            match timers {
                Ok(rows) if !rows.is_empty() => {
                    did_work = true;
                    msgcore_metrics::record_claimed("scheduler-timers", &self.config.tenant, rows.len() as u64);
                    self.republish_timers(rows, owner, cancel.clone()).await;
                }
                Ok(_) => {}
                Err(err) => warn!(tenant = %self.config.tenant, error = %err, "claim_timers failed"),
            }

            match runs {
                Ok(rows) if !rows.is_empty() => {
                    did_work = true;
                    msgcore_metrics::record_claimed("scheduler-runs", &self.config.tenant, rows.len() as u64);
                    self.republish_job_runs(rows, owner, cancel.clone()).await;
                }
                Ok(_) => {}
                Err(err) => warn!(tenant = %self.config.tenant, error = %err, "claim_job_runs failed"),
            }

            if !did_work {
                self.idle_sleep(&cancel).await;
            }
        }

        info!(tenant = %self.config.tenant, "scheduler dispatcher stopping");
        lease.release().await;
    }

    async fn republish_timers(&self, rows: Vec<TimerRow>, owner: msgcore_types::OwnerToken, cancel: CancellationToken) {
        let mut acked_ids = Vec::new();
        for row in &rows {
            match self
                .outbox_store
                .enqueue(&row.topic, row.payload.clone(), None, None, cancel.clone())
                .await
            {
                Ok(_) => acked_ids.push(row.timer_id),
                Err(err) => warn!(timer_id = row.timer_id, error = %err, "timer republish failed, leaving claimed for reap"),
            }
        }
        if !acked_ids.is_empty() {
            if let Err(err) = self.scheduler_store.ack_timers(&acked_ids, owner, cancel).await {
                warn!(error = %err, "ack_timers failed");
            }
            msgcore_metrics::record_acknowledged("scheduler-timers", &self.config.tenant);
        }
    }

    async fn republish_job_runs(&self, rows: Vec<JobRunRow>, owner: msgcore_types::OwnerToken, cancel: CancellationToken) {
        let mut acked_ids = Vec::new();
        for row in &rows {
            match self
                .outbox_store
                .enqueue(&row.topic, row.payload.clone(), None, None, cancel.clone())
                .await
            {
                Ok(_) => acked_ids.push(row.run_id),
                Err(err) => warn!(run_id = row.run_id, error = %err, "job run republish failed, leaving claimed for reap"),
            }
        }
        if !acked_ids.is_empty() {
            if let Err(err) = self.scheduler_store.ack_job_runs(&acked_ids, owner, cancel).await {
                warn!(error = %err, "ack_job_runs failed");
            }
            msgcore_metrics::record_acknowledged("scheduler-runs", &self.config.tenant);
        }
    }

    async fn idle_sleep(&self, cancel: &CancellationToken) {
        let next_event = self
            .scheduler_store
            .get_next_event_time(cancel.clone())
            .await
            .ok()
            .flatten();
        let sleep_for = match next_event {
            None => self.config.idle_poll,
            Some(t) => {
                let until = t - chrono::Utc::now();
                until.to_std().unwrap_or(StdDuration::ZERO).max(self.config.idle_poll)
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

/// Exposed for callers that wire the `cron` crate into a `CronSchedule`
/// manually outside of `msgcore-memstore`/`msgcore-postgres`.
pub fn default_lease_renewal_grace() -> ChronoDuration {
    ChronoDuration::seconds(5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use msgcore_lease::LeaseManagerConfig;
    use msgcore_memstore::{CronCrateSchedule, MemLeaseStore, MemOutboxStore, MemSchedulerStore};

    fn lease_manager() -> Arc<LeaseManager> {
        Arc::new(LeaseManager::new(Arc::new(MemLeaseStore::new()), LeaseManagerConfig::default()))
    }

    #[tokio::test]
    async fn materialiser_promotes_due_job_into_a_ready_run_which_the_dispatcher_republishes() {
        let scheduler_store: Arc<dyn SchedulerStore> = Arc::new(MemSchedulerStore::new(Arc::new(CronCrateSchedule)));
        let outbox_store = Arc::new(MemOutboxStore::new());
        let lm = lease_manager();

        scheduler_store
            .create_or_update_job(
                "nightly",
                "jobs.nightly",
                "0 0 0 * * *",
                serde_json::json!({"kind": "nightly"}),
                Utc::now() - ChronoDuration::seconds(1),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let materialiser = Materialiser::new(scheduler_store.clone(), lm.clone(), MaterialiserConfig {
            poll_interval: StdDuration::from_millis(20),
            ..MaterialiserConfig::new("tenant-a")
        });
        let dispatcher = Dispatcher::new(
            scheduler_store.clone(),
            outbox_store.clone() as Arc<dyn OutboxStore>,
            lm,
            DispatcherConfig {
                idle_poll: StdDuration::from_millis(20),
                ..DispatcherConfig::new("tenant-a")
            },
        );

        let shutdown = CancellationToken::new();
        let s1 = shutdown.clone();
        let s2 = shutdown.clone();
        let mh = tokio::spawn(async move { materialiser.run(s1).await });
        let dh = tokio::spawn(async move { dispatcher.run(s2).await });

        tokio::time::sleep(StdDuration::from_millis(200)).await;
        shutdown.cancel();
        mh.await.unwrap();
        dh.await.unwrap();

        let claimed = outbox_store
            .claim_due(msgcore_types::OwnerToken::generate(), 30, 10, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].topic, "jobs.nightly");
        assert_eq!(claimed[0].payload, serde_json::json!({"kind": "nightly"}));
    }

    #[tokio::test]
    async fn dispatcher_republishes_a_scheduled_timer_through_the_outbox() {
        let scheduler_store: Arc<dyn SchedulerStore> = Arc::new(MemSchedulerStore::new(Arc::new(CronCrateSchedule)));
        let outbox_store = Arc::new(MemOutboxStore::new());
        let lm = lease_manager();

        scheduler_store
            .schedule_timer(
                "timers.reminder",
                serde_json::json!({"userId": "u1"}),
                Utc::now() - ChronoDuration::seconds(1),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(
            scheduler_store,
            outbox_store.clone() as Arc<dyn OutboxStore>,
            lm,
            DispatcherConfig {
                idle_poll: StdDuration::from_millis(20),
                ..DispatcherConfig::new("tenant-a")
            },
        );

        let shutdown = CancellationToken::new();
        let s1 = shutdown.clone();
        let dh = tokio::spawn(async move { dispatcher.run(s1).await });
        tokio::time::sleep(StdDuration::from_millis(150)).await;
        shutdown.cancel();
        dh.await.unwrap();

        let claimed = outbox_store
            .claim_due(msgcore_types::OwnerToken::generate(), 30, 10, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].topic, "timers.reminder");
    }
}
