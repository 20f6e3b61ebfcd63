use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msgcore_types::{Applied, FencingToken, OwnerToken, SchedulerItemStatus, StoreError};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// `spec.md` §3 `TimerRow`.
#[derive(Debug, Clone)]
pub struct TimerRow {
    pub timer_id: i64,
    pub topic: String,
    pub payload: Value,
    pub due_time_utc: DateTime<Utc>,
    pub status: SchedulerItemStatus,
    pub owner_token: Option<OwnerToken>,
    pub locked_until: Option<DateTime<Utc>>,
}

/// `spec.md` §3 `JobRow`.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub job_name: String,
    pub topic: String,
    pub cron_spec: String,
    pub payload: Value,
    pub next_due_utc: DateTime<Utc>,
}

/// `spec.md` §3 `JobRunRow`.
#[derive(Debug, Clone)]
pub struct JobRunRow {
    pub run_id: i64,
    pub job_name: String,
    pub topic: String,
    pub payload: Value,
    pub due_time_utc: DateTime<Utc>,
    pub status: SchedulerItemStatus,
}

/// Abstract scheduler store contract (`spec.md` §4.1): timers, cron-defined
/// jobs, and materialised job-runs.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    // --- Timers -----------------------------------------------------------

    async fn schedule_timer(
        &self,
        topic: &str,
        payload: Value,
        due_time_utc: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Result<i64, StoreError>;

    async fn claim_timers(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        limit: i64,
        cancel: CancellationToken,
    ) -> Result<Vec<TimerRow>, StoreError>;

    async fn ack_timers(
        &self,
        timer_ids: &[i64],
        owner: OwnerToken,
        cancel: CancellationToken,
    ) -> Result<u64, StoreError>;

    async fn abandon_timers(
        &self,
        timer_ids: &[i64],
        owner: OwnerToken,
        cancel: CancellationToken,
    ) -> Result<u64, StoreError>;

    async fn reap_expired_timers(&self, cancel: CancellationToken) -> Result<u64, StoreError>;

    /// Earliest due time across Ready timers and job-runs; bounds the
    /// dispatcher's idle-poll sleep.
    async fn get_next_event_time(
        &self,
        cancel: CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    // --- Jobs ---------------------------------------------------------------

    async fn create_or_update_job(
        &self,
        name: &str,
        topic: &str,
        cron_spec: &str,
        payload: Value,
        next_due_utc: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError>;

    /// Create an immediately-due run for `name`. `NotFound` if the job does
    /// not exist.
    async fn trigger_job(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<i64, StoreError>;

    /// Remove the job and all of its pending runs.
    async fn delete_job(&self, name: &str, cancel: CancellationToken) -> Result<Applied, StoreError>;

    async fn get_job(&self, name: &str, cancel: CancellationToken) -> Result<JobRow, StoreError>;

    /// Materialise at most one Ready run per `(jobName, nextDueUtc)` for
    /// every job whose `next_due_utc <= now`, then advance `next_due_utc`.
    /// Requires a held lease (fenced by `fencing_token`) so the store can
    /// refuse to advance if the lease has been lost mid-operation.
    async fn create_job_runs_from_due_jobs(
        &self,
        fencing_token: FencingToken,
        cancel: CancellationToken,
    ) -> Result<u64, StoreError>;

    // --- Job runs -------------------------------------------------------

    async fn claim_job_runs(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        limit: i64,
        cancel: CancellationToken,
    ) -> Result<Vec<JobRunRow>, StoreError>;

    async fn ack_job_runs(
        &self,
        run_ids: &[i64],
        owner: OwnerToken,
        cancel: CancellationToken,
    ) -> Result<u64, StoreError>;
}

/// Pure cron contract used by the materialiser (`spec.md` §9 "Cron library
/// dependency" redesign note): the scheduler depends only on this function,
/// not on any particular cron-parsing library.
pub trait CronSchedule: Send + Sync {
    /// Next UTC fire time strictly after `from`, at seconds precision.
    fn next(&self, cron_spec: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError>;
}
