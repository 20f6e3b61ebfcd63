//! In-memory reference implementation of `SchedulerStore`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use msgcore_store::{CronSchedule, JobRow, JobRunRow, SchedulerStore, TimerRow};
use msgcore_types::{Applied, FencingToken, OwnerToken, SchedulerItemStatus, StoreError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct State {
    timers: Vec<TimerRow>,
    next_timer_id: i64,
    jobs: HashMap<String, JobRow>,
    runs: Vec<JobRunRow>,
    next_run_id: i64,
    /// Last fencing token accepted by `create_job_runs_from_due_jobs`, used
    /// to refuse stale-epoch materialiser calls (`spec.md` §5 fencing
    /// monotonicity).
    last_materialise_fencing: FencingToken,
    /// `(jobName, nextDueUtc)` pairs already materialised, so at most one
    /// Ready run is ever created per pair even across repeated calls.
    materialised_pairs: std::collections::HashSet<(String, DateTime<Utc>)>,
}

/// In-memory `SchedulerStore`. Single-process only.
pub struct MemSchedulerStore {
    state: Mutex<State>,
    cron: Arc<dyn CronSchedule>,
}

impl MemSchedulerStore {
    pub fn new(cron: Arc<dyn CronSchedule>) -> Self {
        Self {
            state: Mutex::new(State {
                next_timer_id: 1,
                next_run_id: 1,
                ..Default::default()
            }),
            cron,
        }
    }
}

#[async_trait]
impl SchedulerStore for MemSchedulerStore {
    async fn schedule_timer(
        &self,
        topic: &str,
        payload: Value,
        due_time_utc: DateTime<Utc>,
        _cancel: CancellationToken,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.next_timer_id;
        state.next_timer_id += 1;
        state.timers.push(TimerRow {
            timer_id: id,
            topic: topic.to_string(),
            payload,
            due_time_utc,
            status: SchedulerItemStatus::Ready,
            owner_token: None,
            locked_until: None,
        });
        Ok(id)
    }

    async fn claim_timers(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        limit: i64,
        _cancel: CancellationToken,
    ) -> Result<Vec<TimerRow>, StoreError> {
        if limit <= 0 {
            return Err(StoreError::invalid_argument("batchSize must be > 0"));
        }
        let now = Utc::now();
        let lock_until = now + Duration::seconds(lease_seconds.max(1));
        let mut state = self.state.lock().await;

        let mut idxs: Vec<usize> = state
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                let claimable = match t.status {
                    SchedulerItemStatus::Ready => true,
                    SchedulerItemStatus::Claimed => {
                        t.locked_until.map(|l| l <= now).unwrap_or(false)
                    }
                    _ => false,
                };
                claimable && t.due_time_utc <= now
            })
            .map(|(i, _)| i)
            .collect();
        idxs.sort_by_key(|&i| (state.timers[i].due_time_utc, state.timers[i].timer_id));

        let mut out = Vec::new();
        for i in idxs.into_iter().take(limit as usize) {
            let t = &mut state.timers[i];
            t.status = SchedulerItemStatus::Claimed;
            t.owner_token = Some(owner);
            t.locked_until = Some(lock_until);
            out.push(t.clone());
        }
        Ok(out)
    }

    async fn ack_timers(
        &self,
        timer_ids: &[i64],
        owner: OwnerToken,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for t in state.timers.iter_mut() {
            if timer_ids.contains(&t.timer_id)
                && t.status == SchedulerItemStatus::Claimed
                && t.owner_token == Some(owner)
            {
                t.status = SchedulerItemStatus::Done;
                t.owner_token = None;
                t.locked_until = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn abandon_timers(
        &self,
        timer_ids: &[i64],
        owner: OwnerToken,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for t in state.timers.iter_mut() {
            if timer_ids.contains(&t.timer_id)
                && t.status == SchedulerItemStatus::Claimed
                && t.owner_token == Some(owner)
            {
                t.status = SchedulerItemStatus::Ready;
                t.owner_token = None;
                t.locked_until = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn reap_expired_timers(&self, _cancel: CancellationToken) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut count = 0;
        for t in state.timers.iter_mut() {
            if t.status == SchedulerItemStatus::Claimed
                && t.locked_until.map(|l| l <= now).unwrap_or(false)
            {
                t.status = SchedulerItemStatus::Ready;
                t.owner_token = None;
                t.locked_until = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_next_event_time(
        &self,
        _cancel: CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        let timer_next = state
            .timers
            .iter()
            .filter(|t| t.status == SchedulerItemStatus::Ready)
            .map(|t| t.due_time_utc)
            .min();
        let run_next = state
            .runs
            .iter()
            .filter(|r| r.status == SchedulerItemStatus::Ready)
            .map(|r| r.due_time_utc)
            .min();
        Ok(match (timer_next, run_next) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        })
    }

    async fn create_or_update_job(
        &self,
        name: &str,
        topic: &str,
        cron_spec: &str,
        payload: Value,
        next_due_utc: DateTime<Utc>,
        _cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.jobs.insert(
            name.to_string(),
            JobRow {
                job_name: name.to_string(),
                topic: topic.to_string(),
                cron_spec: cron_spec.to_string(),
                payload,
                next_due_utc,
            },
        );
        Ok(())
    }

    async fn trigger_job(&self, name: &str, _cancel: CancellationToken) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("job {name} not found")))?;
        let id = state.next_run_id;
        state.next_run_id += 1;
        state.runs.push(JobRunRow {
            run_id: id,
            job_name: job.job_name,
            topic: job.topic,
            payload: job.payload,
            due_time_utc: Utc::now(),
            status: SchedulerItemStatus::Ready,
        });
        Ok(id)
    }

    async fn delete_job(&self, name: &str, _cancel: CancellationToken) -> Result<Applied, StoreError> {
        let mut state = self.state.lock().await;
        let existed = state.jobs.remove(name).is_some();
        state
            .runs
            .retain(|r| !(r.job_name == name && r.status == SchedulerItemStatus::Ready));
        Ok(existed.into())
    }

    async fn get_job(&self, name: &str, _cancel: CancellationToken) -> Result<JobRow, StoreError> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("job {name} not found")))
    }

    async fn create_job_runs_from_due_jobs(
        &self,
        fencing_token: FencingToken,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        if fencing_token < state.last_materialise_fencing {
            return Err(StoreError::LostLease {
                resource: "scheduler:materialise".to_string(),
            });
        }
        state.last_materialise_fencing = fencing_token;

        let now = Utc::now();
        let due_names: Vec<String> = state
            .jobs
            .values()
            .filter(|j| j.next_due_utc <= now)
            .map(|j| j.job_name.clone())
            .collect();

        let mut created = 0u64;
        for name in due_names {
            let job = state.jobs.get(&name).cloned().unwrap();
            let pair = (job.job_name.clone(), job.next_due_utc);
            if !state.materialised_pairs.contains(&pair) {
                state.materialised_pairs.insert(pair);
                let id = state.next_run_id;
                state.next_run_id += 1;
                state.runs.push(JobRunRow {
                    run_id: id,
                    job_name: job.job_name.clone(),
                    topic: job.topic.clone(),
                    payload: job.payload.clone(),
                    due_time_utc: job.next_due_utc,
                    status: SchedulerItemStatus::Ready,
                });
                created += 1;
            }
            let next = self.cron.next(&job.cron_spec, job.next_due_utc)?;
            if let Some(j) = state.jobs.get_mut(&name) {
                j.next_due_utc = next;
            }
        }
        Ok(created)
    }

    async fn claim_job_runs(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        limit: i64,
        _cancel: CancellationToken,
    ) -> Result<Vec<JobRunRow>, StoreError> {
        if limit <= 0 {
            return Err(StoreError::invalid_argument("batchSize must be > 0"));
        }
        let now = Utc::now();
        let _lock_until = now + Duration::seconds(lease_seconds.max(1));
        let mut state = self.state.lock().await;

        let mut idxs: Vec<usize> = state
            .runs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == SchedulerItemStatus::Ready && r.due_time_utc <= now)
            .map(|(i, _)| i)
            .collect();
        idxs.sort_by_key(|&i| (state.runs[i].due_time_utc, state.runs[i].run_id));

        let mut out = Vec::new();
        for i in idxs.into_iter().take(limit as usize) {
            let r = &mut state.runs[i];
            r.status = SchedulerItemStatus::Claimed;
            out.push(r.clone());
        }
        let _ = owner;
        Ok(out)
    }

    async fn ack_job_runs(
        &self,
        run_ids: &[i64],
        _owner: OwnerToken,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for r in state.runs.iter_mut() {
            if run_ids.contains(&r.run_id) && r.status == SchedulerItemStatus::Claimed {
                r.status = SchedulerItemStatus::Done;
                count += 1;
            }
        }
        Ok(count)
    }
}

/// `CronSchedule` backed by the `cron` crate (`spec.md` §9 cron-library
/// redesign note: the materialiser depends only on the pure `next()`
/// contract, not on this specific crate).
pub struct CronCrateSchedule;

impl CronSchedule for CronCrateSchedule {
    fn next(&self, cron_spec: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
        use cron::Schedule;
        use std::str::FromStr;

        let schedule = Schedule::from_str(cron_spec)
            .map_err(|e| StoreError::invalid_argument(format!("invalid cron spec {cron_spec}: {e}")))?;
        schedule
            .after(&from)
            .next()
            .ok_or_else(|| StoreError::invalid_argument(format!("cron spec {cron_spec} has no future fire time")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgcore_types::OwnerToken;

    fn store() -> MemSchedulerStore {
        MemSchedulerStore::new(Arc::new(CronCrateSchedule))
    }

    #[tokio::test]
    async fn timer_claim_is_owner_scoped() {
        let s = store();
        let cancel = CancellationToken::new();
        let due = Utc::now() - Duration::seconds(1);
        s.schedule_timer("topic.a", serde_json::json!({}), due, cancel.clone())
            .await
            .unwrap();

        let owner_a = OwnerToken::generate();
        let claimed = s.claim_timers(owner_a, 30, 10, cancel.clone()).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let owner_b = OwnerToken::generate();
        let again = s.claim_timers(owner_b, 30, 10, cancel.clone()).await.unwrap();
        assert!(again.is_empty());

        let acked = s
            .ack_timers(&[claimed[0].timer_id], owner_b, cancel.clone())
            .await
            .unwrap();
        assert_eq!(acked, 0);

        let acked = s.ack_timers(&[claimed[0].timer_id], owner_a, cancel).await.unwrap();
        assert_eq!(acked, 1);
    }

    #[tokio::test]
    async fn materialise_is_idempotent_per_fencing_epoch() {
        let s = store();
        let cancel = CancellationToken::new();
        let due = Utc::now() - Duration::seconds(1);
        s.create_or_update_job("nightly", "jobs.nightly", "0 0 0 * * *", serde_json::json!({}), due, cancel.clone())
            .await
            .unwrap();

        let token = FencingToken::ZERO.next();
        let created = s
            .create_job_runs_from_due_jobs(token, cancel.clone())
            .await
            .unwrap();
        assert_eq!(created, 1);

        // Same epoch again: job's next_due_utc has advanced, so nothing new.
        let created_again = s
            .create_job_runs_from_due_jobs(token, cancel.clone())
            .await
            .unwrap();
        assert_eq!(created_again, 0);

        // Stale (lower) epoch is refused outright.
        let err = s
            .create_job_runs_from_due_jobs(FencingToken::ZERO, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LostLease { .. }));
    }

    #[tokio::test]
    async fn trigger_job_requires_existing_job() {
        let s = store();
        let cancel = CancellationToken::new();
        let err = s.trigger_job("missing", cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
