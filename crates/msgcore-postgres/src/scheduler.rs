//! Postgres `SchedulerStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msgcore_store::{CronSchedule, JobRow, JobRunRow, SchedulerStore, TimerRow};
use msgcore_types::{Applied, FencingToken, OwnerToken, SchedulerItemStatus, StoreError};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{owner_to_uuid, transient, uuid_to_owner};

pub struct PgSchedulerStore {
    pool: PgPool,
    cron: Arc<dyn CronSchedule>,
}

impl PgSchedulerStore {
    pub fn new(pool: PgPool, cron: Arc<dyn CronSchedule>) -> Self {
        Self { pool, cron }
    }
}

fn row_to_timer(row: sqlx::postgres::PgRow) -> Result<TimerRow, StoreError> {
    Ok(TimerRow {
        timer_id: row.try_get("timer_id").map_err(transient)?,
        topic: row.try_get("topic").map_err(transient)?,
        payload: row.try_get("payload").map_err(transient)?,
        due_time_utc: row.try_get("due_time_utc").map_err(transient)?,
        status: SchedulerItemStatus::parse(&row.try_get::<String, _>("status").map_err(transient)?)?,
        owner_token: row
            .try_get::<Option<uuid::Uuid>, _>("owner_token")
            .map_err(transient)?
            .map(uuid_to_owner),
        locked_until: row.try_get("locked_until").map_err(transient)?,
    })
}

fn row_to_job_run(row: sqlx::postgres::PgRow) -> Result<JobRunRow, StoreError> {
    Ok(JobRunRow {
        run_id: row.try_get("run_id").map_err(transient)?,
        job_name: row.try_get("job_name").map_err(transient)?,
        topic: row.try_get("topic").map_err(transient)?,
        payload: row.try_get("payload").map_err(transient)?,
        due_time_utc: row.try_get("due_time_utc").map_err(transient)?,
        status: SchedulerItemStatus::parse(&row.try_get::<String, _>("status").map_err(transient)?)?,
    })
}

#[async_trait]
impl SchedulerStore for PgSchedulerStore {
    async fn schedule_timer(
        &self,
        topic: &str,
        payload: Value,
        due_time_utc: DateTime<Utc>,
        _cancel: CancellationToken,
    ) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            insert into infra.scheduler_timers (topic, payload, due_time_utc, status)
            values ($1, $2, $3, 'READY')
            returning timer_id
            "#,
        )
        .bind(topic)
        .bind(payload)
        .bind(due_time_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.0)
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
        let rows = sqlx::query(
            r#"
            with to_claim as (
                select timer_id
                from infra.scheduler_timers
                where due_time_utc <= now()
                  and ((status = 'READY') or (status = 'CLAIMED' and locked_until <= now()))
                order by due_time_utc, timer_id
                limit $1
                for update skip locked
            )
            update infra.scheduler_timers
               set status = 'CLAIMED', owner_token = $2, locked_until = now() + make_interval(secs => $3)
             where timer_id in (select timer_id from to_claim)
            returning timer_id, topic, payload, due_time_utc, status, owner_token, locked_until
            "#,
        )
        .bind(limit)
        .bind(owner_to_uuid(owner))
        .bind(lease_seconds.max(1) as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;
        rows.into_iter().map(row_to_timer).collect()
    }

    async fn ack_timers(
        &self,
        timer_ids: &[i64],
        owner: OwnerToken,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            update infra.scheduler_timers
               set status = 'DONE', owner_token = null, locked_until = null
             where timer_id = any($1) and status = 'CLAIMED' and owner_token = $2
            "#,
        )
        .bind(timer_ids)
        .bind(owner_to_uuid(owner))
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(result.rows_affected())
    }

    async fn abandon_timers(
        &self,
        timer_ids: &[i64],
        owner: OwnerToken,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            update infra.scheduler_timers
               set status = 'READY', owner_token = null, locked_until = null
             where timer_id = any($1) and status = 'CLAIMED' and owner_token = $2
            "#,
        )
        .bind(timer_ids)
        .bind(owner_to_uuid(owner))
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(result.rows_affected())
    }

    async fn reap_expired_timers(&self, _cancel: CancellationToken) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            update infra.scheduler_timers
               set status = 'READY', owner_token = null, locked_until = null
             where status = 'CLAIMED' and locked_until <= now()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(result.rows_affected())
    }

    async fn get_next_event_time(
        &self,
        _cancel: CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
            r#"
            select min(t) from (
                select min(due_time_utc) as t from infra.scheduler_timers where status = 'READY'
                union all
                select min(due_time_utc) as t from infra.scheduler_job_runs where status = 'READY'
            ) as combined
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.0)
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
        sqlx::query(
            r#"
            insert into infra.scheduler_jobs (job_name, topic, cron_spec, payload, next_due_utc)
            values ($1, $2, $3, $4, $5)
            on conflict (job_name) do update
                set topic = excluded.topic,
                    cron_spec = excluded.cron_spec,
                    payload = excluded.payload,
                    next_due_utc = excluded.next_due_utc
            "#,
        )
        .bind(name)
        .bind(topic)
        .bind(cron_spec)
        .bind(payload)
        .bind(next_due_utc)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn trigger_job(&self, name: &str, _cancel: CancellationToken) -> Result<i64, StoreError> {
        let job: Option<(String, String, Value)> =
            sqlx::query_as("select job_name, topic, payload from infra.scheduler_jobs where job_name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(transient)?;
        let (job_name, topic, payload) =
            job.ok_or_else(|| StoreError::not_found(format!("job {name} not found")))?;

        let row: (i64,) = sqlx::query_as(
            r#"
            insert into infra.scheduler_job_runs (job_name, topic, payload, due_time_utc, status)
            values ($1, $2, $3, now(), 'READY')
            returning run_id
            "#,
        )
        .bind(job_name)
        .bind(topic)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.0)
    }

    async fn delete_job(&self, name: &str, _cancel: CancellationToken) -> Result<Applied, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "delete from infra.scheduler_jobs where job_name = $1 returning job_name",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        // Cascades to scheduler_job_runs via the foreign key; pending Ready
        // runs for this job are removed along with it.
        sqlx::query("delete from infra.scheduler_job_runs where job_name = $1 and status = 'READY'")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        Ok(row.is_some().into())
    }

    async fn get_job(&self, name: &str, _cancel: CancellationToken) -> Result<JobRow, StoreError> {
        let row: Option<(String, String, String, Value, DateTime<Utc>)> = sqlx::query_as(
            "select job_name, topic, cron_spec, payload, next_due_utc from infra.scheduler_jobs where job_name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        let (job_name, topic, cron_spec, payload, next_due_utc) =
            row.ok_or_else(|| StoreError::not_found(format!("job {name} not found")))?;
        Ok(JobRow {
            job_name,
            topic,
            cron_spec,
            payload,
            next_due_utc,
        })
    }

    async fn create_job_runs_from_due_jobs(
        &self,
        fencing_token: FencingToken,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(transient)?;

        let fence: (i64,) = sqlx::query_as(
            "select fencing_token from infra.scheduler_materialise_fence where sentinel_id = 1 for update",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(transient)?;
        if fencing_token.0 < fence.0 {
            return Err(StoreError::LostLease {
                resource: "scheduler:materialise".to_string(),
            });
        }
        sqlx::query("update infra.scheduler_materialise_fence set fencing_token = $1 where sentinel_id = 1")
            .bind(fencing_token.0)
            .execute(&mut *tx)
            .await
            .map_err(transient)?;

        let due_jobs: Vec<(String, String, Value, String, DateTime<Utc>)> = sqlx::query_as(
            "select job_name, topic, payload, cron_spec, next_due_utc from infra.scheduler_jobs where next_due_utc <= now() for update",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(transient)?;

        let mut created = 0u64;
        for (job_name, topic, payload, cron_spec, next_due_utc) in due_jobs {
            let result = sqlx::query(
                r#"
                insert into infra.scheduler_job_runs (job_name, topic, payload, due_time_utc, status)
                values ($1, $2, $3, $4, 'READY')
                on conflict (job_name, due_time_utc) do nothing
                "#,
            )
            .bind(&job_name)
            .bind(&topic)
            .bind(&payload)
            .bind(next_due_utc)
            .execute(&mut *tx)
            .await
            .map_err(transient)?;
            created += result.rows_affected();

            let next = self.cron.next(&cron_spec, next_due_utc)?;
            sqlx::query("update infra.scheduler_jobs set next_due_utc = $2 where job_name = $1")
                .bind(&job_name)
                .bind(next)
                .execute(&mut *tx)
                .await
                .map_err(transient)?;
        }

        tx.commit().await.map_err(transient)?;
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
        // JobRunRow carries no owner/lease fields (`spec.md` §3): a run is
        // claimed once and acked or left for a future claim, unlike outbox
        // and inbox rows which need a reclaimable lock.
        let _ = (owner, lease_seconds);
        let rows = sqlx::query(
            r#"
            with to_claim as (
                select run_id
                from infra.scheduler_job_runs
                where status = 'READY' and due_time_utc <= now()
                order by due_time_utc, run_id
                limit $1
                for update skip locked
            )
            update infra.scheduler_job_runs
               set status = 'CLAIMED'
             where run_id in (select run_id from to_claim)
            returning run_id, job_name, topic, payload, due_time_utc, status
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;
        rows.into_iter().map(row_to_job_run).collect()
    }

    async fn ack_job_runs(
        &self,
        run_ids: &[i64],
        _owner: OwnerToken,
        _cancel: CancellationToken,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "update infra.scheduler_job_runs set status = 'DONE' where run_id = any($1) and status = 'CLAIMED'",
        )
        .bind(run_ids)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(result.rows_affected())
    }
}

/// `CronSchedule` backed by the `cron` crate, shared with `msgcore-memstore`.
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
