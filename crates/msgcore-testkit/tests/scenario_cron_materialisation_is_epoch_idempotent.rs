//! `spec.md` §8 property 7 ("cron materialisation") and property 5
//! ("fencing monotonicity"): a due cron job materialises at most one Ready
//! run per `(jobName, nextDueUtc)`, and a stale fencing epoch is refused.

use chrono::{Duration, Utc};
use msgcore_store::SchedulerStore;
use msgcore_testkit::build_in_memory_stack;
use msgcore_types::FencingToken;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn due_job_materialises_exactly_once_per_epoch_and_advances() {
    let stack = build_in_memory_stack();
    stack
        .scheduler
        .create_or_update_job(
            "nightly",
            "jobs.nightly",
            "0 0 0 * * *",
            serde_json::json!({}),
            Utc::now() - Duration::seconds(1),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let epoch_1 = FencingToken::ZERO.next();
    let created = stack
        .scheduler
        .create_job_runs_from_due_jobs(epoch_1, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(created, 1);

    // Re-running the same epoch is a no-op: the job's nextDueUtc already
    // advanced past "now" for a daily cron spec.
    let created_again = stack
        .scheduler
        .create_job_runs_from_due_jobs(epoch_1, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(created_again, 0);

    // A stale, lower epoch must be refused outright rather than silently
    // no-op: the caller's lease was superseded.
    let stale = stack
        .scheduler
        .create_job_runs_from_due_jobs(FencingToken::ZERO, CancellationToken::new())
        .await;
    assert!(stale.is_err());

    let job = stack.scheduler.get_job("nightly", CancellationToken::new()).await.unwrap();
    assert!(job.next_due_utc > Utc::now());
}
