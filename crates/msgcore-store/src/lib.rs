//! Abstract, dialect-neutral store contracts for the messaging core
//! (`spec.md` §4.1). Every backend (Postgres, SQL Server, or the in-memory
//! reference implementation) realises these traits; the rest of the core
//! depends only on them.

pub mod idempotency;
pub mod inbox;
pub mod lease;
pub mod outbox;
pub mod scheduler;
pub mod tx;

pub use idempotency::{IdempotencyRow, IdempotencyStore};
pub use inbox::{InboxRow, InboxStore};
pub use lease::{LeaseGrant, LeaseRow, LeaseStore};
pub use outbox::{OutboxEnqueueRequest, OutboxRow, OutboxStore};
pub use scheduler::{CronSchedule, JobRow, JobRunRow, SchedulerStore, TimerRow};
pub use tx::TransactionalOutboxIdempotency;
