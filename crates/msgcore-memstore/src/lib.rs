//! Single-process, in-memory reference implementation of every store
//! contract in `msgcore-store` (`spec.md` §1: "the one in-memory reference
//! implementation used for testing").
//!
//! Nothing here is durable or shared across processes; use `msgcore-postgres`
//! for that. These types exist so the dispatcher, lease manager, scheduler,
//! and webhook pipeline crates can each be exercised with fast, deterministic
//! tests that don't require a database.

mod idempotency;
mod inbox;
mod lease;
mod outbox;
mod scheduler;
mod tx;

pub use idempotency::MemIdempotencyStore;
pub use inbox::MemInboxStore;
pub use lease::MemLeaseStore;
pub use outbox::MemOutboxStore;
pub use scheduler::{CronCrateSchedule, MemSchedulerStore};
pub use tx::MemTransactionalStore;
