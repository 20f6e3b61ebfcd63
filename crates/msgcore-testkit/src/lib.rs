//! Shared fixtures for the scenario tests under `tests/` in this crate and
//! any crate that wants a fully-wired in-memory stack without repeating
//! the wiring (`spec.md` §8 "testable properties" S1-S9). This crate's
//! only job is wiring fixtures for other crates' scenario tests; it is
//! never shipped in a production build.

use std::sync::Arc;

use msgcore_lease::{LeaseManager, LeaseManagerConfig};
use msgcore_memstore::{
    CronCrateSchedule, MemIdempotencyStore, MemInboxStore, MemLeaseStore, MemOutboxStore, MemSchedulerStore,
    MemTransactionalStore,
};
use msgcore_store::{IdempotencyStore, InboxStore, LeaseStore, OutboxStore, SchedulerStore, TransactionalOutboxIdempotency};

/// Every store a scenario test needs, already wired against the in-memory
/// reference implementations.
pub struct InMemoryStack {
    pub outbox: Arc<MemOutboxStore>,
    pub inbox: Arc<dyn InboxStore>,
    pub scheduler: Arc<dyn SchedulerStore>,
    pub idempotency: Arc<MemIdempotencyStore>,
    pub lease_store: Arc<dyn LeaseStore>,
    pub lease_manager: Arc<LeaseManager>,
    pub tx: Arc<dyn TransactionalOutboxIdempotency>,
}

pub fn build_in_memory_stack() -> InMemoryStack {
    build_in_memory_stack_with_lease_config(LeaseManagerConfig::default())
}

pub fn build_in_memory_stack_with_lease_config(lease_config: LeaseManagerConfig) -> InMemoryStack {
    let outbox = Arc::new(MemOutboxStore::new());
    let inbox: Arc<dyn InboxStore> = Arc::new(MemInboxStore::new());
    let scheduler: Arc<dyn SchedulerStore> = Arc::new(MemSchedulerStore::new(Arc::new(CronCrateSchedule)));
    let idempotency = Arc::new(MemIdempotencyStore::new());
    let lease_store: Arc<dyn LeaseStore> = Arc::new(MemLeaseStore::new());
    let lease_manager = Arc::new(LeaseManager::new(lease_store.clone(), lease_config));
    let tx: Arc<dyn TransactionalOutboxIdempotency> =
        Arc::new(MemTransactionalStore::new(outbox.clone(), idempotency.clone()));

    InMemoryStack {
        outbox,
        inbox,
        scheduler,
        idempotency,
        lease_store,
        lease_manager,
        tx,
    }
}

/// Owner token fixture distinct from any token `OwnerToken::generate()`
/// would plausibly produce, for tests asserting "a non-owner's mutation is
/// a no-op" (`spec.md` §8 property 1).
pub fn foreign_owner() -> msgcore_types::OwnerToken {
    msgcore_types::OwnerToken::generate()
}
