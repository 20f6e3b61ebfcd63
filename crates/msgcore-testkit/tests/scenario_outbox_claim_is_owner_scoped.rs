//! `spec.md` §8 property 1: "Claim is a bijection with owner" — a claimed
//! row's owner-scoped mutations succeed only for the claiming owner; any
//! other owner's attempt is a silent no-op.

use msgcore_store::OutboxStore;
use msgcore_testkit::{build_in_memory_stack, foreign_owner};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn non_owner_mutation_is_a_no_op_never_an_error() {
    let stack = build_in_memory_stack();
    let id = stack
        .outbox
        .enqueue("o.t", serde_json::json!("p"), None, None, CancellationToken::new())
        .await
        .unwrap();

    let owner = msgcore_types::OwnerToken::generate();
    let claimed = stack
        .outbox
        .claim_due(owner, 30, 10, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);

    let intruder = foreign_owner();
    let applied = stack
        .outbox
        .mark_dispatched(id, intruder, CancellationToken::new())
        .await
        .unwrap();
    assert!(!applied.is_applied(), "a non-owner mark must be a no-op");

    // Row is still claimable by nobody (still owned by `owner`, not Ready),
    // and the true owner's ack applies cleanly.
    let applied = stack
        .outbox
        .mark_dispatched(id, owner, CancellationToken::new())
        .await
        .unwrap();
    assert!(applied.is_applied());
}

#[tokio::test]
async fn terminal_rows_are_never_reclaimed() {
    let stack = build_in_memory_stack();
    let id = stack
        .outbox
        .enqueue("o.t", serde_json::json!("p"), None, None, CancellationToken::new())
        .await
        .unwrap();
    let owner = msgcore_types::OwnerToken::generate();
    stack.outbox.claim_due(owner, 30, 10, CancellationToken::new()).await.unwrap();
    stack.outbox.mark_dispatched(id, owner, CancellationToken::new()).await.unwrap();

    for _ in 0..3 {
        let claimed = stack
            .outbox
            .claim_due(msgcore_types::OwnerToken::generate(), 30, 10, CancellationToken::new())
            .await
            .unwrap();
        assert!(claimed.is_empty(), "a Done row must never be reclaimed");
    }
}
