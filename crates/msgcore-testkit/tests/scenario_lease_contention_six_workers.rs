//! `spec.md` §8 property 4 / scenario S4: six workers race to acquire the
//! same resource within a short window; exactly one wins, and releasing it
//! frees the resource for the next acquirer.

use msgcore_testkit::build_in_memory_stack;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn exactly_one_of_six_concurrent_acquires_wins() {
    let stack = build_in_memory_stack();
    let lease_manager = stack.lease_manager.clone();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let lm = lease_manager.clone();
        handles.push(tokio::spawn(async move { lm.acquire("r", 5, CancellationToken::new()).await.unwrap() }));
    }

    let mut winners = Vec::new();
    for h in handles {
        if let Some(lease) = h.await.unwrap() {
            winners.push(lease);
        }
    }
    assert_eq!(winners.len(), 1, "exactly one of six concurrent acquires should succeed");

    let winner = winners.pop().unwrap();
    winner.release().await;

    let next = lease_manager.acquire("r", 5, CancellationToken::new()).await.unwrap();
    assert!(next.is_some(), "resource must be free again after release");
    next.unwrap().release().await;
}
