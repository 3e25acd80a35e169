//! Integration tests for submission backpressure.
//!
//! These tests validate that:
//! - A submission that would eat into the guaranteed reserve resolves
//!   immediately with an empty result instead of queueing.
//! - Capacity freed by dispatch lets later submissions through again.
//! - Submissions after shutdown are refused the same way.


use std::time::Duration;

use dispatch_lite::{ClusterConfig, FutureStatus};
use test_harness::{ready_cluster, wait_for_running, MockWorker};

/// 2 normal slots, 1 priority slot, 2 slots reserved for requeues.
fn tight_config() -> ClusterConfig {
    ClusterConfig::default()
        .with_poll_interval_ms(10)
        .with_queue_capacity(2, 1)
        .with_guaranteed_capacity(2)
}

#[tokio::test]
async fn test_submission_rejected_below_guaranteed_capacity() {
    let worker = MockWorker::new(1, 1);
    let cluster = ready_cluster(tight_config(), &[worker.clone()]).await;

    let first = cluster.submit(|| 1u32);
    wait_for_running(&worker, 1).await;
    assert_eq!(worker.running(), vec![first.id()]);

    let second = cluster.submit(|| 2u32);
    let third = cluster.submit(|| 3u32);
    assert_eq!(cluster.scheduler().normal_len(), 2);
    assert_eq!(cluster.scheduler().remaining_capacity(), 1);

    let fourth = cluster.submit(|| 4u32);
    assert_eq!(fourth.status(), FutureStatus::Rejected);
    assert!(fourth.is_done());
    assert!(!fourth.is_cancelled());
    assert_eq!(fourth.get().await.unwrap(), None);

    // Finishing #1 dispatches #2 and frees a slot
    worker.complete_all();
    wait_for_running(&worker, 1).await;
    assert_eq!(worker.running(), vec![second.id()]);
    let fifth = cluster.submit(|| 5u32);
    assert_eq!(fifth.status(), FutureStatus::Pending);

    for _ in 0..3 {
        wait_for_running(&worker, 1).await;
        worker.complete_all();
    }
    assert_eq!(first.get().await.unwrap(), Some(1));
    assert_eq!(second.get().await.unwrap(), Some(2));
    assert_eq!(third.get().await.unwrap(), Some(3));
    assert_eq!(fifth.get().await.unwrap(), Some(5));
}

#[tokio::test]
async fn test_rejected_future_is_not_tracked() {
    let worker = MockWorker::new(1, 1);
    let cluster = ready_cluster(tight_config(), &[worker.clone()]).await;

    let _running = cluster.submit(|| ());
    wait_for_running(&worker, 1).await;
    let _a = cluster.submit(|| ());
    let _b = cluster.submit(|| ());
    let pending = cluster.pending_futures();

    let rejected: Vec<_> = (0..5).map(|_| cluster.submit(|| ())).collect();
    assert!(rejected.iter().all(|f| f.status() == FutureStatus::Rejected));
    assert_eq!(cluster.pending_futures(), pending);
    assert_eq!(cluster.status().queued_jobs, 2);
}

#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
    let worker = MockWorker::new(1, 1);
    let cluster = ready_cluster(tight_config(), &[worker.clone()]).await;

    cluster.shutdown();
    let late = cluster.submit(|| 1u8);
    assert_eq!(late.status(), FutureStatus::Rejected);
    assert_eq!(late.get().await.unwrap(), None);
    assert!(cluster.await_termination(Duration::from_secs(5)).await);
}
