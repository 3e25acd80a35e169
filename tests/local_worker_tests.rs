
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dispatch_lite::config::NodeParams;
use dispatch_lite::{Cluster, ClusterState, FutureStatus, JobError, LocalWorker, WorkerNode};
use test_harness::{assert_eventually, test_config};

async fn local_cluster(workers: &[Arc<LocalWorker>]) -> Cluster {
    let cluster = Cluster::new(test_config()).unwrap();
    for w in workers {
        cluster.add_node(w.clone()).unwrap();
    }
    let c = cluster.clone();
    let expected = workers.len();
    assert_eventually(
        || {
            let c = c.clone();
            async move { c.running_node_count() == expected }
        },
        Duration::from_secs(5),
        "Local workers should become active",
    )
    .await;
    cluster
}

#[tokio::test]
async fn test_execute_simple_job() {
    let worker = Arc::new(LocalWorker::new(1, "localhost", 2));
    let cluster = local_cluster(&[worker]).await;

    let future = cluster.submit(|| format!("{}-{}", "hello", 42));
    assert_eq!(
        future.get_timeout(Duration::from_secs(5)).await.unwrap(),
        Some("hello-42".to_string())
    );
}

#[tokio::test]
async fn test_execute_many_jobs() {
    let w1 = Arc::new(LocalWorker::new(1, "a", 2));
    let w2 = Arc::new(LocalWorker::new(2, "b", 2));
    let cluster = local_cluster(&[w1, w2]).await;

    let futures: Vec<_> = (0..20u64).map(|n| cluster.submit(move || n * 2)).collect();
    let mut sum = 0;
    for f in futures {
        sum += f.get().await.unwrap().unwrap();
    }
    assert_eq!(sum, (0..20u64).map(|n| n * 2).sum::<u64>());
}

#[tokio::test]
async fn test_execute_panicking_job() {
    let worker = Arc::new(LocalWorker::new(1, "localhost", 1));
    let cluster = local_cluster(&[worker]).await;

    let future = cluster.submit(|| -> u32 { panic!("boom") });
    match future.get().await {
        Err(JobError::Panicked(msg)) => assert!(msg.contains("boom"), "message: {}", msg),
        other => panic!("expected a panic outcome, got {:?}", other),
    }

    // The worker keeps going afterwards
    let next = cluster.submit(|| 1u32);
    assert_eq!(next.get().await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_execute_failing_job() {
    let worker = Arc::new(LocalWorker::new(1, "localhost", 1));
    let cluster = local_cluster(&[worker]).await;

    let future = cluster.submit_fallible(|| "x".parse::<u32>());
    match future.get().await {
        Err(JobError::Failed(msg)) => assert!(msg.contains("invalid digit")),
        other => panic!("expected a failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_thread_limit_respected() {
    let worker = Arc::new(LocalWorker::new(1, "localhost", 2));
    let cluster = local_cluster(&[worker.clone()]).await;

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let futures: Vec<_> = (0..6)
        .map(|_| {
            let active = active.clone();
            let peak = peak.clone();
            cluster.submit(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                active.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();
    for f in futures {
        f.get().await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= worker.thread_limit());
}

#[tokio::test]
async fn test_cancel_running_local_job() {
    let worker = Arc::new(LocalWorker::new(1, "localhost", 1));
    let cluster = local_cluster(&[worker.clone()]).await;

    let future = cluster.submit(|| {
        std::thread::sleep(Duration::from_millis(200));
        1u32
    });
    let w = worker.clone();
    assert_eventually(
        || {
            let w = w.clone();
            async move { w.running_jobs().len() == 1 }
        },
        Duration::from_secs(5),
        "Job should start",
    )
    .await;

    assert_eq!(future.cancel(true), Ok(true));
    assert_eq!(future.status(), FutureStatus::Cancelled);
    // The slot frees immediately even though the thread is still sleeping
    assert_eq!(worker.available_threads(), 1);
    assert_eq!(cluster.job_count(), 0);
}

#[tokio::test]
async fn test_closed_local_worker_reports_abandoned_jobs() {
    let w1 = Arc::new(LocalWorker::new(1, "a", 1));
    let cluster = local_cluster(&[w1.clone()]).await;

    let future = cluster.submit(|| {
        std::thread::sleep(Duration::from_millis(100));
        5u32
    });
    let w = w1.clone();
    assert_eventually(
        || {
            let w = w.clone();
            async move { w.running_jobs().len() == 1 }
        },
        Duration::from_secs(5),
        "Job should start",
    )
    .await;

    w1.close();
    assert!(w1.is_stopped());
    assert_eq!(w1.available_threads(), 0);
    assert_eq!(w1.running_jobs().len(), 1);

    // Rescheduled on a replacement worker
    let w2 = Arc::new(LocalWorker::from_params(&NodeParams::new(2, "b", 1)));
    cluster.add_node(w2).unwrap();
    assert_eq!(
        future.get_timeout(Duration::from_secs(5)).await.unwrap(),
        Some(5)
    );
    assert_eq!(cluster.state(), ClusterState::Ready);
}

#[tokio::test]
async fn test_graceful_shutdown_with_local_workers() {
    let worker = Arc::new(LocalWorker::new(1, "localhost", 1));
    let cluster = local_cluster(&[worker.clone()]).await;

    let future = cluster.submit(|| {
        std::thread::sleep(Duration::from_millis(50));
        3u32
    });
    let w = worker.clone();
    assert_eventually(
        || {
            let w = w.clone();
            async move { w.running_jobs().len() == 1 }
        },
        Duration::from_secs(5),
        "Job should start",
    )
    .await;

    cluster.shutdown();
    assert!(cluster.await_termination(Duration::from_secs(5)).await);
    assert!(worker.is_stopped());
    assert_eq!(future.get().await.unwrap(), Some(3));
}
