
use std::time::Duration;

use dispatch_lite::scheduler::{Job, JobId, JobQueues, JobStatus, Task};
use dispatch_lite::{CancelError, FutureStatus, JobError};
use test_harness::{ready_cluster, test_config, wait_for_running, MockWorker};

fn job(id: u64) -> Job {
    Job::new(JobId(id), Task::from_fn(move || id))
}

#[test]
fn test_queue_fifo_within_each_queue() {
    let mut queues = JobQueues::new(8, 8, 0);
    for id in 1..=3 {
        queues.push(job(id), false).unwrap();
    }
    queues.push(job(10), true).unwrap();
    queues.push(job(11), true).unwrap();

    let order: Vec<u64> = std::iter::from_fn(|| queues.pop_next(true))
        .map(|j| j.id.0)
        .collect();
    // Priority queue always wins while non-empty
    assert_eq!(order, vec![10, 11, 1, 2, 3]);
    assert!(queues.is_empty());
}

#[test]
fn test_queue_skips_normal_when_not_accepting() {
    let mut queues = JobQueues::new(8, 8, 0);
    queues.push(job(1), false).unwrap();
    queues.push(job(2), true).unwrap();

    assert_eq!(queues.pop_next(false).map(|j| j.id), Some(JobId(2)));
    assert!(queues.pop_next(false).is_none());
    assert_eq!(queues.normal_len(), 1);
}

#[test]
fn test_capacity_guarantee_blocks_normal_insertions() {
    // 8 + 2 slots with a reserve of 5: a normal push is accepted only while at
    // least 5 slots are free before it
    let mut queues = JobQueues::new(8, 2, 5);
    let mut accepted = 0;
    for id in 1..=10 {
        let before = queues.remaining_capacity();
        match queues.push(job(id), false) {
            Ok(()) => {
                assert!(before >= 5, "accepted with only {} free slots", before);
                accepted += 1;
            }
            Err(rejected) => {
                assert_eq!(rejected.id, JobId(id));
                assert!(before < 5);
            }
        }
    }
    assert_eq!(accepted, 6);
    assert_eq!(queues.remaining_capacity(), 4);

    // Requeues are never refused, even past the priority queue's nominal size
    assert!(queues.push(job(30), true).is_ok());
    assert!(queues.push(job(31), true).is_ok());
    assert!(queues.push(job(32), true).is_ok());
    assert_eq!(queues.priority_len(), 3);
    assert_eq!(queues.remaining_capacity(), 2);
    assert!(queues.push(job(33), false).is_err());
}

#[test]
fn test_queue_status_and_remove() {
    let mut queues = JobQueues::new(4, 4, 0);
    queues.push(job(1), false).unwrap();
    queues.push(job(2), true).unwrap();

    assert_eq!(queues.status_of(JobId(1)), Some(JobStatus::Queued));
    assert_eq!(queues.status_of(JobId(2)), Some(JobStatus::Requeued));
    assert_eq!(queues.status_of(JobId(3)), None);

    assert!(queues.remove(JobId(2)).is_some());
    assert!(queues.remove(JobId(2)).is_none());
    assert_eq!(queues.len(), 1);

    let drained = queues.drain_all();
    assert_eq!(drained.len(), 1);
    assert!(queues.is_empty());
}

#[test]
fn test_push_clears_assignment() {
    let mut queues = JobQueues::new(4, 4, 0);
    let mut j = job(1);
    j.assigned_worker = Some(7);
    queues.push(j, true).unwrap();
    assert!(queues.pop_next(true).unwrap().assigned_worker.is_none());
}

#[tokio::test]
async fn test_jobs_dispatched_and_completed() {
    let worker = MockWorker::new(1, 2);
    let cluster = ready_cluster(test_config(), &[worker.clone()]).await;

    let a = cluster.submit(|| 2u32 + 2);
    let b = cluster.submit(|| "done".to_string());
    wait_for_running(&worker, 2).await;
    assert_eq!(cluster.job_count(), 2);
    assert_eq!(cluster.scheduler().status_of(a.id()), Some(JobStatus::Running));
    assert_eq!(cluster.scheduler().assigned_worker(a.id()), Some(1));

    assert_eq!(worker.complete_all(), 2);
    assert_eq!(a.get().await.unwrap(), Some(4));
    assert_eq!(b.get().await.unwrap(), Some("done".to_string()));
    assert_eq!(cluster.job_count(), 0);
    assert_eq!(cluster.pending_futures(), 0);
}

#[tokio::test]
async fn test_dispatch_respects_available_threads() {
    let worker = MockWorker::new(1, 1);
    let cluster = ready_cluster(test_config(), &[worker.clone()]).await;

    let futures: Vec<_> = (0..3u32).map(|n| cluster.submit(move || n)).collect();
    wait_for_running(&worker, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(worker.running().len(), 1);
    assert_eq!(cluster.scheduler().normal_len(), 2);

    for _ in 0..3 {
        wait_for_running(&worker, 1).await;
        worker.complete_all();
    }
    let mut values = Vec::new();
    for f in futures {
        values.push(f.get().await.unwrap().unwrap());
    }
    // FIFO dispatch on a single slot
    assert_eq!(values, vec![0, 1, 2]);
    assert_eq!(worker.history(), vec![JobId(1), JobId(2), JobId(3)]);
}

#[tokio::test]
async fn test_rejected_submit_is_requeued_with_priority() {
    let flaky = MockWorker::new(1, 1);
    let cluster = ready_cluster(test_config(), &[flaky.clone()]).await;
    flaky.set_reject_submits(true);

    let future = cluster.submit(|| 5u8);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(cluster.scheduler().status_of(future.id()), Some(JobStatus::Requeued));
    assert_eq!(cluster.job_count(), 0);

    flaky.set_reject_submits(false);
    wait_for_running(&flaky, 1).await;
    flaky.complete_all();
    assert_eq!(future.get().await.unwrap(), Some(5));
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let worker = MockWorker::inactive(1, 1);
    let cluster = dispatch_lite::Cluster::new(test_config()).unwrap();
    cluster.add_node(worker.clone()).unwrap();

    let future = cluster.submit(|| 1u8);
    assert_eq!(cluster.scheduler().status_of(future.id()), Some(JobStatus::Queued));
    assert_eq!(future.cancel(false), Ok(true));
    assert!(future.is_cancelled());
    assert_eq!(cluster.scheduler().queued_len(), 0);
    // Cancelling again is a no-op
    assert_eq!(future.cancel(true), Ok(false));
    assert_eq!(future.get().await, Err(JobError::Cancelled(JobId(1))));
}

#[tokio::test]
async fn test_cancel_running_job_requires_force() {
    let worker = MockWorker::new(1, 1);
    let cluster = ready_cluster(test_config(), &[worker.clone()]).await;

    let future = cluster.submit(|| 1u8);
    wait_for_running(&worker, 1).await;

    assert_eq!(cluster.cancel(future.id(), false), Ok(false));
    assert_eq!(future.status(), FutureStatus::Pending);

    assert_eq!(future.cancel(true), Ok(true));
    assert!(future.is_cancelled());
    assert!(worker.running().is_empty());
    assert_eq!(cluster.job_count(), 0);
}

#[tokio::test]
async fn test_cancel_refused_by_worker() {
    let worker = MockWorker::new(1, 1);
    let cluster = ready_cluster(test_config(), &[worker.clone()]).await;
    worker.set_refuse_cancel(true);

    let future = cluster.submit(|| 1u8);
    let id = future.id();
    wait_for_running(&worker, 1).await;

    assert_eq!(
        future.cancel(true),
        Err(CancelError::Refused {
            job_id: id,
            worker_id: 1
        })
    );
    // The caller's future is cancelled even though the worker kept the job
    assert!(future.is_cancelled());

    // A late completion is dropped but still frees the slot
    assert!(worker.complete(id));
    assert_eq!(cluster.job_count(), 0);
    assert_eq!(future.get().await, Err(JobError::Cancelled(id)));
}

#[tokio::test]
async fn test_payload_failure_reaches_future() {
    let worker = MockWorker::new(1, 1);
    let cluster = ready_cluster(test_config(), &[worker.clone()]).await;

    let future = cluster.submit_fallible(|| Err::<u8, _>("bad input"));
    wait_for_running(&worker, 1).await;
    worker.complete_all();
    assert_eq!(
        future.get().await,
        Err(JobError::Failed("bad input".to_string()))
    );
}

#[tokio::test]
async fn test_wrong_output_type_is_reported() {
    let worker = MockWorker::new(1, 1);
    let cluster = ready_cluster(test_config(), &[worker.clone()]).await;

    let future = cluster.submit_task::<String>(Task::from_fn(|| 3u64));
    let id = future.id();
    wait_for_running(&worker, 1).await;
    worker.complete_all();
    assert_eq!(future.get().await, Err(JobError::TypeMismatch(id)));
}

#[tokio::test]
async fn test_get_timeout_on_pending_job() {
    let worker = MockWorker::new(1, 1);
    let cluster = ready_cluster(test_config(), &[worker.clone()]).await;

    let future = cluster.submit(|| 1u8);
    let id = future.id();
    wait_for_running(&worker, 1).await;
    assert_eq!(
        future.get_timeout(Duration::from_millis(30)).await,
        Err(JobError::TimedOut(id))
    );
}

#[tokio::test]
async fn test_set_poll_interval() {
    let cluster = dispatch_lite::Cluster::new(test_config()).unwrap();
    assert_eq!(cluster.scheduler().poll_interval(), Duration::from_millis(10));
    cluster.scheduler().set_poll_interval(Duration::from_millis(250));
    assert_eq!(cluster.scheduler().poll_interval(), Duration::from_millis(250));
    cluster.scheduler().set_poll_interval(Duration::ZERO);
    assert_eq!(cluster.scheduler().poll_interval(), Duration::from_millis(1));
}
