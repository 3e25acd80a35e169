//! Job scheduler: pairs queued jobs with free worker capacity.
//!
//! The loop scans the node set for any node with a free slot, sleeping for
//! the poll interval when there is none, then pops the next job (priority
//! queue first) and hands it to that node. All nodes and all jobs are treated
//! as interchangeable.
//!
//! Lock order is always queues, then the running map. A job moves between
//! them while both are held, so it is never observable in both places or in
//! neither.

pub mod job;
pub mod nodes;
pub mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::cluster::ClusterEvent;
use crate::config::ClusterConfig;
use crate::error::CancelError;
use crate::future::{FutureTable, Resolution};
use crate::worker::{WorkerId, WorkerNode};

pub use job::{Job, JobId, JobIdAllocator, JobOutput, JobResult, JobStatus, Task};
pub use nodes::NodeSet;
pub use queue::JobQueues;

/// What became of a job taken back from a stopped worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reclaimed {
    Requeued,
    Cancelled,
    /// Its future was already resolved; the job is dropped.
    Abandoned,
}

#[derive(Debug)]
struct SchedulerShared {
    queues: Mutex<JobQueues>,
    running: Mutex<HashMap<JobId, Job>>,
    /// Jobs handed to a worker and not yet finished.
    job_count: AtomicUsize,
    poll_interval_ms: AtomicU64,
    /// Loop keeps going while set. Cleared under the queue lock by `close`.
    active: AtomicBool,
    /// Normal-queue jobs are dequeued only while set.
    accepting: AtomicBool,
    wakeup: Notify,
    nodes: Arc<NodeSet>,
    futures: Arc<FutureTable>,
    events: mpsc::UnboundedSender<ClusterEvent>,
    /// Jobs still queued when the scheduler was closed.
    remaining: Mutex<Vec<Job>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the scheduler state and its background loop.
#[derive(Debug, Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    pub(crate) fn new(
        config: &ClusterConfig,
        nodes: Arc<NodeSet>,
        futures: Arc<FutureTable>,
        events: mpsc::UnboundedSender<ClusterEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                queues: Mutex::new(JobQueues::new(
                    config.normal_capacity,
                    config.priority_capacity,
                    config.guaranteed_capacity,
                )),
                running: Mutex::new(HashMap::new()),
                job_count: AtomicUsize::new(0),
                poll_interval_ms: AtomicU64::new(config.poll_interval_ms),
                active: AtomicBool::new(false),
                accepting: AtomicBool::new(true),
                wakeup: Notify::new(),
                nodes,
                futures,
                events,
                remaining: Mutex::new(Vec::new()),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Spawn the scheduling loop on `runtime`. No-op if it is already running.
    pub(crate) fn start(&self, runtime: &Handle) {
        let mut handle = self.shared.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.shared.active.store(true, Ordering::SeqCst);
        self.shared.accepting.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        *handle = Some(runtime.spawn(async move {
            run_loop(shared).await;
        }));
    }

    /// Place a job on a queue. Non-priority jobs are refused once the free
    /// space across both queues drops below the guaranteed capacity.
    pub fn queue_job(&self, job: Job, priority: bool) -> bool {
        let id = job.id;
        let accepted = self.shared.queues.lock().push(job, priority).is_ok();
        if accepted {
            self.shared.wakeup.notify_one();
            tracing::debug!(job_id = %id, priority, "Job queued");
        } else {
            tracing::warn!(job_id = %id, priority, "Job queue at capacity, job rejected");
        }
        accepted
    }

    /// Cancel a job by id.
    ///
    /// A queued job is removed and its future cancelled. A running job is only
    /// touched when `force` is set: its future is cancelled first, then its
    /// worker is asked to drop it. `Ok(false)` means the job is no longer
    /// queued and either finished already or is running without `force`.
    pub fn cancel_job(&self, id: JobId, force: bool) -> Result<bool, CancelError> {
        let mut queues = self.shared.queues.lock();
        if queues.remove(id).is_some() {
            drop(queues);
            self.shared.futures.resolve(id, Resolution::Cancelled);
            tracing::debug!(job_id = %id, "Cancelled queued job");
            return Ok(true);
        }
        let worker_id = self
            .shared
            .running
            .lock()
            .get(&id)
            .and_then(|job| job.assigned_worker);
        drop(queues);

        let Some(worker_id) = worker_id else {
            return Ok(false);
        };
        if !force {
            return Ok(false);
        }

        self.shared.futures.resolve(id, Resolution::Cancelled);

        // Its worker may have stopped and handed it back in the meantime.
        if self.shared.queues.lock().remove(id).is_some() {
            tracing::debug!(job_id = %id, worker_id, "Cancelled job requeued from a stopped worker");
            return Ok(true);
        }

        let Some(node) = self.shared.nodes.get(worker_id) else {
            tracing::error!(job_id = %id, worker_id, "Running job's worker is not registered, cannot cancel");
            return Err(CancelError::WorkerNotFound {
                job_id: id,
                worker_id,
            });
        };

        if node.cancel(id) {
            if self.shared.running.lock().remove(&id).is_some() {
                self.shared.release_job_count();
            }
            tracing::debug!(job_id = %id, worker_id, "Cancelled running job");
            Ok(true)
        } else {
            tracing::warn!(job_id = %id, worker_id, "Worker refused to cancel job");
            Err(CancelError::Refused {
                job_id: id,
                worker_id,
            })
        }
    }

    /// Take a job back from a worker that stopped while holding it.
    ///
    /// The job leaves the running map and lands on the priority queue under a
    /// single queue lock, or has its future cancelled when `requeue` is unset.
    /// Returns None if the job already completed or belongs to another worker.
    pub(crate) fn reclaim(
        &self,
        worker_id: WorkerId,
        id: JobId,
        requeue: bool,
    ) -> Option<Reclaimed> {
        let outcome = {
            let mut queues = self.shared.queues.lock();
            let job = self.shared.take_running(worker_id, id)?;
            if !self.shared.futures.contains(id) {
                Reclaimed::Abandoned
            } else if requeue {
                queues.requeue(job);
                Reclaimed::Requeued
            } else {
                self.shared.futures.resolve(id, Resolution::Cancelled);
                Reclaimed::Cancelled
            }
        };
        if outcome == Reclaimed::Requeued {
            self.shared.wakeup.notify_one();
        }
        self.shared.release_job_count();
        Some(outcome)
    }

    /// Take every running job out of the scheduler and cancel its future.
    pub(crate) fn drain_running(&self) -> Vec<Job> {
        let jobs: Vec<Job> = {
            let _queues = self.shared.queues.lock();
            self.shared.running.lock().drain().map(|(_, job)| job).collect()
        };
        for job in &jobs {
            self.shared.futures.resolve(job.id, Resolution::Cancelled);
            self.shared.release_job_count();
        }
        jobs
    }

    /// Stop the loop, empty both queues and cancel the futures of what was
    /// queued. The drained jobs are also kept for [`Scheduler::remaining_jobs`].
    pub(crate) fn close(&self) -> Vec<Job> {
        let drained = {
            let mut queues = self.shared.queues.lock();
            self.shared.active.store(false, Ordering::SeqCst);
            self.shared.accepting.store(false, Ordering::SeqCst);
            queues.drain_all()
        };
        self.shared.wakeup.notify_waiters();
        if let Some(handle) = self.shared.handle.lock().take() {
            handle.abort();
        }
        for job in &drained {
            self.shared.futures.resolve(job.id, Resolution::Cancelled);
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Scheduler closed with queued jobs");
        }
        self.shared.remaining.lock().extend(drained.iter().cloned());
        drained
    }

    /// Forget all jobs and counters. Only used after `close`.
    pub(crate) fn reset(&self) {
        let mut queues = self.shared.queues.lock();
        queues.drain_all();
        self.shared.running.lock().clear();
        self.shared.remaining.lock().clear();
        self.shared.job_count.store(0, Ordering::SeqCst);
    }

    /// Stop or resume dequeuing from the normal queue. The priority queue is
    /// still served while the loop runs.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
        if accepting {
            self.shared.wakeup.notify_one();
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1);
        self.shared.poll_interval_ms.store(ms, Ordering::Relaxed);
    }

    pub fn poll_interval(&self) -> Duration {
        self.shared.poll_interval()
    }

    pub fn job_count(&self) -> usize {
        self.shared.job_count.load(Ordering::SeqCst)
    }

    pub fn remaining_capacity(&self) -> usize {
        self.shared.queues.lock().remaining_capacity()
    }

    pub fn queued_len(&self) -> usize {
        self.shared.queues.lock().len()
    }

    pub fn normal_len(&self) -> usize {
        self.shared.queues.lock().normal_len()
    }

    pub fn priority_len(&self) -> usize {
        self.shared.queues.lock().priority_len()
    }

    pub fn running_len(&self) -> usize {
        self.shared.running.lock().len()
    }

    pub fn status_of(&self, id: JobId) -> Option<JobStatus> {
        let queues = self.shared.queues.lock();
        if let Some(status) = queues.status_of(id) {
            return Some(status);
        }
        self.shared
            .running
            .lock()
            .contains_key(&id)
            .then_some(JobStatus::Running)
    }

    /// Worker currently holding a running job.
    pub fn assigned_worker(&self, id: JobId) -> Option<WorkerId> {
        self.shared
            .running
            .lock()
            .get(&id)
            .and_then(|job| job.assigned_worker)
    }

    /// Ids of the running jobs assigned to `worker_id`.
    pub fn running_on(&self, worker_id: WorkerId) -> Vec<JobId> {
        self.shared
            .running
            .lock()
            .values()
            .filter(|job| job.assigned_worker == Some(worker_id))
            .map(|job| job.id)
            .collect()
    }

    pub fn remaining_jobs(&self) -> Vec<Job> {
        self.shared.remaining.lock().clone()
    }
}

impl SchedulerShared {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.load(Ordering::Relaxed))
    }

    /// Pop the next job and record it as running on `worker_id`, in one step.
    fn take_for_dispatch(&self, worker_id: WorkerId) -> Option<Job> {
        let mut queues = self.queues.lock();
        if !self.active.load(Ordering::SeqCst) {
            return None;
        }
        let mut job = queues.pop_next(self.accepting.load(Ordering::SeqCst))?;
        job.assigned_worker = Some(worker_id);
        job.attempts += 1;
        self.running.lock().insert(job.id, job.clone());
        self.job_count.fetch_add(1, Ordering::SeqCst);
        Some(job)
    }

    /// Wait up to `poll` for a job to become available.
    async fn next_job(&self, worker_id: WorkerId, poll: Duration) -> Option<Job> {
        if let Some(job) = self.take_for_dispatch(worker_id) {
            return Some(job);
        }
        let _ = tokio::time::timeout(poll, self.wakeup.notified()).await;
        self.take_for_dispatch(worker_id)
    }

    /// Hand `job` to `node`. Returns false if the node rejected it and the job
    /// went back to the priority queue.
    fn dispatch(self: &Arc<Self>, node: Arc<dyn WorkerNode>, job: Job) -> bool {
        let worker_id = node.id();
        let completion = Completion {
            shared: Arc::downgrade(self),
            worker_id,
            job_id: job.id,
        };

        if node.submit(&job, completion) {
            let waited_ms = (chrono::Utc::now() - job.submitted_at).num_milliseconds();
            tracing::debug!(
                job_id = %job.id,
                worker_id,
                host = node.host(),
                attempt = job.attempts,
                waited_ms,
                "Job dispatched"
            );
            return true;
        }

        tracing::debug!(job_id = %job.id, worker_id, "Worker rejected job, requeueing with priority");
        {
            let mut queues = self.queues.lock();
            let Some(job) = self.running.lock().remove(&job.id) else {
                // Cancelled while the submit was in flight.
                return false;
            };
            if self.futures.contains(job.id) {
                queues.requeue(job);
            }
        }
        self.wakeup.notify_one();
        self.release_job_count();
        false
    }

    fn take_running(&self, worker_id: WorkerId, id: JobId) -> Option<Job> {
        let mut running = self.running.lock();
        match running.get(&id) {
            Some(job) if job.assigned_worker == Some(worker_id) => running.remove(&id),
            _ => None,
        }
    }

    fn complete(&self, worker_id: WorkerId, id: JobId, result: JobResult) {
        let Some(_job) = self.take_running(worker_id, id) else {
            tracing::debug!(job_id = %id, worker_id, "Ignoring completion for job no longer running here");
            return;
        };
        let ok = result.is_ok();
        if !self.futures.resolve(id, Resolution::Completed(result)) {
            tracing::debug!(job_id = %id, "Job finished after its future was resolved");
        }
        tracing::debug!(job_id = %id, worker_id, ok, "Job finished");
        self.release_job_count();
    }

    /// Decrement the in-flight count, telling the cluster when it hits zero.
    fn release_job_count(&self) {
        match self
            .job_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(1) => {
                let _ = self.events.send(ClusterEvent::JobsDrained);
            }
            Ok(_) => {}
            Err(_) => {
                tracing::error!("In-flight job count would go negative, ignoring decrement");
                debug_assert!(false, "in-flight job count underflow");
            }
        }
    }
}

async fn run_loop(shared: Arc<SchedulerShared>) {
    tracing::info!(poll = ?shared.poll_interval(), "Scheduler loop started");

    while shared.active.load(Ordering::SeqCst) {
        let poll = shared.poll_interval();

        let Some(node) = shared.nodes.free_node() else {
            tokio::time::sleep(poll).await;
            continue;
        };

        if let Some(job) = shared.next_job(node.id(), poll).await {
            if !shared.dispatch(node, job) {
                // Capacity vanished under us; give the node a poll interval.
                tokio::time::sleep(poll).await;
            }
        }
    }

    tracing::info!("Scheduler loop exited");
}

/// Handed to a worker with each job; fire it exactly once when the job ends.
#[derive(Debug)]
pub struct Completion {
    shared: Weak<SchedulerShared>,
    worker_id: WorkerId,
    job_id: JobId,
}

impl Completion {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Deliver the job's result. A completion for a job that was cancelled,
    /// reclaimed or redispatched elsewhere is ignored.
    pub fn complete(self, result: JobResult) {
        if let Some(shared) = self.shared.upgrade() {
            shared.complete(self.worker_id, self.job_id, result);
        }
    }
}
