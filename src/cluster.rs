//! Cluster coordinator.
//!
//! Owns the worker set, the scheduler and the future table, and drives the
//! cluster lifecycle:
//!
//! ```text
//! Init --first worker active--> Ready --shutdown()--> Halted --drained / shutdown_now()--> Terminated
//!   ^                                                                                        |
//!   +------------------------------------- reset() ------------------------------------------+
//! ```
//!
//! Worker transitions and "no jobs in flight" notifications arrive as
//! [`ClusterEvent`]s on a channel processed by a background task, so worker
//! implementations never call back into the coordinator directly.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{ClusterConfig, InvokePolicy, NodeParams};
use crate::error::{CancelError, DispatchError, JobError, Result};
use crate::future::{FutureTable, JobFuture, Resolution};
use crate::registry::NodeRegistry;
use crate::scheduler::{Job, JobId, JobIdAllocator, NodeSet, Reclaimed, Scheduler, Task};
use crate::worker::{WorkerEvents, WorkerId, WorkerNode, WorkerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    Init,
    Ready,
    Halted,
    Terminated,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::Init => write!(f, "init"),
            ClusterState::Ready => write!(f, "ready"),
            ClusterState::Halted => write!(f, "halted"),
            ClusterState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Messages processed by the coordinator's event task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    WorkerStateChanged {
        worker_id: WorkerId,
        state: WorkerState,
    },
    /// The scheduler's in-flight job count reached zero.
    JobsDrained,
}

/// Point-in-time view of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub state: ClusterState,
    pub nodes: usize,
    pub running_nodes: usize,
    pub running_jobs: usize,
    pub queued_jobs: usize,
    pub requeued_jobs: usize,
    pub pending_futures: usize,
    pub remaining_capacity: usize,
}

struct ClusterInner {
    config: ClusterConfig,
    runtime: Handle,
    ids: JobIdAllocator,
    nodes: Arc<NodeSet>,
    futures: Arc<FutureTable>,
    scheduler: Scheduler,
    registry: Mutex<NodeRegistry>,
    ready: AtomicBool,
    halted: AtomicBool,
    terminated: AtomicBool,
    /// Set once every node has been told to close.
    closing: AtomicBool,
    running_nodes: AtomicUsize,
    /// Mirrors `running_nodes` for waiters.
    running_tx: watch::Sender<usize>,
    state_tx: watch::Sender<ClusterState>,
    events_tx: mpsc::UnboundedSender<ClusterEvent>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes lifecycle transitions.
    lifecycle: Mutex<()>,
}

/// Handle to a running cluster. Cheap to clone; all clones share one
/// coordinator.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Build a cluster and start its scheduler loop and event task on the
    /// current tokio runtime.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ClusterState::Init);
        let (running_tx, _) = watch::channel(0);
        let nodes = Arc::new(NodeSet::new());
        let futures = Arc::new(FutureTable::new());
        let scheduler = Scheduler::new(&config, nodes.clone(), futures.clone(), events_tx.clone());
        let registry =
            NodeRegistry::with_defaults(config.node_defaults.clone(), config.nodes.iter().cloned());

        let inner = Arc::new(ClusterInner {
            config,
            runtime: runtime.clone(),
            ids: JobIdAllocator::new(),
            nodes,
            futures,
            scheduler,
            registry: Mutex::new(registry),
            ready: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            running_nodes: AtomicUsize::new(0),
            running_tx,
            state_tx,
            events_tx,
            event_task: Mutex::new(None),
            lifecycle: Mutex::new(()),
        });

        let weak = Arc::downgrade(&inner);
        *inner.event_task.lock() = Some(runtime.spawn(async move {
            run_events(weak, events_rx).await;
        }));
        inner.scheduler.start(&inner.runtime);

        tracing::info!(
            normal_capacity = inner.config.normal_capacity,
            priority_capacity = inner.config.priority_capacity,
            guaranteed_capacity = inner.config.guaranteed_capacity,
            "Cluster created"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Add a worker and start listening to its lifecycle reports. It starts
    /// receiving jobs once it reports `Active`.
    pub fn add_node(&self, node: Arc<dyn WorkerNode>) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock();
        if inner.halted.load(Ordering::SeqCst) {
            return Err(DispatchError::InvalidState(inner.state()));
        }
        let id = node.id();
        if !inner.nodes.insert(node.clone()) {
            return Err(DispatchError::DuplicateWorker(id));
        }
        {
            let mut registry = inner.registry.lock();
            if registry.get(id).is_none() {
                registry.add(NodeParams::new(id, node.host(), node.available_threads()));
            }
        }
        tracing::info!(worker_id = id, host = node.host(), "Worker added");
        node.attach(WorkerEvents::new(inner.events_tx.clone()));
        Ok(())
    }

    /// Submit a callable. The returned future resolves immediately with an
    /// empty result if the job cannot be queued.
    pub fn submit<T, F>(&self, f: F) -> JobFuture<T>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.submit_task(Task::from_fn(f))
    }

    /// Submit a fallible callable; an `Err` resolves the future with
    /// [`JobError::Failed`].
    pub fn submit_fallible<T, E, F>(&self, f: F) -> JobFuture<T>
    where
        T: Send + 'static,
        E: fmt::Display,
        F: Fn() -> std::result::Result<T, E> + Send + Sync + 'static,
    {
        self.submit_task(Task::from_fallible(f))
    }

    /// Submit a prepared task, for instance one returned by `shutdown_now` of
    /// another cluster. `T` must be the type the task produces, otherwise the
    /// future resolves with [`JobError::TypeMismatch`].
    pub fn submit_task<T: Send + 'static>(&self, task: Task) -> JobFuture<T> {
        let inner = &self.inner;
        let id = inner.ids.next_id();
        let cell = inner.futures.register(id);
        let future = JobFuture::new(id, cell, inner.scheduler.clone());

        if inner.halted.load(Ordering::SeqCst) {
            tracing::warn!(job_id = %id, "Cluster is shut down, job rejected");
            inner.futures.resolve(id, Resolution::Rejected);
            return future;
        }

        if !inner.scheduler.queue_job(Job::new(id, task), false) {
            inner.futures.resolve(id, Resolution::Rejected);
        }
        future
    }

    /// Submit every callable and wait for all of them.
    ///
    /// With [`InvokePolicy::IgnoreFailures`] each job's outcome is returned in
    /// submission order. With [`InvokePolicy::FailFast`] the first failure
    /// cancels the remaining jobs and is returned as the error.
    pub async fn submit_many<T, F, I>(&self, callables: I) -> Result<Vec<JobOutcome<T>>>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
        I: IntoIterator<Item = F>,
    {
        let futures: Vec<JobFuture<T>> = callables.into_iter().map(|f| self.submit(f)).collect();
        self.collect_outcomes(futures, None).await
    }

    /// Like [`Cluster::submit_many`], but jobs still pending when `timeout`
    /// elapses are cancelled.
    pub async fn submit_many_timeout<T, F, I>(
        &self,
        callables: I,
        timeout: Duration,
    ) -> Result<Vec<JobOutcome<T>>>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
        I: IntoIterator<Item = F>,
    {
        let deadline = Instant::now() + timeout;
        let futures: Vec<JobFuture<T>> = callables.into_iter().map(|f| self.submit(f)).collect();
        self.collect_outcomes(futures, Some(deadline)).await
    }

    async fn collect_outcomes<T: Send + 'static>(
        &self,
        futures: Vec<JobFuture<T>>,
        deadline: Option<Instant>,
    ) -> Result<Vec<JobOutcome<T>>> {
        let policy = self.inner.config.invoke_policy;
        let mut outcomes = Vec::with_capacity(futures.len());
        let mut pending = futures.into_iter();

        while let Some(future) = pending.next() {
            let id = future.id();
            if let Some(deadline) = deadline {
                if tokio::time::timeout_at(deadline, future.wait()).await.is_err() {
                    tracing::debug!(job_id = %id, "Deadline passed, cancelling job");
                    let _ = future.cancel(true);
                }
            }
            let outcome = future.get().await;

            if let (InvokePolicy::FailFast, Err(e)) = (policy, &outcome) {
                let e = e.clone();
                let cancelled = pending.filter(|f| matches!(f.cancel(true), Ok(true))).count();
                tracing::warn!(job_id = %id, error = %e, cancelled, "Job failed, cancelling the rest");
                return Err(DispatchError::JobFailed { job_id: id, source: e });
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Submit every callable and return the first successful outcome, in
    /// submission order. A rejected submission counts as a success with an
    /// empty result. The other jobs are cancelled once one succeeds.
    pub async fn invoke_any<T, F, I>(
        &self,
        callables: I,
    ) -> std::result::Result<Option<T>, JobError>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
        I: IntoIterator<Item = F>,
    {
        let futures: Vec<JobFuture<T>> = callables.into_iter().map(|f| self.submit(f)).collect();
        let mut last_error = None;
        let mut pending = futures.into_iter();

        while let Some(future) = pending.next() {
            match future.get().await {
                Ok(value) => {
                    for rest in pending {
                        if let Err(e) = rest.cancel(true) {
                            tracing::warn!(job_id = %rest.id(), error = %e, "Could not cancel job");
                        }
                    }
                    return Ok(value);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| JobError::Failed("no task completed".to_string())))
    }

    /// Cancel a job by id; see [`Scheduler::cancel_job`].
    pub fn cancel(&self, id: JobId, force: bool) -> std::result::Result<bool, CancelError> {
        self.inner.scheduler.cancel_job(id, force)
    }

    /// Stop taking new work and let in-flight jobs finish. Once nothing is in
    /// flight every worker is closed, and the cluster terminates when the last
    /// one reports `Stopped`. Jobs still queued at that point are cancelled.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock();
        if inner.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.ready.store(false, Ordering::SeqCst);
        inner.scheduler.set_accepting(false);
        for node in inner.nodes.snapshot() {
            node.stop_accepting();
        }
        inner.publish();
        tracing::info!(in_flight = inner.scheduler.job_count(), "Cluster shutting down");

        if inner.scheduler.job_count() == 0 {
            inner.halt_finished();
        }
    }

    /// Close every worker now. Returns the tasks that were queued or running
    /// and did not complete, in submission order; their futures are cancelled.
    pub fn shutdown_now(&self) -> Vec<Task> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock();
        if inner.terminated.load(Ordering::SeqCst) {
            return Vec::new();
        }
        inner.halted.store(true, Ordering::SeqCst);
        inner.ready.store(false, Ordering::SeqCst);
        inner.scheduler.set_accepting(false);

        // Take jobs out before closing nodes so stop reports find nothing to
        // cancel behind our back.
        let queued = inner.scheduler.close();
        let running = inner.scheduler.drain_running();

        inner.closing.store(true, Ordering::SeqCst);
        for node in inner.nodes.snapshot() {
            node.close();
        }
        inner.publish();
        tracing::info!(
            queued = queued.len(),
            running = running.len(),
            "Cluster shut down immediately"
        );
        inner.try_terminate();

        let mut unfinished: Vec<Job> = running.into_iter().chain(queued).collect();
        unfinished.sort_by_key(|job| job.id);
        unfinished.into_iter().map(Job::into_task).collect()
    }

    /// Wait until the cluster terminates or `timeout` elapses. Returns whether
    /// it terminated.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state == ClusterState::Terminated),
        )
        .await;
        self.is_terminated()
    }

    /// Wait until at least one worker is active and the cluster is `Ready`.
    /// Returns false on timeout, or early if the cluster shuts down first.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state != ClusterState::Init),
        )
        .await;
        self.is_ready()
    }

    /// Wait until every added worker has reported `Active`. Returns false on
    /// timeout or when no worker was added.
    pub async fn wait_for_all_nodes(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let mut rx = inner.running_tx.subscribe();
        let _ = tokio::time::timeout(
            timeout,
            rx.wait_for(|running| *running > 0 && *running >= inner.nodes.len()),
        )
        .await;
        let running = self.running_node_count();
        running > 0 && running >= inner.nodes.len()
    }

    /// Return a terminated cluster to its initial configuration: no workers,
    /// empty queues, zeroed counters, registry reloaded from config.
    pub fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock();
        if !inner.terminated.load(Ordering::SeqCst) {
            return Err(DispatchError::InvalidState(inner.state()));
        }
        inner.nodes.clear();
        inner.scheduler.reset();
        inner.futures.cancel_all();
        *inner.registry.lock() = NodeRegistry::with_defaults(
            inner.config.node_defaults.clone(),
            inner.config.nodes.iter().cloned(),
        );
        inner.running_nodes.store(0, Ordering::SeqCst);
        inner.running_tx.send_replace(0);
        inner.ready.store(false, Ordering::SeqCst);
        inner.halted.store(false, Ordering::SeqCst);
        inner.closing.store(false, Ordering::SeqCst);
        inner.terminated.store(false, Ordering::SeqCst);
        inner.scheduler.start(&inner.runtime);
        inner.publish();
        tracing::info!("Cluster reset");
        Ok(())
    }

    pub fn state(&self) -> ClusterState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClusterState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    pub fn running_node_count(&self) -> usize {
        self.inner.running_nodes.load(Ordering::SeqCst)
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.len()
    }

    pub fn node(&self, id: WorkerId) -> Option<Arc<dyn WorkerNode>> {
        self.inner.nodes.get(id)
    }

    pub fn job_count(&self) -> usize {
        self.inner.scheduler.job_count()
    }

    pub fn pending_futures(&self) -> usize {
        self.inner.futures.len()
    }

    /// Tasks that were still queued when the cluster terminated.
    pub fn remaining_tasks(&self) -> Vec<Task> {
        self.inner
            .scheduler
            .remaining_jobs()
            .into_iter()
            .map(Job::into_task)
            .collect()
    }

    pub fn node_params(&self) -> Vec<NodeParams> {
        self.inner.registry.lock().params().cloned().collect()
    }

    pub fn register_node_params(&self, params: NodeParams) {
        self.inner.registry.lock().add(params);
    }

    pub fn node_defaults(&self) -> NodeParams {
        self.inner.registry.lock().defaults().clone()
    }

    /// Replace the parameters filled into blank fields of nodes registered
    /// from now on. Existing entries keep their values.
    pub fn set_node_defaults(&self, defaults: NodeParams) {
        self.inner.registry.lock().set_defaults(defaults);
    }

    pub fn status(&self) -> ClusterStatus {
        let inner = &self.inner;
        ClusterStatus {
            state: inner.state(),
            nodes: inner.nodes.len(),
            running_nodes: inner.running_nodes.load(Ordering::SeqCst),
            running_jobs: inner.scheduler.job_count(),
            queued_jobs: inner.scheduler.normal_len(),
            requeued_jobs: inner.scheduler.priority_len(),
            pending_futures: inner.futures.len(),
            remaining_capacity: inner.scheduler.remaining_capacity(),
        }
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("state", &self.inner.state())
            .field("nodes", &self.inner.nodes.len())
            .field("running_nodes", &self.running_node_count())
            .field("job_count", &self.job_count())
            .finish()
    }
}

/// Outcome of one job in a batch: a value, an empty result for a rejected
/// submission, or the job's error.
pub type JobOutcome<T> = std::result::Result<Option<T>, JobError>;

impl ClusterInner {
    fn state(&self) -> ClusterState {
        if self.terminated.load(Ordering::SeqCst) {
            ClusterState::Terminated
        } else if self.halted.load(Ordering::SeqCst) {
            ClusterState::Halted
        } else if self.ready.load(Ordering::SeqCst) {
            ClusterState::Ready
        } else {
            ClusterState::Init
        }
    }

    fn publish(&self) {
        let state = self.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::info!(from = %current, to = %state, "Cluster state changed");
                *current = state;
                true
            }
        });
    }

    fn handle_event(&self, event: ClusterEvent) {
        let _lifecycle = self.lifecycle.lock();
        match event {
            ClusterEvent::WorkerStateChanged {
                worker_id,
                state: WorkerState::Active,
            } => self.worker_active(worker_id),
            ClusterEvent::WorkerStateChanged {
                worker_id,
                state: WorkerState::Stopped,
            } => self.worker_stopped(worker_id),
            ClusterEvent::JobsDrained => {
                if self.halted.load(Ordering::SeqCst)
                    && !self.terminated.load(Ordering::SeqCst)
                    && self.scheduler.job_count() == 0
                {
                    tracing::info!("All in-flight jobs finished");
                    self.halt_finished();
                }
            }
        }
    }

    fn worker_active(&self, worker_id: WorkerId) {
        if self.halted.load(Ordering::SeqCst) {
            tracing::info!(worker_id, "Ignoring worker activation, cluster is shut down");
            return;
        }
        if !self.nodes.activate(worker_id) {
            tracing::debug!(worker_id, "Duplicate or unknown worker activation");
            return;
        }
        let running = self.running_nodes.fetch_add(1, Ordering::SeqCst) + 1;
        self.running_tx.send_replace(running);
        self.ready.store(true, Ordering::SeqCst);
        self.publish();
        tracing::info!(worker_id, running_nodes = running, "Worker active");
    }

    fn worker_stopped(&self, worker_id: WorkerId) {
        let Some((node, was_active)) = self.nodes.remove(worker_id) else {
            tracing::debug!(worker_id, "Stop reported for unknown worker");
            return;
        };
        self.registry.lock().remove(worker_id);

        let halted = self.halted.load(Ordering::SeqCst);
        let mut in_flight = node.running_jobs();
        for id in self.scheduler.running_on(worker_id) {
            if !in_flight.contains(&id) {
                tracing::error!(job_id = %id, worker_id, "Worker did not report a running job");
                in_flight.push(id);
            }
        }

        for id in in_flight {
            match self.scheduler.reclaim(worker_id, id, !halted) {
                Some(Reclaimed::Requeued) => {
                    tracing::info!(job_id = %id, worker_id, "Rescheduling job of stopped worker");
                }
                Some(Reclaimed::Cancelled) => {
                    tracing::debug!(job_id = %id, worker_id, "Cancelled job of stopped worker");
                }
                Some(Reclaimed::Abandoned) | None => {}
            }
        }

        if was_active {
            match self
                .running_nodes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            {
                Ok(1) if !halted => {
                    self.running_tx.send_replace(0);
                    self.ready.store(false, Ordering::SeqCst);
                    self.publish();
                }
                Ok(n) => {
                    self.running_tx.send_replace(n - 1);
                }
                Err(_) => {
                    tracing::error!(worker_id, "Running node count would go negative");
                    debug_assert!(false, "running node count underflow");
                }
            }
        }
        tracing::info!(
            worker_id,
            running_nodes = self.running_nodes.load(Ordering::SeqCst),
            "Worker stopped"
        );

        self.try_terminate();
    }

    /// Nothing is in flight after a shutdown: close every worker.
    fn halt_finished(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let nodes = self.nodes.snapshot();
        tracing::info!(count = nodes.len(), "Closing workers");
        for node in nodes {
            node.close();
        }
        self.try_terminate();
    }

    fn try_terminate(&self) {
        if !self.halted.load(Ordering::SeqCst)
            || !self.closing.load(Ordering::SeqCst)
            || self.terminated.load(Ordering::SeqCst)
            || self.running_nodes.load(Ordering::SeqCst) != 0
        {
            return;
        }

        let remaining = self.scheduler.close();
        let orphaned = self.scheduler.drain_running();
        if !orphaned.is_empty() {
            tracing::error!(count = orphaned.len(), "Jobs still running with no running workers");
        }
        let dangling = self.futures.cancel_all();
        if dangling > 0 {
            tracing::error!(count = dangling, "Cancelled futures with no job behind them");
        }

        self.ready.store(false, Ordering::SeqCst);
        self.terminated.store(true, Ordering::SeqCst);
        self.publish();
        tracing::info!(unexecuted = remaining.len(), "Cluster terminated");
    }
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        self.scheduler.close();
    }
}

async fn run_events(inner: Weak<ClusterInner>, mut rx: mpsc::UnboundedReceiver<ClusterEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        tracing::debug!(?event, "Cluster event");
        inner.handle_event(event);
    }
}
