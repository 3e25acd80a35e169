//! Worker node contract.
//!
//! The coordinator never talks to a transport directly. Anything that can run
//! jobs (a remote process behind a socket, an in-process thread pool) plugs in
//! by implementing [`WorkerNode`]:
//!
//! - **Capacity**: [`WorkerNode::available_threads`] is polled by the scheduler
//!   loop to find a free node
//! - **Dispatch**: [`WorkerNode::submit`] accepts a job together with a
//!   [`Completion`] handle that must be fired once when the job finishes
//! - **Cancellation**: [`WorkerNode::cancel`] drops a running job
//! - **Lifecycle**: transitions to [`WorkerState::Active`] and
//!   [`WorkerState::Stopped`] are reported exactly once each through the
//!   [`WorkerEvents`] handle given in [`WorkerNode::attach`]
//!
//! Transport failures are the implementation's problem: they must turn into a
//! `false` from `submit`/`cancel` or a `Stopped` report.
//!
//! [`LocalWorker`] is the in-process implementation used by the binary and
//! the tests.

pub mod local;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cluster::ClusterEvent;
use crate::scheduler::{Completion, Job, JobId};

pub use local::LocalWorker;

pub type WorkerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Active,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Active => write!(f, "active"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

pub trait WorkerNode: Send + Sync + fmt::Debug {
    fn id(&self) -> WorkerId;

    fn host(&self) -> &str;

    /// Free job slots right now. Zero once the node stops accepting work.
    fn available_threads(&self) -> usize;

    /// Start running `job`. Returns false if the node did not take it, in
    /// which case `on_complete` is dropped without firing.
    fn submit(&self, job: &Job, on_complete: Completion) -> bool;

    /// Cancel a running job. Returns false if the node does not hold it or
    /// could not reach the remote side.
    fn cancel(&self, job_id: JobId) -> bool;

    /// Jobs currently in flight. After a `Stopped` transition this reports the
    /// jobs that were in flight and never completed.
    fn running_jobs(&self) -> Vec<JobId>;

    /// Keep running what is in flight but refuse new submissions.
    fn stop_accepting(&self);

    /// Forceful teardown; in-flight jobs are abandoned and the node reports
    /// `Stopped`.
    fn close(&self);

    /// Called once when the node joins a cluster; lifecycle transitions are
    /// reported through `events` from then on.
    fn attach(&self, events: WorkerEvents);
}

/// Sending half of the coordinator's event channel, handed to each worker.
#[derive(Debug, Clone)]
pub struct WorkerEvents {
    tx: mpsc::UnboundedSender<ClusterEvent>,
}

impl WorkerEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ClusterEvent>) -> Self {
        Self { tx }
    }

    /// Report a lifecycle transition. Returns false if the cluster is gone.
    pub fn report(&self, worker_id: WorkerId, state: WorkerState) -> bool {
        self.tx
            .send(ClusterEvent::WorkerStateChanged { worker_id, state })
            .is_ok()
    }
}
