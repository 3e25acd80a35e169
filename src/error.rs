use thiserror::Error;

use crate::cluster::ClusterState;
use crate::scheduler::JobId;
use crate::worker::WorkerId;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation not allowed while cluster is {0}")]
    InvalidState(ClusterState),

    #[error("No tokio runtime available")]
    NoRuntime,

    #[error("Worker already registered: {0}")]
    DuplicateWorker(WorkerId),

    #[error("Job {job_id} failed: {source}")]
    JobFailed {
        job_id: JobId,
        #[source]
        source: JobError,
    },

    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Outcome errors observed through a [`JobFuture`](crate::future::JobFuture).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job {0} was cancelled")]
    Cancelled(JobId),

    #[error("Job failed: {0}")]
    Failed(String),

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error("Timed out waiting for job {0}")]
    TimedOut(JobId),

    #[error("Job {0} produced a result of an unexpected type")]
    TypeMismatch(JobId),
}

/// Why a forced cancellation of a running job did not go through.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CancelError {
    #[error("Job {job_id} is running on worker {worker_id}, which is no longer registered")]
    WorkerNotFound { job_id: JobId, worker_id: WorkerId },

    #[error("Worker {worker_id} refused to cancel job {job_id}")]
    Refused { job_id: JobId, worker_id: WorkerId },
}

pub type Result<T> = std::result::Result<T, DispatchError>;
