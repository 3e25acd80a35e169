use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::worker::WorkerId;

/// Type-erased value produced by a task. [`JobFuture`](crate::future::JobFuture)
/// downcasts it back to the caller's type.
pub type JobOutput = Box<dyn Any + Send>;

pub type JobResult = Result<JobOutput, JobError>;

/// Unique, monotonically increasing job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out job ids. One per cluster, never reset, so ids stay unique across
/// `reset()` cycles.
#[derive(Debug)]
pub struct JobIdAllocator {
    next: AtomicU64,
}

impl JobIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> JobId {
        JobId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for JobIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The callable carried by a job.
///
/// A task may run more than once: when its worker stops mid-job the job is
/// requeued and the same task is dispatched again, so it is `Fn`, not `FnOnce`.
#[derive(Clone)]
pub struct Task(Arc<dyn Fn() -> JobResult + Send + Sync>);

impl Task {
    /// Wrap an infallible callable. A panic inside it is reported by the
    /// worker as [`JobError::Panicked`].
    pub fn from_fn<T, F>(f: F) -> Self
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self(Arc::new(move || Ok(Box::new(f()) as JobOutput)))
    }

    /// Wrap a fallible callable; its error is rendered into [`JobError::Failed`].
    pub fn from_fallible<T, E, F>(f: F) -> Self
    where
        T: Send + 'static,
        E: fmt::Display,
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        Self(Arc::new(move || match f() {
            Ok(value) => Ok(Box::new(value) as JobOutput),
            Err(e) => Err(JobError::Failed(e.to_string())),
        }))
    }

    pub fn run(&self) -> JobResult {
        (self.0)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task(..)")
    }
}

/// Where a job currently lives inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Requeued,
    Running,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Requeued => write!(f, "requeued"),
            JobStatus::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub task: Task,
    pub assigned_worker: Option<WorkerId>,
    /// Number of times this job has been handed to a worker.
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, task: Task) -> Self {
        Self {
            id,
            task,
            assigned_worker: None,
            attempts: 0,
            submitted_at: Utc::now(),
        }
    }

    pub fn into_task(self) -> Task {
        self.task
    }
}
