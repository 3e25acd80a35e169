use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{CancelError, JobError};
use crate::scheduler::{JobId, JobResult, Scheduler};

/// Terminal state of a job as seen by its future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FutureStatus {
    Pending,
    /// The job ran (successfully or not) or could not be rescheduled.
    Completed,
    Cancelled,
    /// Refused at submission; resolves to an empty result.
    Rejected,
}

pub(crate) enum Resolution {
    Completed(JobResult),
    Cancelled,
    Rejected,
}

pub(crate) struct FutureCell {
    status: watch::Sender<FutureStatus>,
    outcome: Mutex<Option<JobResult>>,
}

impl FutureCell {
    fn new() -> Self {
        let (status, _) = watch::channel(FutureStatus::Pending);
        Self {
            status,
            outcome: Mutex::new(None),
        }
    }

    /// Move out of `Pending`. Only the first resolution wins.
    fn resolve(&self, resolution: Resolution) -> bool {
        let mut outcome = self.outcome.lock();
        if *self.status.borrow() != FutureStatus::Pending {
            return false;
        }
        let status = match resolution {
            Resolution::Completed(result) => {
                *outcome = Some(result);
                FutureStatus::Completed
            }
            Resolution::Cancelled => FutureStatus::Cancelled,
            Resolution::Rejected => FutureStatus::Rejected,
        };
        self.status.send_replace(status);
        true
    }

    fn status(&self) -> FutureStatus {
        *self.status.borrow()
    }
}

impl fmt::Debug for FutureCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureCell")
            .field("status", &self.status())
            .finish()
    }
}

/// Pending futures keyed by job id. An entry is removed at the moment it is
/// resolved, which is what makes resolution happen at most once.
#[derive(Debug, Default)]
pub struct FutureTable {
    cells: Mutex<HashMap<JobId, Arc<FutureCell>>>,
}

impl FutureTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: JobId) -> Arc<FutureCell> {
        let cell = Arc::new(FutureCell::new());
        self.cells.lock().insert(id, cell.clone());
        cell
    }

    /// Remove and resolve the entry for `id`. Returns false if it was already
    /// gone.
    pub(crate) fn resolve(&self, id: JobId, resolution: Resolution) -> bool {
        let cell = self.cells.lock().remove(&id);
        match cell {
            Some(cell) => cell.resolve(resolution),
            None => false,
        }
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.cells.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.lock().is_empty()
    }

    /// Cancel everything still pending.
    pub(crate) fn cancel_all(&self) -> usize {
        let cells: Vec<_> = self.cells.lock().drain().map(|(_, c)| c).collect();
        cells
            .iter()
            .filter(|c| c.resolve(Resolution::Cancelled))
            .count()
    }
}

/// Caller-facing handle for one submitted job.
pub struct JobFuture<T> {
    id: JobId,
    cell: Arc<FutureCell>,
    scheduler: Scheduler,
    _output: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> JobFuture<T> {
    pub(crate) fn new(id: JobId, cell: Arc<FutureCell>, scheduler: Scheduler) -> Self {
        Self {
            id,
            cell,
            scheduler,
            _output: PhantomData,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> FutureStatus {
        self.cell.status()
    }

    pub fn is_done(&self) -> bool {
        self.status() != FutureStatus::Pending
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == FutureStatus::Cancelled
    }

    /// Cancel the job. A queued job is always cancellable; a running one only
    /// with `may_interrupt_if_running`, and then the result is never delivered
    /// even if the worker keeps executing it.
    pub fn cancel(&self, may_interrupt_if_running: bool) -> Result<bool, CancelError> {
        if self.is_done() {
            return Ok(false);
        }
        self.scheduler.cancel_job(self.id, may_interrupt_if_running)
    }

    /// Wait until the future leaves `Pending`.
    pub async fn wait(&self) {
        let mut rx = self.cell.status.subscribe();
        // The sender lives in `self.cell`, so the channel cannot close here.
        let _ = rx.wait_for(|s| *s != FutureStatus::Pending).await;
    }

    /// Wait for the outcome. `Ok(None)` means the submission was rejected.
    pub async fn get(self) -> Result<Option<T>, JobError> {
        self.wait().await;
        self.take()
    }

    pub async fn get_timeout(self, timeout: Duration) -> Result<Option<T>, JobError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(()) => self.take(),
            Err(_) => Err(JobError::TimedOut(self.id)),
        }
    }

    fn take(&self) -> Result<Option<T>, JobError> {
        match self.status() {
            FutureStatus::Rejected => Ok(None),
            FutureStatus::Cancelled => Err(JobError::Cancelled(self.id)),
            FutureStatus::Pending => Err(JobError::TimedOut(self.id)),
            FutureStatus::Completed => match self.cell.outcome.lock().take() {
                Some(Ok(value)) => value
                    .downcast::<T>()
                    .map(|v| Some(*v))
                    .map_err(|_| JobError::TypeMismatch(self.id)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            },
        }
    }
}

impl<T> fmt::Debug for JobFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobFuture")
            .field("id", &self.id)
            .field("status", &self.cell.status())
            .finish()
    }
}
