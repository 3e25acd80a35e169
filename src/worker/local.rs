use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinError;

use crate::config::NodeParams;
use crate::error::JobError;
use crate::scheduler::{Completion, Job, JobId, JobResult};
use crate::worker::{WorkerEvents, WorkerId, WorkerNode, WorkerState};

#[derive(Debug)]
struct LocalState {
    accepting: bool,
    stopped: bool,
    running: HashSet<JobId>,
    events: Option<WorkerEvents>,
}

/// Runs jobs in-process on tokio's blocking pool.
///
/// A cancelled job keeps running on its thread until the callable returns;
/// its result is discarded and its slot is freed immediately.
#[derive(Debug, Clone)]
pub struct LocalWorker {
    id: WorkerId,
    host: String,
    threads: usize,
    state: Arc<Mutex<LocalState>>,
}

impl LocalWorker {
    pub fn new(id: WorkerId, host: impl Into<String>, threads: usize) -> Self {
        Self {
            id,
            host: host.into(),
            threads,
            state: Arc::new(Mutex::new(LocalState {
                accepting: true,
                stopped: false,
                running: HashSet::new(),
                events: None,
            })),
        }
    }

    pub fn from_params(params: &NodeParams) -> Self {
        Self::new(params.id, params.host.clone(), params.threads.max(1))
    }

    pub fn thread_limit(&self) -> usize {
        self.threads
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    fn finish(state: &Mutex<LocalState>, job_id: JobId, completion: Completion, result: JobResult) {
        {
            let mut state = state.lock();
            if state.stopped || !state.running.remove(&job_id) {
                tracing::debug!(job_id = %job_id, "Discarding result of cancelled or abandoned job");
                return;
            }
        }
        completion.complete(result);
    }
}

fn join_error_to_job_error(e: JoinError) -> JobError {
    if e.is_panic() {
        let payload = e.into_panic();
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        JobError::Panicked(msg)
    } else {
        JobError::Failed(e.to_string())
    }
}

impl WorkerNode for LocalWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn available_threads(&self) -> usize {
        let state = self.state.lock();
        if state.stopped || !state.accepting {
            return 0;
        }
        self.threads.saturating_sub(state.running.len())
    }

    fn submit(&self, job: &Job, on_complete: Completion) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            tracing::error!(worker_id = self.id, "No tokio runtime available to run job");
            return false;
        };

        {
            let mut state = self.state.lock();
            if state.stopped
                || !state.accepting
                || state.running.len() >= self.threads
                || !state.running.insert(job.id)
            {
                return false;
            }
        }

        let job_id = job.id;
        let task = job.task.clone();
        let state = self.state.clone();
        let worker_id = self.id;
        runtime.spawn(async move {
            tracing::debug!(job_id = %job_id, worker_id, "Executing job");
            let result = match tokio::task::spawn_blocking(move || task.run()).await {
                Ok(result) => result,
                Err(e) => Err(join_error_to_job_error(e)),
            };
            LocalWorker::finish(&state, job_id, on_complete, result);
        });
        true
    }

    fn cancel(&self, job_id: JobId) -> bool {
        let mut state = self.state.lock();
        !state.stopped && state.running.remove(&job_id)
    }

    fn running_jobs(&self) -> Vec<JobId> {
        self.state.lock().running.iter().copied().collect()
    }

    fn stop_accepting(&self) {
        self.state.lock().accepting = false;
        tracing::debug!(worker_id = self.id, "Worker stopped accepting jobs");
    }

    fn close(&self) {
        let events = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.accepting = false;
            state.events.clone()
        };
        tracing::info!(worker_id = self.id, host = %self.host, "Worker closed");
        if let Some(events) = events {
            events.report(self.id, WorkerState::Stopped);
        }
    }

    fn attach(&self, events: WorkerEvents) {
        let stopped = {
            let mut state = self.state.lock();
            state.events = Some(events.clone());
            state.stopped
        };
        if !stopped {
            events.report(self.id, WorkerState::Active);
        }
    }
}
