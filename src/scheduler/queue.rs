use std::collections::VecDeque;

use crate::scheduler::job::{Job, JobId, JobStatus};

/// The two FIFO queues feeding the scheduler.
///
/// `normal` holds externally submitted jobs and is bounded. `priority` holds
/// jobs being requeued after a failed dispatch or a lost worker and accepts
/// every requeue; `priority_capacity` only sizes its share of the free-slot
/// count. Non-priority insertions must leave `guaranteed_capacity` free slots
/// across both queues, so submissions throttle before requeues pile up.
#[derive(Debug)]
pub struct JobQueues {
    normal: VecDeque<Job>,
    priority: VecDeque<Job>,
    normal_capacity: usize,
    priority_capacity: usize,
    guaranteed_capacity: usize,
}

impl JobQueues {
    pub fn new(normal_capacity: usize, priority_capacity: usize, guaranteed_capacity: usize) -> Self {
        Self {
            normal: VecDeque::new(),
            priority: VecDeque::new(),
            normal_capacity,
            priority_capacity,
            guaranteed_capacity,
        }
    }

    /// Free slots across both queues.
    pub fn remaining_capacity(&self) -> usize {
        self.normal_capacity.saturating_sub(self.normal.len())
            + self.priority_capacity.saturating_sub(self.priority.len())
    }

    pub fn guaranteed_capacity(&self) -> usize {
        self.guaranteed_capacity
    }

    /// Place a job on the priority queue or the normal queue.
    ///
    /// Priority insertions always succeed. A normal insertion returns the job
    /// back when the normal queue is full or it would eat into the guaranteed
    /// reserve. Any previous worker assignment is cleared.
    pub fn push(&mut self, mut job: Job, priority: bool) -> Result<(), Job> {
        if priority {
            self.requeue(job);
            return Ok(());
        }
        if self.normal.len() >= self.normal_capacity
            || self.remaining_capacity() < self.guaranteed_capacity
        {
            return Err(job);
        }
        job.assigned_worker = None;
        self.normal.push_back(job);
        Ok(())
    }

    /// Put a job back at the tail of the priority queue.
    pub fn requeue(&mut self, mut job: Job) {
        job.assigned_worker = None;
        self.priority.push_back(job);
    }

    /// Next job to dispatch. The priority queue always wins when non-empty;
    /// the normal queue is only consulted when `include_normal` is set.
    pub fn pop_next(&mut self, include_normal: bool) -> Option<Job> {
        if let Some(job) = self.priority.pop_front() {
            return Some(job);
        }
        if include_normal {
            self.normal.pop_front()
        } else {
            None
        }
    }

    /// Remove a job by id, searching the priority queue first.
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        if let Some(pos) = self.priority.iter().position(|j| j.id == id) {
            return self.priority.remove(pos);
        }
        if let Some(pos) = self.normal.iter().position(|j| j.id == id) {
            return self.normal.remove(pos);
        }
        None
    }

    pub fn status_of(&self, id: JobId) -> Option<JobStatus> {
        if self.priority.iter().any(|j| j.id == id) {
            Some(JobStatus::Requeued)
        } else if self.normal.iter().any(|j| j.id == id) {
            Some(JobStatus::Queued)
        } else {
            None
        }
    }

    /// Empty both queues, priority jobs first.
    pub fn drain_all(&mut self) -> Vec<Job> {
        self.priority.drain(..).chain(self.normal.drain(..)).collect()
    }

    pub fn normal_len(&self) -> usize {
        self.normal.len()
    }

    pub fn priority_len(&self) -> usize {
        self.priority.len()
    }

    pub fn len(&self) -> usize {
        self.normal.len() + self.priority.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.priority.is_empty()
    }
}
