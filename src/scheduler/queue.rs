use std::collections::{HashMap, VecDeque};

use crate::scheduler::job::{ClientId, Job, JobId, JobState};

const DEFAULT_MAX_QUEUED: usize = 10_000;
const DEFAULT_RETENTION: usize = 10_000;

/// Job records plus the FIFO run queue.
///
/// Every job the broker accepted lives in `jobs` until it is finished and pushed out
/// of the retention window. `queue` holds the ids of Queued jobs in scheduling order.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<JobId, Job>,
    queue: VecDeque<JobId>,
    finished: VecDeque<JobId>,
    max_queued: usize,
    retention: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_QUEUED, DEFAULT_RETENTION)
    }

    pub fn with_limits(max_queued: usize, retention: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            queue: VecDeque::new(),
            finished: VecDeque::new(),
            max_queued,
            retention,
        }
    }

    /// Add a new Queued job at the back. Returns false if the queue is at capacity.
    pub fn add_job(&mut self, job: Job) -> bool {
        if self.is_full() {
            return false;
        }
        debug_assert_eq!(job.state, JobState::Queued);
        self.queue.push_back(job.id);
        self.jobs.insert(job.id, job);
        true
    }

    pub fn get_job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_job_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Put requeued jobs back at the front, oldest submission first.
    pub fn requeue_front(&mut self, mut ids: Vec<JobId>) {
        ids.sort_by_key(|id| self.jobs.get(id).map(|j| j.seq).unwrap_or(u64::MAX));
        for id in ids.into_iter().rev() {
            self.queue.push_front(id);
        }
    }

    /// Take a job out of the run queue. Returns false if it was not queued.
    pub fn dequeue(&mut self, id: &JobId) -> bool {
        match self.queue.iter().position(|queued| queued == id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Ids of the first `n` queued jobs, in scheduling order.
    pub fn window(&self, n: usize) -> Vec<JobId> {
        self.queue.iter().take(n).copied().collect()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Queued jobs belonging to `client`.
    pub fn queued_for_client(&self, client: ClientId) -> Vec<JobId> {
        self.queue
            .iter()
            .filter(|id| self.jobs.get(id).is_some_and(|j| j.client == client))
            .copied()
            .collect()
    }

    /// Note that a job reached a terminal state; drops the oldest finished records
    /// beyond the retention window. Returns the number of records dropped.
    pub fn mark_finished(&mut self, id: JobId) -> usize {
        self.finished.push_back(id);
        let mut dropped = 0;
        while self.finished.len() > self.retention {
            if let Some(old) = self.finished.pop_front() {
                self.jobs.remove(&old);
                dropped += 1;
            }
        }
        dropped
    }

    /// All jobs sorted chronologically by creation time
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| (j.created_at, j.seq));
        jobs
    }

    pub fn jobs_in_state(&self, state: JobState) -> usize {
        self.jobs.values().filter(|j| j.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Returns true if no more jobs may be queued.
    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_queued
    }
}
