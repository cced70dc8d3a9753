use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::config::SchedulerConfig;
use crate::digest::LayerDigest;
use crate::error::StratumError;
use crate::scheduler::assigner::WorkerPool;
use crate::scheduler::effects::{ClientEvent, Effect, RejectReason, WorkerCommand};
use crate::scheduler::job::{
    ClientId, FailureKind, Job, JobId, JobState, Outcome, OutputStream, ResultRecord, WorkerId,
};
use crate::scheduler::queue::JobQueue;
use crate::spec::{JobSpec, LayerManifest};

/// Answers whether the broker's canonical store already holds a layer.
pub trait LayerAvailability {
    fn has_layer(&self, digest: &LayerDigest) -> bool;
}

impl LayerAvailability for HashSet<LayerDigest> {
    fn has_layer(&self, digest: &LayerDigest) -> bool {
        self.contains(digest)
    }
}

/// A submission waiting for the client to upload layers.
#[derive(Debug)]
struct PendingAdmission {
    client: ClientId,
    request_id: u64,
    spec: JobSpec,
    manifest: LayerManifest,
    missing: HashSet<LayerDigest>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub requeued: u64,
    pub consistency_violations: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub name: String,
    pub slots: usize,
    pub free_slots: usize,
    pub cached_layers: usize,
}

#[derive(Debug, Clone)]
pub struct Statistics {
    pub workers: Vec<WorkerSnapshot>,
    pub pool_version: u64,
    pub num_clients: usize,
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub pending_admissions: usize,
    pub counters: Counters,
}

/// The broker's scheduling state machine.
///
/// Owns every job, allocation and worker record. It never performs I/O: each entry
/// point takes the current time and returns the messages that must be delivered, in
/// order. The broker actor is its only caller.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    jobs: JobQueue,
    pool: WorkerPool,
    clients: HashSet<ClientId>,
    pending: Vec<PendingAdmission>,
    /// Layer requests outstanding per client, so each layer is asked for once.
    requested: HashSet<(ClientId, LayerDigest)>,
    /// Cancellation deadlines for Scheduled/Executing jobs.
    cancels: HashMap<JobId, Instant>,
    next_seq: u64,
    counters: Counters,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let jobs = JobQueue::with_limits(config.max_queued_jobs, config.finished_job_retention);
        Self {
            config,
            jobs,
            pool: WorkerPool::new(),
            clients: HashSet::new(),
            pending: Vec::new(),
            requested: HashSet::new(),
            cancels: HashMap::new(),
            next_seq: 0,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ---- clients ----

    pub fn client_connected(&mut self, client: ClientId) {
        self.clients.insert(client);
        tracing::debug!(client_id = %client, "Client connected");
    }

    /// Cancel the client's pending admissions and Queued jobs. Jobs already on a
    /// worker run to completion; their results are recorded but not relayed.
    pub fn client_disconnected(&mut self, client: ClientId) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.clients.remove(&client) {
            return effects;
        }

        let before = self.pending.len();
        self.pending.retain(|p| p.client != client);
        self.requested.retain(|(c, _)| *c != client);

        let queued = self.jobs.queued_for_client(client);
        for job_id in &queued {
            self.jobs.dequeue(job_id);
            self.finish(*job_id, ResultRecord::cancelled(), &mut effects);
        }

        tracing::info!(
            client_id = %client,
            dropped_admissions = before - self.pending.len(),
            cancelled_jobs = queued.len(),
            "Client disconnected"
        );
        effects
    }

    /// Handle a submission. The job is accepted only once every layer it references
    /// is in the broker's store; missing layers are requested from the client.
    pub fn submit(
        &mut self,
        client: ClientId,
        request_id: u64,
        spec: JobSpec,
        manifest: LayerManifest,
        layers: &dyn LayerAvailability,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let Err(err) = spec.validate() {
            tracing::info!(client_id = %client, request_id, error = %err, "Rejecting job");
            effects.push(Effect::Client(
                client,
                ClientEvent::Rejected {
                    request_id,
                    reason: RejectReason::InvalidSpec,
                    message: err.to_string(),
                },
            ));
            return effects;
        }

        let unique = manifest.unique();
        let missing: HashSet<LayerDigest> = unique
            .iter()
            .filter(|d| !layers.has_layer(d))
            .copied()
            .collect();

        if missing.is_empty() {
            self.admit(client, request_id, spec, manifest, &mut effects);
            return effects;
        }

        for digest in unique.into_iter().filter(|d| missing.contains(d)) {
            if self.requested.insert((client, digest)) {
                tracing::debug!(client_id = %client, layer = %digest.short(), "Requesting layer");
                effects.push(Effect::Client(client, ClientEvent::LayerRequest { digest }));
            }
        }
        self.pending.push(PendingAdmission {
            client,
            request_id,
            spec,
            manifest,
            missing,
        });
        effects
    }

    /// A layer landed in the broker's store.
    pub fn layer_stored(&mut self, client: ClientId, digest: LayerDigest) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.requested.remove(&(client, digest));

        let mut ready = Vec::new();
        for mut pending in std::mem::take(&mut self.pending) {
            pending.missing.remove(&digest);
            if pending.missing.is_empty() {
                ready.push(pending);
            } else {
                self.pending.push(pending);
            }
        }
        for p in ready {
            self.admit(p.client, p.request_id, p.spec, p.manifest, &mut effects);
        }
        effects
    }

    /// The client could not supply `digest`; reject its submissions waiting for it.
    pub fn layer_unavailable(
        &mut self,
        client: ClientId,
        digest: LayerDigest,
        message: &str,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.requested.remove(&(client, digest));

        for pending in std::mem::take(&mut self.pending) {
            if pending.client == client && pending.missing.contains(&digest) {
                tracing::info!(
                    client_id = %client,
                    request_id = pending.request_id,
                    layer = %digest.short(),
                    "Rejecting job: layer unavailable"
                );
                effects.push(Effect::Client(
                    client,
                    ClientEvent::Rejected {
                        request_id: pending.request_id,
                        reason: RejectReason::InvalidSpec,
                        message: format!("layer {digest} unavailable: {message}"),
                    },
                ));
            } else {
                self.pending.push(pending);
            }
        }
        effects
    }

    /// Cancel a job. Queued jobs are cancelled at once; jobs on a worker are asked to
    /// stop and forced to Cancelled after `cancel_timeout`.
    pub fn cancel(&mut self, job_id: JobId, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(job) = self.jobs.get_job(&job_id) else {
            tracing::warn!(job_id = %job_id, "Cancel for unknown job");
            return effects;
        };

        let (state, assigned) = (job.state, job.assigned_worker);

        match state {
            JobState::Queued => {
                self.jobs.dequeue(&job_id);
                self.finish(job_id, ResultRecord::cancelled(), &mut effects);
            }
            JobState::Scheduled | JobState::Executing => {
                if self.cancels.contains_key(&job_id) {
                    return effects;
                }
                let Some(worker) = assigned else {
                    self.violation(None, Some(job_id), "allocated job has no worker");
                    return effects;
                };
                tracing::info!(job_id = %job_id, worker_id = %worker, "Cancelling job");
                self.cancels
                    .insert(job_id, now + self.config.cancel_timeout);
                effects.push(Effect::Worker(worker, WorkerCommand::Cancel { job_id }));
            }
            state => {
                tracing::debug!(job_id = %job_id, state = %state, "Cancel for finished job ignored");
            }
        }
        effects
    }

    // ---- workers ----

    pub fn register_worker(
        &mut self,
        name: String,
        slots: usize,
        cached_layers: HashSet<LayerDigest>,
        now: Instant,
    ) -> (WorkerId, Vec<Effect>) {
        let worker_id = self.pool.admit(name, slots, cached_layers, now);
        let mut effects = vec![Effect::Worker(
            worker_id,
            WorkerCommand::Registered {
                worker_id,
                heartbeat_interval: self.config.heartbeat_interval,
            },
        )];
        self.schedule(&mut effects);
        (worker_id, effects)
    }

    /// The worker's session ended.
    pub fn worker_disconnected(&mut self, worker_id: WorkerId) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.pool.contains(&worker_id) {
            tracing::warn!(worker_id = %worker_id, "Worker session closed");
            self.lose_worker(worker_id, &mut effects);
        }
        effects
    }

    pub fn heartbeat(
        &mut self,
        worker_id: WorkerId,
        executing: usize,
        added: &[LayerDigest],
        evicted: &[LayerDigest],
        now: Instant,
    ) {
        self.pool.touch(&worker_id, now);
        let Some(worker) = self.pool.get_mut(&worker_id) else {
            tracing::debug!(worker_id = %worker_id, "Heartbeat from unknown worker");
            return;
        };
        for digest in evicted {
            worker.cached_layers.remove(digest);
        }
        worker.cached_layers.extend(added.iter().copied());
        worker.confirm_cached(added);
        worker.reported_executing = executing;

        let (slots, occupied) = (worker.slots, worker.occupied_slots());
        if executing > slots {
            self.violation(
                Some(worker_id),
                None,
                format!("worker reports {executing} running jobs on {slots} slots"),
            );
        } else if executing > occupied {
            self.violation(
                Some(worker_id),
                None,
                format!("worker reports {executing} running jobs, broker assigned {occupied}"),
            );
        }
    }

    pub fn job_started(&mut self, worker_id: WorkerId, job_id: JobId, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.pool.touch(&worker_id, now);
        let Some(worker) = self.pool.get(&worker_id) else {
            return effects;
        };
        if worker.is_draining(&job_id) {
            return effects;
        }
        if worker.slot_of(&job_id).is_none() {
            self.violation(Some(worker_id), Some(job_id), "start reported for unallocated job");
            return effects;
        }

        let Some(job) = self.jobs.get_job_mut(&job_id) else {
            return effects;
        };
        if job.state != JobState::Scheduled {
            return effects;
        }
        if job.transition(JobState::Executing).is_ok() {
            let client = job.client;
            tracing::debug!(job_id = %job_id, worker_id = %worker_id, "Job executing");
            self.notify(
                client,
                ClientEvent::StateChanged {
                    job_id,
                    state: JobState::Executing,
                },
                &mut effects,
            );
        }
        effects
    }

    /// Relay output for an allocated job to its client.
    pub fn job_output(
        &mut self,
        worker_id: WorkerId,
        job_id: JobId,
        stream: OutputStream,
        data: Vec<u8>,
        now: Instant,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.pool.touch(&worker_id, now);
        let allocated = self
            .pool
            .get(&worker_id)
            .is_some_and(|w| w.slot_of(&job_id).is_some());
        if !allocated {
            return effects;
        }
        if let Some(job) = self.jobs.get_job(&job_id) {
            let client = job.client;
            self.notify(
                client,
                ClientEvent::Output {
                    job_id,
                    stream,
                    data,
                },
                &mut effects,
            );
        }
        effects
    }

    pub fn job_completed(
        &mut self,
        worker_id: WorkerId,
        job_id: JobId,
        result: ResultRecord,
        now: Instant,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.pool.touch(&worker_id, now);
        let Some(worker) = self.pool.get_mut(&worker_id) else {
            tracing::debug!(worker_id = %worker_id, job_id = %job_id, "Result from unknown worker dropped");
            return effects;
        };

        if worker.finish_draining(&job_id) {
            tracing::debug!(job_id = %job_id, worker_id = %worker_id, "Forcibly cancelled job finished on worker");
            self.schedule(&mut effects);
            return effects;
        }
        let fetch_failed = matches!(
            &result.outcome,
            Outcome::Failed(reason) if reason.kind == FailureKind::LayerFetch
        );
        if fetch_failed && worker.slot_of(&job_id).is_some() {
            let retracted = worker.retract_assumed(&job_id);
            tracing::debug!(job_id = %job_id, worker_id = %worker_id, retracted, "Layer fetch failed, dropping assumed layers");
        }
        if worker.release(&job_id).is_none() {
            self.violation(Some(worker_id), Some(job_id), "completion reported for unallocated job");
            return effects;
        }

        self.finish(job_id, result, &mut effects);
        self.schedule(&mut effects);
        effects
    }

    /// The worker had no free slot for an assignment we believed fit. The job goes
    /// back to the front of the queue without charging an attempt.
    pub fn assignment_refused(
        &mut self,
        worker_id: WorkerId,
        job_id: JobId,
        reason: &str,
        now: Instant,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.pool.touch(&worker_id, now);
        self.counters.consistency_violations += 1;
        tracing::error!(worker_id = %worker_id, job_id = %job_id, reason, "Worker refused assignment");

        let released = self
            .pool
            .get_mut(&worker_id)
            .is_some_and(|w| w.release(&job_id).is_some());
        if !released {
            return effects;
        }
        if self.cancels.contains_key(&job_id) {
            self.finish(job_id, ResultRecord::cancelled(), &mut effects);
            return effects;
        }
        if self.return_to_queue(job_id, &mut effects) {
            self.jobs.requeue_front(vec![job_id]);
        }
        // Not rescheduled here: the next tick or event retries, so a worker that keeps
        // refusing cannot spin the actor.
        effects
    }

    /// Liveness checks, cancellation deadlines and a scheduling pass.
    pub fn tick(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();

        for worker_id in self
            .pool
            .dead_workers(now, self.config.heartbeat_timeout)
        {
            tracing::warn!(worker_id = %worker_id, "Worker missed heartbeats, declaring it lost");
            effects.push(Effect::DisconnectWorker(worker_id));
            self.lose_worker(worker_id, &mut effects);
        }

        let mut expired: Vec<JobId> = self
            .cancels
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort();
        for job_id in expired {
            self.force_cancel(job_id, &mut effects);
        }

        self.schedule(&mut effects);
        effects
    }

    // ---- queries ----

    pub fn job(&self, job_id: &JobId) -> Option<&Job> {
        self.jobs.get_job(job_id)
    }

    /// Retained jobs, oldest first.
    pub fn jobs(&self) -> Vec<&Job> {
        self.jobs.all_jobs()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn statistics(&self) -> Statistics {
        let workers = self
            .pool
            .all_workers()
            .into_iter()
            .map(|w| WorkerSnapshot {
                id: w.id,
                name: w.name.clone(),
                slots: w.slots,
                free_slots: w.free_slots(),
                cached_layers: w.cached_layers.len(),
            })
            .collect();
        Statistics {
            workers,
            pool_version: self.pool.version(),
            num_clients: self.clients.len(),
            queued_jobs: self.jobs.queued_len(),
            running_jobs: self.jobs.jobs_in_state(JobState::Scheduled)
                + self.jobs.jobs_in_state(JobState::Executing),
            pending_admissions: self.pending.len(),
            counters: self.counters.clone(),
        }
    }

    // ---- internals ----

    fn admit(
        &mut self,
        client: ClientId,
        request_id: u64,
        spec: JobSpec,
        manifest: LayerManifest,
        effects: &mut Vec<Effect>,
    ) {
        if self.jobs.is_full() {
            tracing::warn!(client_id = %client, request_id, "Job queue at capacity, rejecting");
            effects.push(Effect::Client(
                client,
                ClientEvent::Rejected {
                    request_id,
                    reason: RejectReason::QueueFull,
                    message: format!(
                        "queue holds {} jobs",
                        self.jobs.queued_len()
                    ),
                },
            ));
            return;
        }

        let job_id = JobId::new();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs
            .add_job(Job::new(job_id, client, seq, spec, manifest));
        tracing::info!(job_id = %job_id, client_id = %client, "Job accepted");

        effects.push(Effect::Client(
            client,
            ClientEvent::Accepted { request_id, job_id },
        ));
        self.notify(
            client,
            ClientEvent::StateChanged {
                job_id,
                state: JobState::Queued,
            },
            effects,
        );
        self.schedule(effects);
    }

    /// Assign queued jobs while any worker has a free slot.
    fn schedule(&mut self, effects: &mut Vec<Effect>) {
        while self.pool.has_free_slot() {
            let window = self.jobs.window(self.config.lookahead.max(1));
            let Some((index, worker_id)) = self.pick(&window) else {
                break;
            };
            for passed_over in &window[..index] {
                if let Some(job) = self.jobs.get_job_mut(passed_over) {
                    job.skips += 1;
                }
            }
            if !self.assign(window[index], worker_id, effects) {
                break;
            }
        }
    }

    /// Choose the job to run next and its worker. A starved job goes first; otherwise
    /// the job with the most cache hits on its best worker, oldest on ties.
    fn pick(&self, window: &[JobId]) -> Option<(usize, WorkerId)> {
        let mut best: Option<(usize, WorkerId, usize)> = None;
        for (index, job_id) in window.iter().enumerate() {
            let Some(job) = self.jobs.get_job(job_id) else {
                continue;
            };
            let (worker_id, hits) = self.pool.best_worker(&job.manifest)?;
            if job.skips >= self.config.max_skips {
                return Some((index, worker_id));
            }
            if best.map_or(true, |(_, _, most)| hits > most) {
                best = Some((index, worker_id, hits));
            }
        }
        best.map(|(index, worker_id, _)| (index, worker_id))
    }

    fn assign(&mut self, job_id: JobId, worker_id: WorkerId, effects: &mut Vec<Effect>) -> bool {
        if !self.jobs.dequeue(&job_id) {
            return false;
        }
        let (Some(job), Some(worker)) = (
            self.jobs.get_job_mut(&job_id),
            self.pool.get_mut(&worker_id),
        ) else {
            return false;
        };
        let Some(slot) = worker.allocate(job_id) else {
            self.jobs.requeue_front(vec![job_id]);
            self.violation(Some(worker_id), Some(job_id), "no slot for chosen worker");
            return false;
        };
        if let Err(err) = job.transition(JobState::Scheduled) {
            worker.release(&job_id);
            tracing::error!(error = %err, "Cannot schedule job");
            self.counters.consistency_violations += 1;
            return false;
        }
        job.assigned_worker = Some(worker_id);
        worker.assume_cached(job_id, &job.manifest);

        let client = job.client;
        let command = WorkerCommand::Assign {
            job_id,
            spec: job.spec.clone(),
            manifest: job.manifest.clone(),
        };
        tracing::info!(job_id = %job_id, worker_id = %worker_id, slot, "Job scheduled");

        effects.push(Effect::Worker(worker_id, command));
        self.notify(
            client,
            ClientEvent::StateChanged {
                job_id,
                state: JobState::Scheduled,
            },
            effects,
        );
        true
    }

    /// Move an allocated job back to Queued. The caller puts it in the run queue.
    fn return_to_queue(&mut self, job_id: JobId, effects: &mut Vec<Effect>) -> bool {
        let Some(job) = self.jobs.get_job_mut(&job_id) else {
            return false;
        };
        if let Err(err) = job.transition(JobState::Queued) {
            tracing::error!(error = %err, "Cannot requeue job");
            self.counters.consistency_violations += 1;
            return false;
        }
        job.assigned_worker = None;
        let client = job.client;
        self.notify(
            client,
            ClientEvent::StateChanged {
                job_id,
                state: JobState::Queued,
            },
            effects,
        );
        true
    }

    fn lose_worker(&mut self, worker_id: WorkerId, effects: &mut Vec<Effect>) {
        let Some(worker) = self.pool.remove(worker_id) else {
            return;
        };

        let mut requeued = Vec::new();
        for job_id in worker.allocated_jobs() {
            if self.cancels.contains_key(&job_id) {
                self.finish(job_id, ResultRecord::cancelled(), effects);
                continue;
            }
            let Some(job) = self.jobs.get_job_mut(&job_id) else {
                continue;
            };
            job.attempts += 1;
            let attempts = job.attempts;
            if attempts > self.config.max_requeues {
                tracing::warn!(job_id = %job_id, attempts, "Job lost its worker too many times");
                self.finish(
                    job_id,
                    ResultRecord::failed(
                        FailureKind::WorkerLost,
                        format!("worker {worker_id} lost after {} requeues", attempts - 1),
                    ),
                    effects,
                );
                continue;
            }
            if self.return_to_queue(job_id, effects) {
                tracing::info!(job_id = %job_id, worker_id = %worker_id, attempts, "Requeueing job");
                self.counters.requeued += 1;
                requeued.push(job_id);
            }
        }
        self.jobs.requeue_front(requeued);
        self.schedule(effects);
    }

    fn force_cancel(&mut self, job_id: JobId, effects: &mut Vec<Effect>) {
        self.cancels.remove(&job_id);
        let worker_id = self.jobs.get_job(&job_id).and_then(|j| j.assigned_worker);
        if let Some(worker) = worker_id.and_then(|id| self.pool.get_mut(&id)) {
            worker.drain(job_id);
        }
        tracing::warn!(job_id = %job_id, worker_id = ?worker_id, "Cancellation timed out, forcing job to Cancelled");
        self.finish(job_id, ResultRecord::cancelled(), effects);
    }

    /// Record a terminal result and tell the client.
    fn finish(&mut self, job_id: JobId, result: ResultRecord, effects: &mut Vec<Effect>) {
        self.cancels.remove(&job_id);
        let Some(job) = self.jobs.get_job_mut(&job_id) else {
            return;
        };
        let client = job.client;
        let state = match job.finish(result.clone()) {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(error = %err, "Job finished twice");
                self.counters.consistency_violations += 1;
                return;
            }
        };
        match state {
            JobState::Completed => self.counters.completed += 1,
            JobState::Failed => self.counters.failed += 1,
            JobState::Cancelled => self.counters.cancelled += 1,
            _ => {}
        }
        tracing::info!(job_id = %job_id, state = %state, "Job finished");

        self.notify(client, ClientEvent::StateChanged { job_id, state }, effects);
        self.notify(client, ClientEvent::Completed { job_id, result }, effects);
        self.jobs.mark_finished(job_id);
    }

    /// Queue an event for a client that is still connected.
    fn notify(&self, client: ClientId, event: ClientEvent, effects: &mut Vec<Effect>) {
        if self.clients.contains(&client) {
            effects.push(Effect::Client(client, event));
        }
    }

    fn violation(
        &mut self,
        worker_id: Option<WorkerId>,
        job_id: Option<JobId>,
        what: impl Into<String>,
    ) {
        self.counters.consistency_violations += 1;
        let err = StratumError::ConsistencyViolation(what.into());
        tracing::error!(worker_id = ?worker_id, job_id = ?job_id, error = %err, "Worker and broker disagree");
    }
}
