use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::digest::LayerDigest;
use crate::scheduler::job::{JobId, WorkerId};
use crate::spec::LayerManifest;

/// Broker's view of one connected worker.
#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    pub id: WorkerId,
    pub name: String,
    pub slots: usize,
    /// Slot index -> allocated job.
    allocations: Vec<Option<JobId>>,
    /// Jobs whose cancellation was forced but which the worker has not yet reported
    /// finished. They keep occupying a slot.
    draining: HashSet<JobId>,
    pub cached_layers: HashSet<LayerDigest>,
    /// Layers recorded as cached when a job was assigned, before the worker
    /// confirmed fetching them.
    assumed_layers: HashMap<JobId, Vec<LayerDigest>>,
    /// Admission order, used as the final tie-break.
    pub registration: u64,
    pub last_seen: Instant,
    pub reported_executing: usize,
}

impl WorkerDescriptor {
    fn new(
        id: WorkerId,
        name: String,
        slots: usize,
        cached_layers: HashSet<LayerDigest>,
        registration: u64,
        now: Instant,
    ) -> Self {
        Self {
            id,
            name,
            slots,
            allocations: vec![None; slots],
            draining: HashSet::new(),
            cached_layers,
            assumed_layers: HashMap::new(),
            registration,
            last_seen: now,
            reported_executing: 0,
        }
    }

    pub fn free_slots(&self) -> usize {
        self.slots.saturating_sub(self.occupied_slots())
    }

    /// Slots held by allocated or draining jobs.
    pub fn occupied_slots(&self) -> usize {
        self.allocations.iter().filter(|a| a.is_some()).count() + self.draining.len()
    }

    /// Jobs currently holding an allocation on this worker.
    pub fn allocated_jobs(&self) -> Vec<JobId> {
        self.allocations.iter().flatten().copied().collect()
    }

    pub fn slot_of(&self, job_id: &JobId) -> Option<usize> {
        self.allocations
            .iter()
            .position(|a| a.as_ref() == Some(job_id))
    }

    /// Bind `job_id` to the lowest free slot.
    pub fn allocate(&mut self, job_id: JobId) -> Option<usize> {
        if self.free_slots() == 0 || self.slot_of(&job_id).is_some() {
            return None;
        }
        let slot = self.allocations.iter().position(Option::is_none)?;
        self.allocations[slot] = Some(job_id);
        Some(slot)
    }

    /// Record `manifest` as cached ahead of the worker fetching it.
    pub fn assume_cached(&mut self, job_id: JobId, manifest: &LayerManifest) {
        let fresh: Vec<LayerDigest> = manifest
            .unique()
            .into_iter()
            .filter(|d| !self.cached_layers.contains(d))
            .collect();
        self.cached_layers.extend(fresh.iter().copied());
        self.assumed_layers.insert(job_id, fresh);
    }

    /// The worker reported these layers cached; they are no longer assumptions.
    pub fn confirm_cached(&mut self, added: &[LayerDigest]) {
        if added.is_empty() {
            return;
        }
        for layers in self.assumed_layers.values_mut() {
            layers.retain(|d| !added.contains(d));
        }
    }

    /// Drop the unconfirmed layers of `job_id` from the cache view.
    pub fn retract_assumed(&mut self, job_id: &JobId) -> usize {
        let layers = self.assumed_layers.remove(job_id).unwrap_or_default();
        for digest in &layers {
            self.cached_layers.remove(digest);
        }
        layers.len()
    }

    /// Release the allocation of `job_id`, returning its slot index.
    pub fn release(&mut self, job_id: &JobId) -> Option<usize> {
        self.assumed_layers.remove(job_id);
        let slot = self.slot_of(job_id)?;
        self.allocations[slot] = None;
        Some(slot)
    }

    /// Turn an allocation into a draining reservation.
    pub fn drain(&mut self, job_id: JobId) -> bool {
        if self.release(&job_id).is_some() {
            self.draining.insert(job_id);
            true
        } else {
            false
        }
    }

    pub fn finish_draining(&mut self, job_id: &JobId) -> bool {
        self.draining.remove(job_id)
    }

    pub fn is_draining(&self, job_id: &JobId) -> bool {
        self.draining.contains(job_id)
    }

    /// Number of manifest layers this worker already holds.
    pub fn cache_hits(&self, manifest: &LayerManifest) -> usize {
        manifest
            .unique()
            .iter()
            .filter(|d| self.cached_layers.contains(d))
            .count()
    }

    pub fn is_alive(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) < timeout
    }
}

/// The set of connected workers.
///
/// Membership changes bump `version`, so anything derived from a particular pool
/// shape can tell it is stale.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: HashMap<WorkerId, WorkerDescriptor>,
    next_id: u64,
    version: u64,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new worker.
    pub fn admit(
        &mut self,
        name: String,
        slots: usize,
        cached_layers: HashSet<LayerDigest>,
        now: Instant,
    ) -> WorkerId {
        self.next_id += 1;
        let id = WorkerId(self.next_id);
        self.workers.insert(
            id,
            WorkerDescriptor::new(id, name, slots, cached_layers, self.next_id, now),
        );
        self.version += 1;
        tracing::info!(worker_id = %id, slots, "Worker registered");
        id
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerDescriptor> {
        let removed = self.workers.remove(&id);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    pub fn get(&self, id: &WorkerId) -> Option<&WorkerDescriptor> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &WorkerId) -> Option<&mut WorkerDescriptor> {
        self.workers.get_mut(id)
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    /// Refresh liveness for any message received from the worker.
    pub fn touch(&mut self, id: &WorkerId, now: Instant) {
        if let Some(worker) = self.workers.get_mut(id) {
            worker.last_seen = now;
        }
    }

    /// Workers that have not been heard from within `timeout`.
    pub fn dead_workers(&self, now: Instant, timeout: Duration) -> Vec<WorkerId> {
        let mut dead: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| !w.is_alive(now, timeout))
            .map(|w| w.id)
            .collect();
        dead.sort();
        dead
    }

    pub fn has_free_slot(&self) -> bool {
        self.workers.values().any(|w| w.free_slots() > 0)
    }

    /// Best worker with a free slot for `manifest`: most cached layers, then most free
    /// slots, then earliest registration. Returns the worker and its cache hits.
    pub fn best_worker(&self, manifest: &LayerManifest) -> Option<(WorkerId, usize)> {
        self.workers
            .values()
            .filter(|w| w.free_slots() > 0)
            .map(|w| (w, w.cache_hits(manifest)))
            .max_by_key(|(w, hits)| (*hits, w.free_slots(), Reverse(w.registration)))
            .map(|(w, hits)| (w.id, hits))
    }

    /// All workers in registration order.
    pub fn all_workers(&self) -> Vec<&WorkerDescriptor> {
        let mut workers: Vec<&WorkerDescriptor> = self.workers.values().collect();
        workers.sort_by_key(|w| w.registration);
        workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn total_slots(&self) -> usize {
        self.workers.values().map(|w| w.slots).sum()
    }

    pub fn free_slots(&self) -> usize {
        self.workers.values().map(|w| w.free_slots()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(n: u64) -> LayerDigest {
        LayerDigest::from(n)
    }

    #[test]
    fn allocation_respects_slot_count() {
        let mut pool = WorkerPool::new();
        let now = Instant::now();
        let id = pool.admit("w".into(), 2, HashSet::new(), now);
        let worker = pool.get_mut(&id).unwrap();
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());
        assert_eq!(worker.allocate(a), Some(0));
        assert_eq!(worker.allocate(b), Some(1));
        assert_eq!(worker.allocate(c), None);
        assert_eq!(worker.release(&a), Some(0));
        assert_eq!(worker.allocate(c), Some(0));
    }

    #[test]
    fn double_allocation_is_refused() {
        let mut pool = WorkerPool::new();
        let id = pool.admit("w".into(), 4, HashSet::new(), Instant::now());
        let worker = pool.get_mut(&id).unwrap();
        let job = JobId::new();
        assert!(worker.allocate(job).is_some());
        assert!(worker.allocate(job).is_none());
    }

    #[test]
    fn draining_keeps_the_slot_reserved() {
        let mut pool = WorkerPool::new();
        let id = pool.admit("w".into(), 1, HashSet::new(), Instant::now());
        let worker = pool.get_mut(&id).unwrap();
        let job = JobId::new();
        worker.allocate(job);
        assert!(worker.drain(job));
        assert_eq!(worker.free_slots(), 0);
        assert!(worker.allocated_jobs().is_empty());
        assert!(worker.finish_draining(&job));
        assert_eq!(worker.free_slots(), 1);
    }

    #[test]
    fn best_worker_prefers_cache_hits() {
        let mut pool = WorkerPool::new();
        let now = Instant::now();
        let cold = pool.admit("cold".into(), 8, HashSet::new(), now);
        let warm = pool.admit("warm".into(), 1, [digest(1)].into_iter().collect(), now);
        let manifest = LayerManifest::new(vec![digest(1), digest(2)]);
        assert_eq!(pool.best_worker(&manifest), Some((warm, 1)));

        let empty = LayerManifest::default();
        assert_eq!(pool.best_worker(&empty), Some((cold, 0)));
    }

    #[test]
    fn ties_break_on_free_slots_then_registration() {
        let mut pool = WorkerPool::new();
        let now = Instant::now();
        let first = pool.admit("a".into(), 2, HashSet::new(), now);
        let second = pool.admit("b".into(), 2, HashSet::new(), now);
        let manifest = LayerManifest::default();
        assert_eq!(pool.best_worker(&manifest).unwrap().0, first);

        pool.get_mut(&first).unwrap().allocate(JobId::new());
        assert_eq!(pool.best_worker(&manifest).unwrap().0, second);
    }

    #[test]
    fn dead_workers_and_version() {
        let mut pool = WorkerPool::new();
        let start = Instant::now();
        let a = pool.admit("a".into(), 1, HashSet::new(), start);
        let b = pool.admit("b".into(), 1, HashSet::new(), start);
        assert_eq!(pool.version(), 2);

        let later = start + Duration::from_secs(10);
        pool.touch(&b, later);
        assert_eq!(pool.dead_workers(later, Duration::from_secs(5)), vec![a]);

        assert!(pool.remove(a).is_some());
        assert!(pool.remove(a).is_none());
        assert_eq!(pool.version(), 3);
        assert_eq!(pool.len(), 1);
    }
}
