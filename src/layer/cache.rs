//! Worker-side layer cache.
//!
//! Wraps a [`LayerStore`] with an LRU bound on total bytes. Layers referenced by a
//! running job are pinned and never evicted; the cache may exceed its capacity while
//! everything in it is pinned. Insertions and evictions are accumulated as deltas for
//! the next heartbeat. Writing a layer and deleting it for eviction hold the same
//! per-layer lock, so a layer re-inserted mid-eviction is never deleted from under
//! its new cache entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::digest::LayerDigest;
use crate::layer::store::{LayerStore, LayerStoreError};

#[derive(Debug, Clone, Copy)]
struct Entry {
    size: u64,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<LayerDigest, Entry>,
    pins: HashMap<LayerDigest, usize>,
    total_bytes: u64,
    clock: u64,
    added: HashSet<LayerDigest>,
    evicted: HashSet<LayerDigest>,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn record_added(&mut self, digest: LayerDigest) {
        if !self.evicted.remove(&digest) {
            self.added.insert(digest);
        }
    }

    fn record_evicted(&mut self, digest: LayerDigest) {
        if !self.added.remove(&digest) {
            self.evicted.insert(digest);
        }
    }

    fn forget(&mut self, digest: &LayerDigest) -> bool {
        match self.entries.remove(digest) {
            Some(entry) => {
                self.total_bytes -= entry.size;
                self.record_evicted(*digest);
                true
            }
            None => false,
        }
    }

    /// Least recently used unpinned layers to drop until the cache fits `capacity`.
    fn choose_victims(&mut self, capacity: u64) -> Vec<LayerDigest> {
        if self.total_bytes <= capacity {
            return Vec::new();
        }
        let mut candidates: Vec<(u64, LayerDigest)> = self
            .entries
            .iter()
            .filter(|(d, _)| self.pins.get(*d).copied().unwrap_or(0) == 0)
            .map(|(d, e)| (e.last_used, *d))
            .collect();
        candidates.sort();

        let mut victims = Vec::new();
        for (_, digest) in candidates {
            if self.total_bytes <= capacity {
                break;
            }
            self.forget(&digest);
            victims.push(digest);
        }
        victims
    }
}

/// Layer deltas since the previous heartbeat.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheDelta {
    pub added: Vec<LayerDigest>,
    pub evicted: Vec<LayerDigest>,
}

pub struct LayerCache {
    store: LayerStore,
    capacity_bytes: u64,
    state: Mutex<CacheState>,
    locks: Mutex<HashMap<LayerDigest, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive access to one layer's blob for the lifetime of the guard.
struct LayerLock<'a> {
    cache: &'a LayerCache,
    digest: LayerDigest,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for LayerLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.cache.locks.lock();
        if locks
            .get(&self.digest)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.digest);
        }
    }
}

impl std::fmt::Debug for LayerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerCache")
            .field("store", &self.store)
            .field("capacity_bytes", &self.capacity_bytes)
            .finish()
    }
}

impl LayerCache {
    pub async fn open(
        dir: impl Into<std::path::PathBuf>,
        capacity_bytes: u64,
    ) -> Result<Arc<Self>, LayerStoreError> {
        let store = LayerStore::open(dir).await?;
        let mut state = CacheState::default();
        for (digest, size) in store.entries() {
            let last_used = state.tick();
            state.entries.insert(digest, Entry { size, last_used });
            state.total_bytes += size;
        }
        let cache = Arc::new(Self {
            store,
            capacity_bytes,
            state: Mutex::new(state),
            locks: Mutex::new(HashMap::new()),
        });
        cache.evict().await;
        Ok(cache)
    }

    pub fn contains(&self, digest: &LayerDigest) -> bool {
        self.state.lock().entries.contains_key(digest)
    }

    /// Everything currently cached, for registration.
    pub fn digests(&self) -> Vec<LayerDigest> {
        self.state.lock().entries.keys().copied().collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Pin `digests` for the lifetime of the returned guard, whether or not they are
    /// cached yet.
    pub fn pin(self: &Arc<Self>, digests: &[LayerDigest]) -> PinnedLayers {
        let mut state = self.state.lock();
        for digest in digests {
            *state.pins.entry(*digest).or_insert(0) += 1;
        }
        PinnedLayers {
            cache: Arc::clone(self),
            digests: digests.to_vec(),
        }
    }

    fn unpin(&self, digests: &[LayerDigest]) {
        let mut state = self.state.lock();
        for digest in digests {
            if let Some(count) = state.pins.get_mut(digest) {
                *count -= 1;
                if *count == 0 {
                    state.pins.remove(digest);
                }
            }
        }
    }

    pub fn is_pinned(&self, digest: &LayerDigest) -> bool {
        self.state.lock().pins.contains_key(digest)
    }

    /// Add a fetched layer, then evict down to capacity.
    pub async fn insert(&self, digest: LayerDigest, data: &[u8]) -> Result<(), LayerStoreError> {
        {
            let _lock = self.lock_layer(digest).await;
            self.store.put_verified(digest, data).await?;
            let mut state = self.state.lock();
            let last_used = state.tick();
            if let Some(entry) = state.entries.get_mut(&digest) {
                entry.last_used = last_used;
            } else {
                state.entries.insert(
                    digest,
                    Entry {
                        size: data.len() as u64,
                        last_used,
                    },
                );
                state.total_bytes += data.len() as u64;
                state.record_added(digest);
            }
        }
        self.evict().await;
        Ok(())
    }

    /// Read a cached layer and mark it recently used.
    pub async fn get(&self, digest: &LayerDigest) -> Result<Vec<u8>, LayerStoreError> {
        {
            let mut state = self.state.lock();
            let now = state.tick();
            match state.entries.get_mut(digest) {
                Some(entry) => entry.last_used = now,
                None => return Err(LayerStoreError::NotFound(*digest)),
            }
        }
        match self.store.get(digest).await {
            Ok(data) => Ok(data),
            Err(err) => {
                if matches!(
                    err,
                    LayerStoreError::Corrupted(_) | LayerStoreError::NotFound(_)
                ) {
                    self.state.lock().forget(digest);
                }
                Err(err)
            }
        }
    }

    /// Take the insertions and evictions accumulated since the last call.
    pub fn take_delta(&self) -> CacheDelta {
        let mut state = self.state.lock();
        CacheDelta {
            added: state.added.drain().collect(),
            evicted: state.evicted.drain().collect(),
        }
    }

    /// Forget pending deltas; used when re-registering with a full snapshot.
    pub fn reset_delta(&self) {
        let mut state = self.state.lock();
        state.added.clear();
        state.evicted.clear();
    }

    async fn lock_layer(&self, digest: LayerDigest) -> LayerLock<'_> {
        let lock = self.locks.lock().entry(digest).or_default().clone();
        LayerLock {
            cache: self,
            digest,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn evict(&self) {
        let victims = self.state.lock().choose_victims(self.capacity_bytes);
        self.remove_victims(victims).await;
    }

    async fn remove_victims(&self, victims: Vec<LayerDigest>) {
        for digest in victims {
            let _lock = self.lock_layer(digest).await;
            if self.contains(&digest) {
                tracing::debug!(layer = %digest.short(), "Layer came back while evicting, keeping it");
                continue;
            }
            match self.store.remove(&digest).await {
                Ok(_) => tracing::debug!(layer = %digest.short(), "Evicted layer"),
                Err(e) => tracing::warn!(layer = %digest.short(), error = %e, "Failed to evict layer"),
            }
        }
    }
}

/// Keeps layers from being evicted while a job uses them.
#[derive(Debug)]
pub struct PinnedLayers {
    cache: Arc<LayerCache>,
    digests: Vec<LayerDigest>,
}

impl PinnedLayers {
    pub fn digests(&self) -> &[LayerDigest] {
        &self.digests
    }
}

impl Drop for PinnedLayers {
    fn drop(&mut self) {
        self.cache.unpin(&self.digests);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn blob(tag: u8, len: usize) -> (LayerDigest, Vec<u8>) {
        let data = vec![tag; len];
        (LayerDigest::compute(&data), data)
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path(), 250).await.unwrap();
        let (a, da) = blob(1, 100);
        let (b, db) = blob(2, 100);
        let (c, dc) = blob(3, 100);

        cache.insert(a, &da).await.unwrap();
        cache.insert(b, &db).await.unwrap();
        cache.get(&a).await.unwrap();
        cache.insert(c, &dc).await.unwrap();

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.total_bytes(), 200);
    }

    #[tokio::test]
    async fn pinned_layers_survive_eviction() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path(), 100).await.unwrap();
        let (a, da) = blob(1, 100);
        let (b, db) = blob(2, 100);

        let pins = cache.pin(&[a]);
        cache.insert(a, &da).await.unwrap();
        cache.insert(b, &db).await.unwrap();
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));

        drop(pins);
        assert!(!cache.is_pinned(&a));
        let (c, dc) = blob(3, 50);
        cache.insert(c, &dc).await.unwrap();
        assert!(!cache.contains(&a));
        assert!(cache.contains(&c));
    }

    #[tokio::test]
    async fn over_capacity_while_everything_is_pinned() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path(), 10).await.unwrap();
        let (a, da) = blob(1, 100);
        let _pins = cache.pin(&[a]);
        cache.insert(a, &da).await.unwrap();
        assert!(cache.contains(&a));
        assert_eq!(cache.total_bytes(), 100);
    }

    #[tokio::test]
    async fn deltas_net_out() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path(), 100).await.unwrap();
        let (a, da) = blob(1, 100);
        let (b, db) = blob(2, 100);

        cache.insert(a, &da).await.unwrap();
        assert_eq!(
            cache.take_delta(),
            CacheDelta {
                added: vec![a],
                evicted: vec![]
            }
        );

        // b pushes a out.
        cache.insert(b, &db).await.unwrap();
        let delta = cache.take_delta();
        assert_eq!(delta.added, vec![b]);
        assert_eq!(delta.evicted, vec![a]);
        assert_eq!(cache.take_delta(), CacheDelta::default());
    }

    #[tokio::test]
    async fn reopen_restores_contents() {
        let dir = TempDir::new().unwrap();
        let (a, da) = blob(1, 10);
        {
            let cache = LayerCache::open(dir.path(), 1000).await.unwrap();
            cache.insert(a, &da).await.unwrap();
        }
        let cache = LayerCache::open(dir.path(), 1000).await.unwrap();
        assert!(cache.contains(&a));
        assert_eq!(cache.get(&a).await.unwrap(), da);
        assert!(cache.take_delta().added.is_empty());
    }

    #[tokio::test]
    async fn layer_reinserted_during_eviction_stays_readable() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path(), 1000).await.unwrap();
        let (a, da) = blob(1, 100);
        cache.insert(a, &da).await.unwrap();

        // Eviction picks `a`, then a job pins it and fetches it again before the
        // blob is deleted.
        let victims = cache.state.lock().choose_victims(0);
        assert_eq!(victims, vec![a]);
        assert!(!cache.contains(&a));
        let _pins = cache.pin(&[a]);
        cache.insert(a, &da).await.unwrap();
        cache.remove_victims(victims).await;

        assert!(cache.contains(&a));
        assert_eq!(cache.get(&a).await.unwrap(), da);
        assert_eq!(cache.take_delta().evicted, Vec::<LayerDigest>::new());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_insert_and_eviction_keep_index_and_disk_in_step() {
        for round in 0..20u8 {
            let dir = TempDir::new().unwrap();
            let cache = LayerCache::open(dir.path(), 250).await.unwrap();
            let (v1, d1) = blob(round.wrapping_mul(3), 100);
            let (v2, d2) = blob(round.wrapping_mul(3).wrapping_add(1), 100);
            let (big, dbig) = blob(round.wrapping_mul(3).wrapping_add(2), 200);
            cache.insert(v1, &d1).await.unwrap();
            cache.insert(v2, &d2).await.unwrap();

            let evicting = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.insert(big, &dbig).await.unwrap() })
            };
            let refetch = {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let pins = cache.pin(&[v2]);
                    cache.insert(v2, &d2).await.unwrap();
                    pins
                })
            };
            evicting.await.unwrap();
            let _pins = refetch.await.unwrap();

            for digest in [v1, v2, big] {
                if cache.contains(&digest) {
                    assert!(
                        cache.get(&digest).await.is_ok(),
                        "round {round}: cached layer missing on disk"
                    );
                }
            }
            assert!(cache.contains(&v2), "round {round}: pinned layer evicted");
        }
    }
}
