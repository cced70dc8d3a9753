use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};

use crate::grpc::convert::digests_to_proto;
use crate::layer::LayerCache;
use crate::proto;
use crate::worker::slots::SlotPool;

/// Builds the registration and periodic heartbeat messages a worker sends.
#[derive(Debug, Clone)]
pub struct HeartbeatSender {
    cache: Arc<LayerCache>,
    slots: SlotPool,
}

impl HeartbeatSender {
    pub fn new(cache: Arc<LayerCache>, slots: SlotPool) -> Self {
        Self { cache, slots }
    }

    /// Registration with the full cache contents. Clears the pending delta, since the
    /// broker will start from this snapshot.
    pub fn registration(&self, name: &str) -> proto::RegisterWorker {
        self.cache.reset_delta();
        proto::RegisterWorker {
            slots: u32::try_from(self.slots.total()).unwrap_or(u32::MAX),
            cached_layers: digests_to_proto(&self.cache.digests()),
            name: name.to_string(),
        }
    }

    /// Current slot usage and the cache changes since the previous beat.
    pub fn beat(&self) -> proto::Heartbeat {
        let delta = self.cache.take_delta();
        proto::Heartbeat {
            executing: u32::try_from(self.slots.in_use()).unwrap_or(u32::MAX),
            added_layers: digests_to_proto(&delta.added),
            evicted_layers: digests_to_proto(&delta.evicted),
        }
    }

    /// Ticker for `interval` whose first tick is one interval away.
    pub fn ticker(interval: Duration) -> Interval {
        let interval = interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::LayerDigest;
    use tempfile::TempDir;

    #[tokio::test]
    async fn heartbeat_carries_slots_and_cache_delta() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path(), u64::MAX).await.unwrap();
        cache.insert(LayerDigest::compute(b"old"), b"old").await.unwrap();

        let slots = SlotPool::new(3);
        let sender = HeartbeatSender::new(cache.clone(), slots.clone());

        let registration = sender.registration("w1");
        assert_eq!(registration.slots, 3);
        assert_eq!(registration.cached_layers.len(), 1);
        assert_eq!(registration.name, "w1");

        let _permit = slots.try_acquire().unwrap();
        let new = LayerDigest::compute(b"new");
        cache.insert(new, b"new").await.unwrap();

        let beat = sender.beat();
        assert_eq!(beat.executing, 1);
        assert_eq!(beat.added_layers, vec![new.to_vec()]);
        assert!(beat.evicted_layers.is_empty());

        // Deltas are reported once.
        assert!(sender.beat().added_layers.is_empty());
    }
}
