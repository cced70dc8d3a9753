//! Pulling layers from the broker into the worker's cache.
//!
//! Each missing layer is fetched with retries: exponential backoff with jitter between
//! attempts, every attempt bounded by a timeout. A layer the broker does not have is a
//! permanent failure. Concurrent requests for the same digest share one fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rand::Rng;
use tonic::transport::Channel;

use crate::config::FetchConfig;
use crate::digest::LayerDigest;
use crate::layer::{LayerCache, LayerStoreError, PinnedLayers};
use crate::proto::broker_service_client::BrokerServiceClient;
use crate::proto::layer_reply::Msg as ReplyMsg;
use crate::proto::LayerRequest;
use crate::spec::LayerManifest;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("layer {0} does not exist on the broker")]
    NotFound(LayerDigest),

    #[error("transfer failed: {0}")]
    Transient(String),

    #[error("could not fetch layer {digest} after {attempts} attempts: {last_error}")]
    Exhausted {
        digest: LayerDigest,
        attempts: u32,
        last_error: String,
    },

    #[error("could not cache layer: {0}")]
    Store(String),
}

/// Where layers come from.
#[async_trait]
pub trait LayerSource: Send + Sync {
    /// Return the complete blob for `digest`.
    async fn fetch(&self, digest: LayerDigest) -> Result<Vec<u8>, FetchError>;
}

/// Fetches layers over the broker's `FetchLayer` stream.
#[derive(Debug, Clone)]
pub struct GrpcLayerSource {
    client: BrokerServiceClient<Channel>,
}

impl GrpcLayerSource {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: BrokerServiceClient::new(channel),
        }
    }
}

#[async_trait]
impl LayerSource for GrpcLayerSource {
    async fn fetch(&self, digest: LayerDigest) -> Result<Vec<u8>, FetchError> {
        let mut client = self.client.clone();
        let mut stream = client
            .fetch_layer(LayerRequest {
                hash: digest.to_vec(),
            })
            .await
            .map_err(|status| FetchError::Transient(status.to_string()))?
            .into_inner();

        let mut data = Vec::new();
        loop {
            let reply = stream
                .message()
                .await
                .map_err(|status| FetchError::Transient(status.to_string()))?
                .ok_or_else(|| FetchError::Transient("stream ended before the last chunk".into()))?;
            match reply.msg {
                Some(ReplyMsg::Missing(_)) => return Err(FetchError::NotFound(digest)),
                Some(ReplyMsg::Data(chunk)) => {
                    data.extend_from_slice(&chunk.data);
                    if chunk.last {
                        return Ok(data);
                    }
                }
                None => return Err(FetchError::Transient("empty layer reply".into())),
            }
        }
    }
}

type FetchFuture = Shared<BoxFuture<'static, Result<(), FetchError>>>;

pub struct LayerFetcher {
    cache: Arc<LayerCache>,
    source: Arc<dyn LayerSource>,
    config: FetchConfig,
    in_flight: Mutex<HashMap<LayerDigest, FetchFuture>>,
}

impl LayerFetcher {
    pub fn new(cache: Arc<LayerCache>, source: Arc<dyn LayerSource>, config: FetchConfig) -> Arc<Self> {
        Arc::new(Self {
            cache,
            source,
            config,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache(&self) -> &Arc<LayerCache> {
        &self.cache
    }

    /// Pin every layer of `manifest` and make sure all of them are cached.
    pub async fn materialize(
        self: &Arc<Self>,
        manifest: &LayerManifest,
    ) -> Result<PinnedLayers, FetchError> {
        let unique = manifest.unique();
        let pins = self.cache.pin(&unique);
        let fetches = unique.iter().map(|digest| self.ensure(*digest));
        futures::future::try_join_all(fetches).await?;
        Ok(pins)
    }

    /// Make sure `digest` is cached, joining an in-flight fetch if there is one.
    pub async fn ensure(self: &Arc<Self>, digest: LayerDigest) -> Result<(), FetchError> {
        if self.cache.contains(&digest) {
            return Ok(());
        }
        let fetch = {
            let mut in_flight = self.in_flight.lock();
            in_flight
                .entry(digest)
                .or_insert_with(|| {
                    let this = Arc::clone(self);
                    async move {
                        let result = this.fetch_with_retry(digest).await;
                        this.in_flight.lock().remove(&digest);
                        result
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };
        fetch.await
    }

    async fn fetch_with_retry(&self, digest: LayerDigest) -> Result<(), FetchError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if self.cache.contains(&digest) {
                return Ok(());
            }
            let outcome =
                tokio::time::timeout(self.config.attempt_timeout, self.source.fetch(digest)).await;
            match outcome {
                Ok(Ok(data)) => match self.cache.insert(digest, &data).await {
                    Ok(()) => {
                        tracing::debug!(layer = %digest.short(), attempt, bytes = data.len(), "Fetched layer");
                        return Ok(());
                    }
                    Err(LayerStoreError::DigestMismatch { actual, .. }) => {
                        last_error = format!("received bytes hash to {actual}");
                    }
                    Err(e) => return Err(FetchError::Store(e.to_string())),
                },
                Ok(Err(FetchError::NotFound(d))) => return Err(FetchError::NotFound(d)),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("attempt timed out after {:?}", self.config.attempt_timeout)
                }
            }

            tracing::warn!(
                layer = %digest.short(),
                attempt,
                max_attempts,
                error = %last_error,
                "Layer fetch attempt failed"
            );
            if attempt < max_attempts {
                tokio::time::sleep(jittered(self.config.backoff(attempt))).await;
            }
        }

        Err(FetchError::Exhausted {
            digest,
            attempts: max_attempts,
            last_error,
        })
    }
}

/// Somewhere between half and all of `base`.
fn jittered(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Serves blobs from memory, failing the first `failures` calls.
    struct FlakySource {
        blobs: HashMap<LayerDigest, Vec<u8>>,
        failures: u32,
        calls: AtomicU32,
        delay: Duration,
    }

    impl FlakySource {
        fn new(blobs: &[&str], failures: u32) -> Self {
            Self {
                blobs: blobs
                    .iter()
                    .map(|b| (LayerDigest::compute(b.as_bytes()), b.as_bytes().to_vec()))
                    .collect(),
                failures,
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LayerSource for FlakySource {
        async fn fetch(&self, digest: LayerDigest) -> Result<Vec<u8>, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if call < self.failures {
                return Err(FetchError::Transient("connection reset".into()));
            }
            self.blobs
                .get(&digest)
                .cloned()
                .ok_or(FetchError::NotFound(digest))
        }
    }

    fn fast_config(max_attempts: u32) -> FetchConfig {
        FetchConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    async fn fetcher(source: Arc<FlakySource>, max_attempts: u32) -> (TempDir, Arc<LayerFetcher>) {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path(), u64::MAX).await.unwrap();
        (dir, LayerFetcher::new(cache, source, fast_config(max_attempts)))
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let source = Arc::new(FlakySource::new(&["base"], 2));
        let (_dir, fetcher) = fetcher(source.clone(), 5).await;
        let digest = LayerDigest::compute(b"base");

        fetcher.ensure(digest).await.unwrap();
        assert!(fetcher.cache().contains(&digest));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let source = Arc::new(FlakySource::new(&["base"], 10));
        let (_dir, fetcher) = fetcher(source.clone(), 3).await;
        let err = fetcher.ensure(LayerDigest::compute(b"base")).await.unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn missing_layer_is_permanent() {
        let source = Arc::new(FlakySource::new(&[], 0));
        let (_dir, fetcher) = fetcher(source.clone(), 5).await;
        let digest = LayerDigest::from(7u64);
        assert_eq!(
            fetcher.ensure(digest).await.unwrap_err(),
            FetchError::NotFound(digest)
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_fetches_are_coalesced() {
        let mut source = FlakySource::new(&["shared"], 0);
        source.delay = Duration::from_millis(50);
        let source = Arc::new(source);
        let (_dir, fetcher) = fetcher(source.clone(), 5).await;
        let digest = LayerDigest::compute(b"shared");

        let joins: Vec<_> = (0..4)
            .map(|_| {
                let fetcher = fetcher.clone();
                tokio::spawn(async move { fetcher.ensure(digest).await })
            })
            .collect();
        for join in joins {
            join.await.unwrap().unwrap();
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn materialize_pins_every_layer() {
        let source = Arc::new(FlakySource::new(&["a", "b"], 0));
        let (_dir, fetcher) = fetcher(source.clone(), 5).await;
        let a = LayerDigest::compute(b"a");
        let b = LayerDigest::compute(b"b");

        let pins = fetcher
            .materialize(&LayerManifest::new(vec![a, b, a]))
            .await
            .unwrap();
        assert!(fetcher.cache().is_pinned(&a));
        assert!(fetcher.cache().is_pinned(&b));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        drop(pins);
        assert!(!fetcher.cache().is_pinned(&a));

        // Already cached: no further calls.
        let _pins = fetcher
            .materialize(&LayerManifest::new(vec![a, b]))
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
