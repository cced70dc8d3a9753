//! Test harness for broker/worker integration tests.
//!
//! Runs a real broker on an ephemeral port and in-process workers whose jobs are
//! simulated by [`FakeExecutor`], so the scheduling protocol can be exercised without
//! containers.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use stratum::broker::Broker;
use stratum::client::Client;
use stratum::config::{BrokerConfig, FetchConfig, WorkerConfig};
use stratum::error::Result;
use stratum::layer::LayerCache;
use stratum::proto::GetClusterStatusResponse;
use stratum::scheduler::{JobId, OutputStream};
use stratum::spec::JobSpec;
use stratum::worker::{
    ExecutionError, ExecutionRequest, Executor, OutputSink, SlotPool, Termination, Worker,
};

/// Broker configuration with short timeouts for faster tests
pub fn test_broker_config(dir: &TempDir) -> BrokerConfig {
    let mut config = BrokerConfig::new(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        dir.path().join("layers"),
    )
    .with_heartbeat(Duration::from_millis(50), Duration::from_millis(500))
    .with_cancel_timeout(Duration::from_millis(500));
    config.tick_interval = Duration::from_millis(10);
    config
}

/// Handle to a running broker
pub struct TestBroker {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
    _dir: TempDir,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::start_with(|config| config).await
    }

    /// Start with a configuration adjusted by `configure`
    pub async fn start_with(configure: impl FnOnce(BrokerConfig) -> BrokerConfig) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let config = configure(test_broker_config(&dir));
        let broker = Broker::new(config).await.expect("broker starts");
        let shutdown = CancellationToken::new();
        let (addr, handle) = broker.spawn(shutdown.clone()).await.expect("broker binds");
        Self {
            addr,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn client(&self) -> Client {
        Client::connect(self.url()).await.expect("client connects")
    }

    pub async fn status(&self) -> GetClusterStatusResponse {
        self.client()
            .await
            .cluster_status()
            .await
            .expect("cluster status")
    }

    /// Wait until `count` workers are registered
    pub async fn wait_for_workers(&self, count: usize) {
        let client = self.client().await;
        assert_eventually(
            || async {
                client
                    .cluster_status()
                    .await
                    .map(|s| s.workers.len() == count)
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
            "workers should register",
        )
        .await;
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

/// Handle to a running worker
pub struct TestWorker {
    pub cache: Arc<LayerCache>,
    pub slots: SlotPool,
    pub executor: Arc<FakeExecutor>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
    _dir: TempDir,
}

impl TestWorker {
    pub async fn start(broker_url: &str, slots: usize, executor: Arc<FakeExecutor>) -> Self {
        Self::start_with_layers(broker_url, slots, executor, &[]).await
    }

    /// Start with `layers` already in the worker's cache
    pub async fn start_with_layers(
        broker_url: &str,
        slots: usize,
        executor: Arc<FakeExecutor>,
        layers: &[Vec<u8>],
    ) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let cache_dir = dir.path().join("cache");
        if !layers.is_empty() {
            let seed = LayerCache::open(&cache_dir, u64::MAX).await.expect("cache");
            for layer in layers {
                seed.insert(stratum::digest::LayerDigest::compute(layer), layer)
                    .await
                    .expect("seed layer");
            }
        }

        let mut config = WorkerConfig::new(broker_url, slots)
            .with_cache(cache_dir, 1 << 30)
            .with_scratch_dir(dir.path().join("scratch"))
            .with_name(format!("test-worker-{slots}"));
        config.reconnect_initial_backoff = Duration::from_millis(20);
        config.reconnect_max_backoff = Duration::from_millis(200);
        config.fetch = FetchConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            attempt_timeout: Duration::from_secs(5),
        };

        let worker = Worker::new(config, executor.clone())
            .await
            .expect("worker starts");
        let cache = worker.cache().clone();
        let slots = worker.slots().clone();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        Self {
            cache,
            slots,
            executor,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    /// Drop the worker without a goodbye, as if its process died
    pub fn crash(&self) {
        self.handle.abort();
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.handle).await;
    }
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Simulates the few programs the tests use:
///
/// - `/bin/true`, `/bin/false`
/// - `/bin/echo ARGS...` writes its arguments to stdout
/// - `/bin/sleep SECS` sleeps (instantly when built with [`FakeExecutor::instant`])
///
/// Any other program fails container setup, like a missing executable.
#[derive(Default)]
pub struct FakeExecutor {
    instant: bool,
    running: AtomicUsize,
    max_running: AtomicUsize,
    executed: Mutex<Vec<JobId>>,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `/bin/sleep` returns immediately
    pub fn instant() -> Arc<Self> {
        Arc::new(Self {
            instant: true,
            ..Default::default()
        })
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<JobId> {
        self.executed.lock().clone()
    }

    async fn simulate(
        &self,
        spec: &JobSpec,
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> std::result::Result<Termination, ExecutionError> {
        match spec.program.as_str() {
            "/bin/true" => Ok(Termination::Exited(0)),
            "/bin/false" => Ok(Termination::Exited(1)),
            "/bin/echo" => {
                sink.write(
                    OutputStream::Stdout,
                    format!("{}\n", spec.arguments.join(" ")).as_bytes(),
                );
                Ok(Termination::Exited(0))
            }
            "/bin/sleep" => {
                if self.instant {
                    return Ok(Termination::Exited(0));
                }
                let secs: f64 = spec
                    .arguments
                    .first()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => Ok(Termination::Exited(0)),
                    _ = cancel.cancelled() => Ok(Termination::Killed),
                }
            }
            other => Err(ExecutionError::setup(
                "exec",
                format!("{other}: No such file or directory (ENOENT)"),
            )),
        }
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> std::result::Result<Termination, ExecutionError> {
        for digest in request.manifest.iter() {
            if !request.layers.contains(digest) {
                return Err(ExecutionError::setup(
                    "rootfs",
                    format!("layer {digest} was not materialized"),
                ));
            }
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.executed.lock().push(request.job_id);
        sink.started();

        let result = self.simulate(&request.spec, &sink, &cancel).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// A small valid tar layer holding one file
pub fn tar_layer(path: &str, contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, contents)
        .expect("append tar entry");
    builder.into_inner().expect("finish tar")
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
