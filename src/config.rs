use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

fn default_data_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join("stratum").join(name)
}

/// Knobs of the broker's scheduling and failure-recovery protocol.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval workers are told to heartbeat at.
    pub heartbeat_interval: Duration,
    /// A worker silent for this long is declared lost.
    pub heartbeat_timeout: Duration,
    /// How long a cancelled Scheduled/Executing job waits for its worker before it is
    /// forced to Cancelled.
    pub cancel_timeout: Duration,
    /// Worker-loss requeues a job survives before it fails with WorkerLost.
    pub max_requeues: u32,
    /// Number of queued jobs considered for cache affinity.
    pub lookahead: usize,
    /// Times a job may be passed over before it is scheduled ahead of younger jobs.
    pub max_skips: u32,
    pub max_queued_jobs: usize,
    pub finished_job_retention: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(5),
            cancel_timeout: Duration::from_secs(10),
            max_requeues: 3,
            lookahead: 16,
            max_skips: 16,
            max_queued_jobs: 10_000,
            finished_job_retention: 10_000,
        }
    }
}

/// Default bound on one client layer upload.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 1 << 30;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen_addr: SocketAddr,
    /// Canonical layer store directory.
    pub layer_dir: PathBuf,
    /// Period of the liveness / cancel-timeout tick.
    pub tick_interval: Duration,
    /// Largest layer a client may upload; uploads are buffered in memory.
    pub max_upload_bytes: usize,
    pub scheduler: SchedulerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9900)),
            layer_dir: default_data_dir("broker-layers"),
            tick_interval: Duration::from_millis(100),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn new(listen_addr: SocketAddr, layer_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr,
            layer_dir: layer_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.scheduler.heartbeat_interval = interval;
        self.scheduler.heartbeat_timeout = timeout;
        self
    }

    pub fn with_max_requeues(mut self, max_requeues: u32) -> Self {
        self.scheduler.max_requeues = max_requeues;
        self
    }

    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.scheduler.cancel_timeout = timeout;
        self
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }
}

/// Retry policy for pulling layers from the broker.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on a single FetchLayer call, including streaming the blob.
    pub attempt_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl FetchConfig {
    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Settings for the per-job container runtime.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Parent directory of per-job root filesystems.
    pub scratch_dir: PathBuf,
    /// Hostname set inside the job's UTS namespace.
    pub hostname: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_data_dir("scratch"),
            hostname: "stratum".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Broker endpoint, e.g. `http://127.0.0.1:9900`.
    pub broker_url: String,
    pub name: String,
    pub slots: usize,
    pub cache_dir: PathBuf,
    pub cache_capacity_bytes: u64,
    /// Captured bytes per output stream; the rest is counted as truncated.
    pub max_output_bytes: u64,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub fetch: FetchConfig,
    pub container: ContainerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker_url: "http://127.0.0.1:9900".to_string(),
            name: default_worker_name(),
            slots: 1,
            cache_dir: default_data_dir("worker-cache"),
            cache_capacity_bytes: 4 << 30,
            max_output_bytes: 16 << 20,
            reconnect_initial_backoff: Duration::from_millis(200),
            reconnect_max_backoff: Duration::from_secs(5),
            fetch: FetchConfig::default(),
            container: ContainerConfig::default(),
        }
    }
}

fn default_worker_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string())
}

impl WorkerConfig {
    pub fn new(broker_url: impl Into<String>, slots: usize) -> Self {
        Self {
            broker_url: broker_url.into(),
            slots,
            ..Default::default()
        }
    }

    pub fn with_cache(mut self, dir: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        self.cache_dir = dir.into();
        self.cache_capacity_bytes = capacity_bytes;
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.container.scratch_dir = dir.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}
