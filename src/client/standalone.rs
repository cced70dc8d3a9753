//! A broker and one worker in the current process, with a client connected to them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::client::Client;
use crate::config::{BrokerConfig, ContainerConfig, WorkerConfig};
use crate::container::{probe_namespaces, ContainerExecutor};
use crate::error::Result;
use crate::worker::{Executor, Worker};

#[derive(Debug, Clone)]
pub struct StandaloneConfig {
    pub slots: usize,
    /// Holds the broker's layer store, the worker cache and job scratch space.
    pub data_dir: PathBuf,
    pub cache_capacity_bytes: u64,
}

impl StandaloneConfig {
    pub fn new(slots: usize, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            slots,
            data_dir: data_dir.into(),
            cache_capacity_bytes: WorkerConfig::default().cache_capacity_bytes,
        }
    }
}

pub struct Standalone {
    client: Client,
    addr: SocketAddr,
    shutdown: CancellationToken,
    broker: JoinHandle<Result<()>>,
    worker: JoinHandle<Result<()>>,
}

impl Standalone {
    /// Start with the rootless container runtime. Fails if this process cannot
    /// create the namespaces jobs need.
    pub async fn start(config: StandaloneConfig) -> Result<Self> {
        probe_namespaces()?;
        let scratch = config.data_dir.join("scratch");
        let executor = ContainerExecutor::new(ContainerConfig {
            scratch_dir: scratch,
            ..Default::default()
        });
        Self::with_executor(config, Arc::new(executor)).await
    }

    pub async fn with_executor(
        config: StandaloneConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        let shutdown = CancellationToken::new();

        let broker_config = BrokerConfig::new(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            config.data_dir.join("layers"),
        );
        let broker = Broker::new(broker_config).await?;
        let (addr, broker) = broker.spawn(shutdown.clone()).await?;
        let url = format!("http://{addr}");

        let worker_config = WorkerConfig::new(url.clone(), config.slots)
            .with_name("standalone")
            .with_cache(config.data_dir.join("cache"), config.cache_capacity_bytes)
            .with_scratch_dir(config.data_dir.join("scratch"));
        let worker = Worker::new(worker_config, executor).await?;
        let worker = tokio::spawn(worker.run(shutdown.clone()));

        let client = Client::connect(url).await?;
        tracing::info!(addr = %addr, slots = config.slots, "Standalone cluster running");

        Ok(Self {
            client,
            addr,
            shutdown,
            broker,
            worker,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn broker_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the worker and the broker and wait for both.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.client);
        self.shutdown.cancel();
        for (name, task) in [("worker", self.worker), ("broker", self.broker)] {
            match task.await {
                Ok(result) => result?,
                Err(e) => tracing::error!(component = name, error = %e, "Task panicked"),
            }
        }
        Ok(())
    }
}
