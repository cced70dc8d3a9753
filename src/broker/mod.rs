//! The broker: owns the canonical layer store and the scheduler, and serves the gRPC
//! API that clients and workers connect to.

pub mod actor;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::grpc::{BrokerGrpcService, GrpcServer};
use crate::layer::LayerStore;

pub use actor::{BrokerMessage, SchedulerActor, SchedulerHandle};

pub struct Broker {
    config: BrokerConfig,
    store: Arc<LayerStore>,
}

impl Broker {
    /// Open (or create) the layer store. Blobs left by a previous run are indexed.
    pub async fn new(config: BrokerConfig) -> Result<Self> {
        let store = Arc::new(LayerStore::open(&config.layer_dir).await?);
        tracing::info!(
            layer_dir = %config.layer_dir.display(),
            layers = store.len(),
            "Layer store opened"
        );
        Ok(Self { config, store })
    }

    pub fn store(&self) -> &Arc<LayerStore> {
        &self.store
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Listen on the configured address until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Bind the configured address and serve in the background, returning the bound
    /// address. Port 0 picks an ephemeral port.
    pub async fn spawn(
        self,
        shutdown: CancellationToken,
    ) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        Ok((addr, tokio::spawn(self.serve(listener, shutdown))))
    }

    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let (actor, handle) = SchedulerActor::new(
            self.config.scheduler.clone(),
            self.store.clone(),
            self.config.tick_interval,
        );
        let actor_task = tokio::spawn(actor.run(shutdown.child_token()));

        let service = BrokerGrpcService::new(handle, self.store.clone(), shutdown.clone())
            .with_max_upload_bytes(self.config.max_upload_bytes);
        let served = GrpcServer::new(listener, service).run(shutdown.clone()).await;

        shutdown.cancel();
        if let Err(e) = actor_task.await {
            tracing::error!(error = %e, "Scheduler task panicked");
        }
        tracing::info!("Broker stopped");
        served.map_err(Into::into)
    }
}
