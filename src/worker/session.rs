use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic::Streaming;

use crate::config::WorkerConfig;
use crate::error::{Result, StratumError};
use crate::grpc::convert::{job_completed_to_proto, job_from_proto, output_to_proto, parse_job_id};
use crate::layer::LayerCache;
use crate::proto;
use crate::proto::broker_service_client::BrokerServiceClient;
use crate::proto::broker_to_worker::Msg as BrokerMsg;
use crate::proto::worker_message::Msg as WorkerMsg;
use crate::scheduler::{JobId, WorkerId};
use crate::worker::executor::{Executor, WorkerEvent};
use crate::worker::fetcher::{GrpcLayerSource, LayerFetcher, LayerSource};
use crate::worker::heartbeat::HeartbeatSender;
use crate::worker::runner::{Assignment, JobRunner};
use crate::worker::slots::SlotPool;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// A worker process: holds one session with the broker, reconnecting when it drops.
pub struct Worker {
    config: WorkerConfig,
    slots: SlotPool,
    runner: JobRunner,
    heartbeat: HeartbeatSender,
}

impl Worker {
    /// Open the local layer cache and prepare to fetch layers from the configured broker.
    pub async fn new(config: WorkerConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        let channel = Endpoint::from_shared(config.broker_url.clone())?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect_lazy();
        let source = Arc::new(GrpcLayerSource::new(channel));
        Self::with_source(config, executor, source).await
    }

    pub async fn with_source(
        config: WorkerConfig,
        executor: Arc<dyn Executor>,
        source: Arc<dyn LayerSource>,
    ) -> Result<Self> {
        let cache = LayerCache::open(&config.cache_dir, config.cache_capacity_bytes).await?;
        let fetcher = LayerFetcher::new(cache.clone(), source, config.fetch.clone());
        let slots = SlotPool::new(config.slots);
        let runner = JobRunner::new(executor, fetcher, config.max_output_bytes);
        let heartbeat = HeartbeatSender::new(cache, slots.clone());

        Ok(Self {
            config,
            slots,
            runner,
            heartbeat,
        })
    }

    pub fn cache(&self) -> &Arc<LayerCache> {
        self.runner.cache()
    }

    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    /// Serve the broker until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut backoff = self.config.reconnect_initial_backoff;

        loop {
            match self.session(&shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Lost(reason)) => {
                    tracing::warn!(reason = %reason, "Broker session lost");
                    backoff = self.config.reconnect_initial_backoff;
                }
                Err(e) => {
                    tracing::warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Could not reach broker");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.reconnect_max_backoff);
        }

        tracing::info!(name = %self.config.name, "Worker stopped");
        Ok(())
    }

    async fn session(&self, shutdown: &CancellationToken) -> Result<SessionEnd> {
        if shutdown.is_cancelled() {
            return Ok(SessionEnd::Shutdown);
        }

        let channel = Endpoint::from_shared(self.config.broker_url.clone())?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await?;
        let mut client = BrokerServiceClient::new(channel);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let _ = out_tx.send(worker_message(WorkerMsg::Register(
            self.heartbeat.registration(&self.config.name),
        )));
        let mut inbound = client
            .worker_session(UnboundedReceiverStream::new(out_rx))
            .await?
            .into_inner();

        let (worker_id, interval) = registered(&mut inbound).await?;
        tracing::info!(
            worker_id = %worker_id,
            name = %self.config.name,
            slots = self.slots.total(),
            cached_layers = self.cache().digests().len(),
            "Registered with broker"
        );

        // Events from jobs of an earlier session never reach this one.
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut running: HashMap<JobId, CancellationToken> = HashMap::new();
        let mut ticker = HeartbeatSender::ticker(interval);

        let end = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,

                _ = ticker.tick() => {
                    let _ = out_tx.send(worker_message(WorkerMsg::Heartbeat(self.heartbeat.beat())));
                }

                Some(event) = event_rx.recv() => {
                    if let WorkerEvent::Completed { job_id, .. } = &event {
                        running.remove(job_id);
                    }
                    let _ = out_tx.send(event_to_proto(event));
                }

                message = inbound.message() => match message {
                    Ok(Some(message)) => {
                        self.handle(message, &out_tx, &event_tx, &mut running);
                    }
                    Ok(None) => break SessionEnd::Lost("broker closed the session".into()),
                    Err(status) => break SessionEnd::Lost(status.to_string()),
                },
            }
        };

        // The broker requeues whatever this worker held; stop it and tear it down
        // before registering again so no stale result reaches a later session.
        if !running.is_empty() {
            tracing::info!(jobs = running.len(), "Stopping running jobs");
        }
        for token in running.values() {
            token.cancel();
        }
        self.slots.wait_idle().await;
        Ok(end)
    }

    fn handle(
        &self,
        message: proto::BrokerToWorker,
        out: &mpsc::UnboundedSender<proto::WorkerMessage>,
        events: &mpsc::UnboundedSender<WorkerEvent>,
        running: &mut HashMap<JobId, CancellationToken>,
    ) {
        match message.msg {
            Some(BrokerMsg::Assign(assign)) => {
                let job_id = match parse_job_id(&assign.job_id) {
                    Ok(id) => id,
                    Err(e) => {
                        tracing::error!(error = %e, "Assignment with malformed job id");
                        return;
                    }
                };
                let refuse = |reason: String| {
                    tracing::error!(job_id = %job_id, reason = %reason, "Refusing assignment");
                    let _ = out.send(worker_message(WorkerMsg::Refused(proto::AssignmentRefused {
                        job_id: job_id.to_string(),
                        reason,
                    })));
                };

                if running.contains_key(&job_id) {
                    refuse("job is already running here".into());
                    return;
                }
                let (spec, manifest) = match job_from_proto(assign.spec, assign.manifest) {
                    Ok(job) => job,
                    Err(e) => {
                        refuse(e.to_string());
                        return;
                    }
                };
                let permit = match self.slots.try_acquire() {
                    Ok(permit) => permit,
                    Err(e) => {
                        refuse(e.to_string());
                        return;
                    }
                };

                tracing::info!(job_id = %job_id, program = %spec.program, layers = manifest.len(), "Job assigned");
                let cancel = CancellationToken::new();
                running.insert(job_id, cancel.clone());

                let runner = self.runner.clone();
                let events = events.clone();
                let assignment = Assignment {
                    job_id,
                    spec,
                    manifest,
                };
                tokio::spawn(async move {
                    runner.run(assignment, permit, events, cancel).await;
                });
            }
            Some(BrokerMsg::Cancel(cancel)) => match parse_job_id(&cancel.job_id) {
                Ok(job_id) => match running.get(&job_id) {
                    Some(token) => {
                        tracing::info!(job_id = %job_id, "Cancelling job");
                        token.cancel();
                    }
                    None => tracing::debug!(job_id = %job_id, "Cancel for job not running here"),
                },
                Err(e) => tracing::error!(error = %e, "Cancel with malformed job id"),
            },
            Some(BrokerMsg::Registered(_)) => {
                tracing::warn!("Duplicate registration reply ignored");
            }
            None => tracing::warn!("Empty message from broker"),
        }
    }
}

async fn registered(
    inbound: &mut Streaming<proto::BrokerToWorker>,
) -> Result<(WorkerId, Duration)> {
    match inbound.message().await? {
        Some(proto::BrokerToWorker {
            msg: Some(BrokerMsg::Registered(reply)),
        }) => Ok((
            WorkerId(reply.worker_id),
            Duration::from_millis(reply.heartbeat_interval_ms),
        )),
        Some(_) => Err(StratumError::Protocol(
            "expected a registration reply first".into(),
        )),
        None => Err(StratumError::BrokerUnavailable),
    }
}

fn worker_message(msg: WorkerMsg) -> proto::WorkerMessage {
    proto::WorkerMessage { msg: Some(msg) }
}

fn event_to_proto(event: WorkerEvent) -> proto::WorkerMessage {
    worker_message(match event {
        WorkerEvent::Started { job_id } => WorkerMsg::Started(proto::JobStarted {
            job_id: job_id.to_string(),
        }),
        WorkerEvent::Output {
            job_id,
            stream,
            data,
        } => WorkerMsg::Output(output_to_proto(job_id, stream, data)),
        WorkerEvent::Completed { job_id, result } => {
            WorkerMsg::Completed(job_completed_to_proto(job_id, &result))
        }
    })
}
