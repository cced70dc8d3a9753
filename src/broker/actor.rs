//! The scheduler actor.
//!
//! One task owns the [`Scheduler`] and the outbound channel of every connection.
//! Connection tasks talk to it only through [`SchedulerHandle`]; it routes the
//! scheduler's effects to those channels without ever awaiting network I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::digest::LayerDigest;
use crate::error::{Result, StratumError};
use crate::layer::LayerStore;
use crate::scheduler::{
    ClientEvent, ClientId, Effect, Job, JobId, OutputStream, ResultRecord, Scheduler, Statistics,
    WorkerCommand, WorkerId,
};
use crate::spec::{JobSpec, LayerManifest};

const MAILBOX_CAPACITY: usize = 1024;

pub enum BrokerMessage {
    ClientConnected {
        outbound: mpsc::UnboundedSender<ClientEvent>,
        reply: oneshot::Sender<ClientId>,
    },
    ClientDisconnected(ClientId),
    Submit {
        client: ClientId,
        request_id: u64,
        spec: JobSpec,
        manifest: LayerManifest,
    },
    Cancel(JobId),
    LayerStored {
        client: ClientId,
        digest: LayerDigest,
    },
    LayerUnavailable {
        client: ClientId,
        digest: LayerDigest,
        message: String,
    },
    WorkerConnected {
        name: String,
        slots: usize,
        cached_layers: HashSet<LayerDigest>,
        outbound: mpsc::UnboundedSender<WorkerCommand>,
        reply: oneshot::Sender<WorkerId>,
    },
    WorkerDisconnected(WorkerId),
    Heartbeat {
        worker: WorkerId,
        executing: usize,
        added: Vec<LayerDigest>,
        evicted: Vec<LayerDigest>,
    },
    JobStarted {
        worker: WorkerId,
        job_id: JobId,
    },
    JobOutput {
        worker: WorkerId,
        job_id: JobId,
        stream: OutputStream,
        data: Vec<u8>,
    },
    JobCompleted {
        worker: WorkerId,
        job_id: JobId,
        result: ResultRecord,
    },
    AssignmentRefused {
        worker: WorkerId,
        job_id: JobId,
        reason: String,
    },
    GetJob {
        job_id: JobId,
        reply: oneshot::Sender<Option<Job>>,
    },
    ListJobs {
        reply: oneshot::Sender<Vec<Job>>,
    },
    Statistics {
        reply: oneshot::Sender<Statistics>,
    },
}

/// Cloneable front door to the scheduler actor.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<BrokerMessage>,
}

impl SchedulerHandle {
    async fn send(&self, message: BrokerMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| StratumError::BrokerUnavailable)
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> BrokerMessage) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| StratumError::BrokerUnavailable)
    }

    pub async fn client_connected(
        &self,
        outbound: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<ClientId> {
        self.ask(|reply| BrokerMessage::ClientConnected { outbound, reply })
            .await
    }

    pub async fn client_disconnected(&self, client: ClientId) -> Result<()> {
        self.send(BrokerMessage::ClientDisconnected(client)).await
    }

    pub async fn submit(
        &self,
        client: ClientId,
        request_id: u64,
        spec: JobSpec,
        manifest: LayerManifest,
    ) -> Result<()> {
        self.send(BrokerMessage::Submit {
            client,
            request_id,
            spec,
            manifest,
        })
        .await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        self.send(BrokerMessage::Cancel(job_id)).await
    }

    pub async fn layer_stored(&self, client: ClientId, digest: LayerDigest) -> Result<()> {
        self.send(BrokerMessage::LayerStored { client, digest }).await
    }

    pub async fn layer_unavailable(
        &self,
        client: ClientId,
        digest: LayerDigest,
        message: String,
    ) -> Result<()> {
        self.send(BrokerMessage::LayerUnavailable {
            client,
            digest,
            message,
        })
        .await
    }

    pub async fn worker_connected(
        &self,
        name: String,
        slots: usize,
        cached_layers: HashSet<LayerDigest>,
        outbound: mpsc::UnboundedSender<WorkerCommand>,
    ) -> Result<WorkerId> {
        self.ask(|reply| BrokerMessage::WorkerConnected {
            name,
            slots,
            cached_layers,
            outbound,
            reply,
        })
        .await
    }

    pub async fn worker_disconnected(&self, worker: WorkerId) -> Result<()> {
        self.send(BrokerMessage::WorkerDisconnected(worker)).await
    }

    /// Forward a message from a worker session.
    pub async fn from_worker(&self, message: BrokerMessage) -> Result<()> {
        self.send(message).await
    }

    pub async fn job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.ask(|reply| BrokerMessage::GetJob { job_id, reply }).await
    }

    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.ask(|reply| BrokerMessage::ListJobs { reply }).await
    }

    pub async fn statistics(&self) -> Result<Statistics> {
        self.ask(|reply| BrokerMessage::Statistics { reply }).await
    }
}

pub struct SchedulerActor {
    scheduler: Scheduler,
    store: Arc<LayerStore>,
    rx: mpsc::Receiver<BrokerMessage>,
    clients: HashMap<ClientId, mpsc::UnboundedSender<ClientEvent>>,
    workers: HashMap<WorkerId, mpsc::UnboundedSender<WorkerCommand>>,
    next_client: u64,
    tick_interval: Duration,
}

impl SchedulerActor {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<LayerStore>,
        tick_interval: Duration,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = Self {
            scheduler: Scheduler::new(config),
            store,
            rx,
            clients: HashMap::new(),
            workers: HashMap::new(),
            next_client: 1,
            tick_interval,
        };
        (actor, SchedulerHandle { tx })
    }

    /// Process messages and ticks until `shutdown` fires or every handle is gone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.tick_interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let effects = self.scheduler.tick(Instant::now());
                    self.route(effects);
                }
                message = self.rx.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
            }
        }
        tracing::info!("Scheduler stopped");
    }

    fn handle(&mut self, message: BrokerMessage) {
        let now = Instant::now();
        let effects = match message {
            BrokerMessage::ClientConnected { outbound, reply } => {
                let client = ClientId(self.next_client);
                self.next_client += 1;
                self.clients.insert(client, outbound);
                self.scheduler.client_connected(client);
                let _ = reply.send(client);
                Vec::new()
            }
            BrokerMessage::ClientDisconnected(client) => {
                self.clients.remove(&client);
                self.scheduler.client_disconnected(client)
            }
            BrokerMessage::Submit {
                client,
                request_id,
                spec,
                manifest,
            } => self
                .scheduler
                .submit(client, request_id, spec, manifest, self.store.as_ref()),
            BrokerMessage::Cancel(job_id) => self.scheduler.cancel(job_id, now),
            BrokerMessage::LayerStored { client, digest } => {
                self.scheduler.layer_stored(client, digest)
            }
            BrokerMessage::LayerUnavailable {
                client,
                digest,
                message,
            } => self.scheduler.layer_unavailable(client, digest, &message),
            BrokerMessage::WorkerConnected {
                name,
                slots,
                cached_layers,
                outbound,
                reply,
            } => {
                let (worker, effects) =
                    self.scheduler
                        .register_worker(name, slots, cached_layers, now);
                self.workers.insert(worker, outbound);
                let _ = reply.send(worker);
                effects
            }
            BrokerMessage::WorkerDisconnected(worker) => {
                self.workers.remove(&worker);
                self.scheduler.worker_disconnected(worker)
            }
            BrokerMessage::Heartbeat {
                worker,
                executing,
                added,
                evicted,
            } => {
                self.scheduler
                    .heartbeat(worker, executing, &added, &evicted, now);
                Vec::new()
            }
            BrokerMessage::JobStarted { worker, job_id } => {
                self.scheduler.job_started(worker, job_id, now)
            }
            BrokerMessage::JobOutput {
                worker,
                job_id,
                stream,
                data,
            } => self.scheduler.job_output(worker, job_id, stream, data, now),
            BrokerMessage::JobCompleted {
                worker,
                job_id,
                result,
            } => self.scheduler.job_completed(worker, job_id, result, now),
            BrokerMessage::AssignmentRefused {
                worker,
                job_id,
                reason,
            } => self
                .scheduler
                .assignment_refused(worker, job_id, &reason, now),
            BrokerMessage::GetJob { job_id, reply } => {
                let _ = reply.send(self.scheduler.job(&job_id).cloned());
                Vec::new()
            }
            BrokerMessage::ListJobs { reply } => {
                let _ = reply.send(self.scheduler.jobs().into_iter().cloned().collect());
                Vec::new()
            }
            BrokerMessage::Statistics { reply } => {
                let _ = reply.send(self.scheduler.statistics());
                Vec::new()
            }
        };
        self.route(effects);
    }

    fn route(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Client(client, event) => {
                    if let Some(tx) = self.clients.get(&client) {
                        let _ = tx.send(event);
                    }
                }
                Effect::Worker(worker, command) => match self.workers.get(&worker) {
                    Some(tx) => {
                        let _ = tx.send(command);
                    }
                    None => tracing::warn!(worker_id = %worker, "No session for worker command"),
                },
                Effect::DisconnectWorker(worker) => {
                    // Dropping the sender ends the worker's response stream.
                    self.workers.remove(&worker);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobState;
    use tempfile::TempDir;

    async fn start() -> (TempDir, SchedulerHandle, CancellationToken) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LayerStore::open(dir.path()).await.unwrap());
        let (actor, handle) =
            SchedulerActor::new(SchedulerConfig::default(), store, Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        tokio::spawn(actor.run(shutdown.clone()));
        (dir, handle, shutdown)
    }

    #[tokio::test]
    async fn submission_is_assigned_to_a_connected_worker() {
        let (_dir, handle, shutdown) = start().await;

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let client = handle.client_connected(client_tx).await.unwrap();
        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel();
        let worker = handle
            .worker_connected("w".into(), 1, HashSet::new(), worker_tx)
            .await
            .unwrap();
        assert!(matches!(
            worker_rx.recv().await,
            Some(WorkerCommand::Registered { worker_id, .. }) if worker_id == worker
        ));

        handle
            .submit(client, 7, JobSpec::new("/bin/true"), LayerManifest::default())
            .await
            .unwrap();
        let job_id = match client_rx.recv().await {
            Some(ClientEvent::Accepted { request_id: 7, job_id }) => job_id,
            other => panic!("unexpected event {other:?}"),
        };
        assert!(matches!(
            worker_rx.recv().await,
            Some(WorkerCommand::Assign { job_id: id, .. }) if id == job_id
        ));

        let job = handle.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(handle.statistics().await.unwrap().workers.len(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn handle_fails_once_the_actor_stops() {
        let (_dir, handle, shutdown) = start().await;
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            handle.jobs().await,
            Err(StratumError::BrokerUnavailable)
        ));
    }
}
