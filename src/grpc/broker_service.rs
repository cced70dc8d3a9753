use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use crate::broker::{BrokerMessage, SchedulerHandle};
use crate::config::DEFAULT_MAX_UPLOAD_BYTES;
use crate::digest::LayerDigest;
use crate::error::StratumError;
use crate::grpc::convert::{
    job_completed_from_proto, job_from_proto, output_stream_from_proto, parse_digest,
    parse_digests, parse_job_id,
};
use crate::layer::{LayerStore, LayerStoreError};
use crate::proto::broker_service_server::BrokerService;
use crate::proto::client_message::Msg as ClientMsg;
use crate::proto::layer_reply::Msg as ReplyMsg;
use crate::proto::worker_message::Msg as WorkerMsg;
use crate::proto::{
    self, BrokerToClient, BrokerToWorker, ClientMessage, GetClusterStatusRequest,
    GetClusterStatusResponse, GetJobStatusRequest, GetJobStatusResponse, JobInfo, LayerReply,
    LayerRequest, ListJobsRequest, ListJobsResponse, WorkerInfo, WorkerMessage,
};
use crate::scheduler::{ClientEvent, ClientId, Job, RejectReason, WorkerCommand, WorkerId};

/// Size of each `LayerData` chunk served by `FetchLayer`.
pub const LAYER_CHUNK_BYTES: usize = 1 << 20;

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

impl From<StratumError> for Status {
    fn from(err: StratumError) -> Self {
        match err {
            StratumError::BrokerUnavailable => Status::unavailable(err.to_string()),
            StratumError::JobNotFound(_) => Status::not_found(err.to_string()),
            StratumError::InvalidSpec(_) | StratumError::Protocol(_) => {
                Status::invalid_argument(err.to_string())
            }
            StratumError::Grpc(status) => status,
            other => Status::internal(other.to_string()),
        }
    }
}

/// gRPC front end of the broker: client and worker sessions, layer downloads and
/// read-only queries.
#[derive(Clone)]
pub struct BrokerGrpcService {
    scheduler: SchedulerHandle,
    store: Arc<LayerStore>,
    /// FetchLayer calls served, for cluster status.
    layer_requests: Arc<AtomicU64>,
    /// Ends every open session so graceful shutdown does not wait on them.
    shutdown: CancellationToken,
    max_upload_bytes: usize,
}

impl BrokerGrpcService {
    pub fn new(
        scheduler: SchedulerHandle,
        store: Arc<LayerStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            store,
            layer_requests: Arc::new(AtomicU64::new(0)),
            shutdown,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }
}

#[tonic::async_trait]
impl BrokerService for BrokerGrpcService {
    type ClientSessionStream = ResponseStream<BrokerToClient>;
    type WorkerSessionStream = ResponseStream<BrokerToWorker>;
    type FetchLayerStream = ResponseStream<LayerReply>;

    async fn client_session(
        &self,
        request: Request<Streaming<ClientMessage>>,
    ) -> Result<Response<Self::ClientSessionStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.scheduler.client_connected(tx.clone()).await?;
        tracing::info!(client_id = %client, "Client session opened");

        let uploads = Uploads::new(self.max_upload_bytes);
        let requested = uploads.requested.clone();
        let session = ClientSession {
            client,
            scheduler: self.scheduler.clone(),
            store: self.store.clone(),
            direct: tx,
            uploads,
        };
        tokio::spawn(session.run(inbound, self.shutdown.clone()));

        // Record requests as they leave so the session only takes layers it asked for.
        let outbound = UnboundedReceiverStream::new(rx).map(move |event| {
            if let ClientEvent::LayerRequest { digest } = &event {
                requested.lock().insert(*digest);
            }
            Ok::<_, Status>(BrokerToClient::from(event))
        });
        Ok(Response::new(Box::pin(outbound)))
    }

    async fn worker_session(
        &self,
        request: Request<Streaming<WorkerMessage>>,
    ) -> Result<Response<Self::WorkerSessionStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker_session(
            self.scheduler.clone(),
            inbound,
            tx,
            self.shutdown.clone(),
        ));

        let outbound = UnboundedReceiverStream::new(rx)
            .map(|command| Ok::<_, Status>(BrokerToWorker::from(command)));
        Ok(Response::new(Box::pin(outbound)))
    }

    async fn fetch_layer(
        &self,
        request: Request<LayerRequest>,
    ) -> Result<Response<Self::FetchLayerStream>, Status> {
        let digest = parse_digest(&request.into_inner().hash)?;
        self.layer_requests.fetch_add(1, Ordering::Relaxed);

        let replies = match self.store.get(&digest).await {
            Ok(data) => layer_chunks(digest, &data),
            Err(LayerStoreError::NotFound(_)) | Err(LayerStoreError::Corrupted(_)) => {
                tracing::warn!(layer = %digest.short(), "Worker asked for a layer the store does not hold");
                vec![LayerReply {
                    msg: Some(ReplyMsg::Missing(proto::LayerMissing {
                        hash: digest.to_vec(),
                    })),
                }]
            }
            Err(e) => return Err(Status::internal(e.to_string())),
        };
        Ok(Response::new(Box::pin(tokio_stream::iter(
            replies.into_iter().map(Ok::<_, Status>),
        ))))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<GetJobStatusResponse>, Status> {
        let job_id = parse_job_id(&request.into_inner().job_id)?;
        let job = self
            .scheduler
            .job(job_id)
            .await?
            .ok_or_else(|| Status::not_found("Job not found"))?;

        Ok(Response::new(GetJobStatusResponse {
            job_id: job.id.to_string(),
            state: proto::JobState::from(job.state) as i32,
            program: job.spec.program.clone(),
            assigned_worker: job.assigned_worker.map(|w| w.0).unwrap_or(0),
            attempts: job.attempts,
            result: job.result.as_ref().map(Into::into),
            created_at_ms: job.created_at.timestamp_millis(),
            completed_at_ms: job.completed_at.map(|dt| dt.timestamp_millis()),
        }))
    }

    async fn list_jobs(
        &self,
        request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let req = request.into_inner();

        let page_size = if req.page_size == 0 {
            100
        } else {
            req.page_size.min(1000)
        } as usize;

        // Offset-based: the token is the index of the first job on the page.
        let offset: usize = if req.page_token.is_empty() {
            0
        } else {
            req.page_token
                .parse()
                .map_err(|_| Status::invalid_argument("Invalid page token"))?
        };

        let all_jobs = self.scheduler.jobs().await?;
        let total_count = all_jobs.len() as u32;

        let jobs: Vec<JobInfo> = all_jobs
            .iter()
            .skip(offset)
            .take(page_size)
            .map(job_info)
            .collect();

        let next_offset = offset + jobs.len();
        let next_page_token = if next_offset < total_count as usize {
            next_offset.to_string()
        } else {
            String::new()
        };

        Ok(Response::new(ListJobsResponse {
            jobs,
            next_page_token,
            total_count,
        }))
    }

    async fn get_cluster_status(
        &self,
        _request: Request<GetClusterStatusRequest>,
    ) -> Result<Response<GetClusterStatusResponse>, Status> {
        let stats = self.scheduler.statistics().await?;

        let workers = stats
            .workers
            .iter()
            .map(|w| WorkerInfo {
                worker_id: w.id.0,
                name: w.name.clone(),
                slots: w.slots as u32,
                free_slots: w.free_slots as u32,
                cached_layers: w.cached_layers as u32,
            })
            .collect();

        Ok(Response::new(GetClusterStatusResponse {
            workers,
            pool_version: stats.pool_version,
            num_clients: stats.num_clients as u32,
            queued_jobs: stats.queued_jobs as u32,
            running_jobs: stats.running_jobs as u32,
            completed_jobs: stats.counters.completed,
            failed_jobs: stats.counters.failed,
            cancelled_jobs: stats.counters.cancelled,
            requeued_jobs: stats.counters.requeued,
            consistency_violations: stats.counters.consistency_violations,
            layer_requests: self.layer_requests.load(Ordering::Relaxed),
            stored_layers: self.store.len() as u64,
        }))
    }
}

fn job_info(job: &Job) -> JobInfo {
    JobInfo {
        job_id: job.id.to_string(),
        state: proto::JobState::from(job.state) as i32,
        program: job.spec.program.clone(),
        assigned_worker: job.assigned_worker.map(|w| w.0).unwrap_or(0),
        created_at_ms: job.created_at.timestamp_millis(),
    }
}

/// Split a blob into `LayerData` replies. An empty blob is a single final chunk.
fn layer_chunks(digest: LayerDigest, data: &[u8]) -> Vec<LayerReply> {
    let hash = digest.to_vec();
    let mut chunks: Vec<&[u8]> = data.chunks(LAYER_CHUNK_BYTES).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| LayerReply {
            msg: Some(ReplyMsg::Data(proto::LayerData {
                hash: hash.clone(),
                data: chunk.to_vec(),
                last: i + 1 == count,
            })),
        })
        .collect()
}

/// Inbound half of one client session.
struct ClientSession {
    client: ClientId,
    scheduler: SchedulerHandle,
    store: Arc<LayerStore>,
    /// For replies the scheduler never sees, such as malformed submissions.
    direct: mpsc::UnboundedSender<ClientEvent>,
    uploads: Uploads,
}

/// What one `LayerData` chunk did to its upload.
#[derive(Debug, PartialEq, Eq)]
enum UploadStep {
    Pending,
    Complete(Vec<u8>),
    /// The broker never asked this client for the layer.
    Unrequested,
    TooLarge,
}

/// Layer uploads of one client session. Only layers requested from this client are
/// buffered, each up to `max_bytes`.
#[derive(Debug)]
struct Uploads {
    requested: Arc<Mutex<HashSet<LayerDigest>>>,
    buffers: HashMap<LayerDigest, Vec<u8>>,
    max_bytes: usize,
}

impl Uploads {
    fn new(max_bytes: usize) -> Self {
        Self {
            requested: Arc::new(Mutex::new(HashSet::new())),
            buffers: HashMap::new(),
            max_bytes,
        }
    }

    fn accept(&mut self, digest: LayerDigest, data: &[u8], last: bool) -> UploadStep {
        if !self.requested.lock().contains(&digest) {
            self.buffers.remove(&digest);
            return UploadStep::Unrequested;
        }
        let buffer = self.buffers.entry(digest).or_default();
        if buffer.len().saturating_add(data.len()) > self.max_bytes {
            self.abandon(&digest);
            return UploadStep::TooLarge;
        }
        buffer.extend_from_slice(data);
        if !last {
            return UploadStep::Pending;
        }
        let data = self.buffers.remove(&digest).unwrap_or_default();
        self.requested.lock().remove(&digest);
        UploadStep::Complete(data)
    }

    fn abandon(&mut self, digest: &LayerDigest) {
        self.buffers.remove(digest);
        self.requested.lock().remove(digest);
    }

    fn buffered_bytes(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }
}

impl ClientSession {
    async fn run(mut self, mut inbound: Streaming<ClientMessage>, shutdown: CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = inbound.message() => message,
            };
            match message {
                Ok(Some(message)) => {
                    if let Err(e) = self.handle(message).await {
                        tracing::warn!(client_id = %self.client, error = %e, "Dropping client message");
                        if matches!(e, StratumError::BrokerUnavailable) {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    tracing::debug!(client_id = %self.client, %status, "Client stream failed");
                    break;
                }
            }
        }

        tracing::info!(client_id = %self.client, "Client session closed");
        if let Err(e) = self.scheduler.client_disconnected(self.client).await {
            tracing::debug!(client_id = %self.client, error = %e, "Scheduler gone at disconnect");
        }
    }

    async fn handle(&mut self, message: ClientMessage) -> Result<(), StratumError> {
        let Some(msg) = message.msg else {
            return Err(StratumError::Protocol("empty client message".into()));
        };
        match msg {
            ClientMsg::Submit(submit) => match job_from_proto(submit.spec, submit.manifest) {
                Ok((spec, manifest)) => {
                    self.scheduler
                        .submit(self.client, submit.request_id, spec, manifest)
                        .await
                }
                Err(err) => {
                    tracing::info!(client_id = %self.client, request_id = submit.request_id, error = %err, "Rejecting malformed submission");
                    let _ = self.direct.send(ClientEvent::Rejected {
                        request_id: submit.request_id,
                        reason: RejectReason::InvalidSpec,
                        message: err.to_string(),
                    });
                    Ok(())
                }
            },
            ClientMsg::Cancel(cancel) => {
                let job_id = parse_job_id(&cancel.job_id)?;
                self.scheduler.cancel(job_id).await
            }
            ClientMsg::LayerData(chunk) => {
                let digest = parse_digest(&chunk.hash)?;
                let data = match self.uploads.accept(digest, &chunk.data, chunk.last) {
                    UploadStep::Pending => return Ok(()),
                    UploadStep::Complete(data) => data,
                    UploadStep::Unrequested => {
                        return Err(StratumError::Protocol(format!(
                            "upload of layer {} that was not requested",
                            digest.short()
                        )));
                    }
                    UploadStep::TooLarge => {
                        tracing::warn!(client_id = %self.client, layer = %digest.short(), limit = self.uploads.max_bytes, "Layer upload too large");
                        let reason = format!(
                            "layer exceeds the {} byte upload limit",
                            self.uploads.max_bytes
                        );
                        return self
                            .scheduler
                            .layer_unavailable(self.client, digest, reason)
                            .await;
                    }
                };
                match self.store.put_verified(digest, &data).await {
                    Ok(()) => self.scheduler.layer_stored(self.client, digest).await,
                    Err(e) => {
                        tracing::warn!(client_id = %self.client, layer = %digest.short(), error = %e, "Layer upload rejected");
                        self.scheduler
                            .layer_unavailable(self.client, digest, e.to_string())
                            .await
                    }
                }
            }
            ClientMsg::LayerMissing(missing) => {
                let digest = parse_digest(&missing.hash)?;
                self.uploads.abandon(&digest);
                self.scheduler
                    .layer_unavailable(
                        self.client,
                        digest,
                        format!("client does not have layer {digest}"),
                    )
                    .await
            }
        }
    }
}

async fn worker_session(
    scheduler: SchedulerHandle,
    mut inbound: Streaming<WorkerMessage>,
    outbound: mpsc::UnboundedSender<WorkerCommand>,
    shutdown: CancellationToken,
) {
    let first = tokio::select! {
        _ = shutdown.cancelled() => return,
        message = inbound.message() => message,
    };
    let register = match first {
        Ok(Some(WorkerMessage {
            msg: Some(WorkerMsg::Register(register)),
        })) => register,
        Ok(_) => {
            tracing::warn!("Worker session did not start with a registration");
            return;
        }
        Err(status) => {
            tracing::debug!(%status, "Worker stream failed before registration");
            return;
        }
    };
    let cached: HashSet<LayerDigest> = match parse_digests(&register.cached_layers) {
        Ok(digests) => digests.into_iter().collect(),
        Err(status) => {
            tracing::warn!(%status, "Malformed worker registration");
            return;
        }
    };

    let name = register.name;
    let slots = register.slots as usize;
    // The scheduler owns `outbound` from here; dropping it ends the response stream.
    let worker = match scheduler
        .worker_connected(name.clone(), slots, cached, outbound)
        .await
    {
        Ok(worker) => worker,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot register worker");
            return;
        }
    };
    tracing::info!(worker_id = %worker, name = %name, slots, "Worker registered");

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = inbound.message() => message,
        };
        match message {
            Ok(Some(message)) => match worker_event(worker, message) {
                Ok(Some(event)) => {
                    if scheduler.from_worker(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(status) => {
                    tracing::warn!(worker_id = %worker, %status, "Protocol violation, closing worker session");
                    break;
                }
            },
            Ok(None) => break,
            Err(status) => {
                tracing::debug!(worker_id = %worker, %status, "Worker stream failed");
                break;
            }
        }
    }

    if let Err(e) = scheduler.worker_disconnected(worker).await {
        tracing::debug!(worker_id = %worker, error = %e, "Scheduler gone at disconnect");
    }
}

/// Translate one worker message into a scheduler message.
fn worker_event(worker: WorkerId, message: WorkerMessage) -> Result<Option<BrokerMessage>, Status> {
    let Some(msg) = message.msg else {
        return Err(Status::invalid_argument("empty worker message"));
    };
    let event = match msg {
        WorkerMsg::Register(_) => {
            tracing::warn!(worker_id = %worker, "Ignoring repeated registration");
            return Ok(None);
        }
        WorkerMsg::Heartbeat(beat) => BrokerMessage::Heartbeat {
            worker,
            executing: beat.executing as usize,
            added: parse_digests(&beat.added_layers)?,
            evicted: parse_digests(&beat.evicted_layers)?,
        },
        WorkerMsg::Started(started) => BrokerMessage::JobStarted {
            worker,
            job_id: parse_job_id(&started.job_id)?,
        },
        WorkerMsg::Output(chunk) => BrokerMessage::JobOutput {
            worker,
            job_id: parse_job_id(&chunk.job_id)?,
            stream: output_stream_from_proto(chunk.stream)?,
            data: chunk.data,
        },
        WorkerMsg::Completed(completed) => {
            let (job_id, result) = job_completed_from_proto(completed)?;
            BrokerMessage::JobCompleted {
                worker,
                job_id,
                result,
            }
        }
        WorkerMsg::Refused(refused) => BrokerMessage::AssignmentRefused {
            worker,
            job_id: parse_job_id(&refused.job_id)?,
            reason: refused.reason,
        },
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobId;

    fn data(reply: &LayerReply) -> &proto::LayerData {
        match &reply.msg {
            Some(ReplyMsg::Data(data)) => data,
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn large_layers_are_chunked() {
        let blob = vec![7u8; LAYER_CHUNK_BYTES * 2 + 10];
        let digest = LayerDigest::compute(&blob);
        let replies = layer_chunks(digest, &blob);
        assert_eq!(replies.len(), 3);
        assert!(!data(&replies[0]).last);
        assert!(data(&replies[2]).last);
        assert_eq!(data(&replies[2]).data.len(), 10);
        let total: usize = replies.iter().map(|r| data(r).data.len()).sum();
        assert_eq!(total, blob.len());
    }

    #[test]
    fn empty_layer_is_one_final_chunk() {
        let replies = layer_chunks(LayerDigest::compute(b""), b"");
        assert_eq!(replies.len(), 1);
        assert!(data(&replies[0]).last);
    }

    #[test]
    fn worker_messages_become_scheduler_messages() {
        let job_id = JobId::new();
        let started = WorkerMessage {
            msg: Some(WorkerMsg::Started(proto::JobStarted {
                job_id: job_id.to_string(),
            })),
        };
        assert!(matches!(
            worker_event(WorkerId(3), started),
            Ok(Some(BrokerMessage::JobStarted { worker: WorkerId(3), job_id: id })) if id == job_id
        ));

        let bad = WorkerMessage {
            msg: Some(WorkerMsg::Started(proto::JobStarted {
                job_id: "nope".into(),
            })),
        };
        assert!(worker_event(WorkerId(3), bad).is_err());
        assert!(worker_event(WorkerId(3), WorkerMessage { msg: None }).is_err());
    }

    fn requested(digests: &[LayerDigest], max_bytes: usize) -> Uploads {
        let uploads = Uploads::new(max_bytes);
        uploads.requested.lock().extend(digests.iter().copied());
        uploads
    }

    #[test]
    fn requested_upload_is_assembled_from_chunks() {
        let digest = LayerDigest::compute(b"abcdef");
        let mut uploads = requested(&[digest], 1024);
        assert_eq!(uploads.accept(digest, b"abc", false), UploadStep::Pending);
        assert_eq!(
            uploads.accept(digest, b"def", true),
            UploadStep::Complete(b"abcdef".to_vec())
        );
        assert_eq!(uploads.buffered_bytes(), 0);

        // Finished uploads are not accepted again.
        assert_eq!(uploads.accept(digest, b"abc", true), UploadStep::Unrequested);
    }

    #[test]
    fn unrequested_layer_data_is_not_buffered() {
        let mut uploads = Uploads::new(1024);
        for n in 0..100u64 {
            let digest = LayerDigest::from(n);
            assert_eq!(uploads.accept(digest, &[0u8; 512], false), UploadStep::Unrequested);
        }
        assert_eq!(uploads.buffered_bytes(), 0);
    }

    #[test]
    fn oversized_upload_is_dropped() {
        let digest = LayerDigest::compute(b"big");
        let mut uploads = requested(&[digest], 1000);
        for _ in 0..3 {
            assert_eq!(uploads.accept(digest, &[1u8; 300], false), UploadStep::Pending);
        }
        assert_eq!(uploads.accept(digest, &[1u8; 300], false), UploadStep::TooLarge);
        assert_eq!(uploads.buffered_bytes(), 0);
        assert_eq!(uploads.accept(digest, &[1u8; 300], true), UploadStep::Unrequested);
        assert_eq!(uploads.buffered_bytes(), 0);
    }

    #[test]
    fn missing_layer_abandons_the_upload() {
        let digest = LayerDigest::compute(b"gone");
        let mut uploads = requested(&[digest], 1000);
        assert_eq!(uploads.accept(digest, b"go", false), UploadStep::Pending);
        uploads.abandon(&digest);
        assert_eq!(uploads.buffered_bytes(), 0);
        assert!(uploads.requested.lock().is_empty());
    }
}
