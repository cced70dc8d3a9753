//! Programmatic client.
//!
//! A [`Client`] holds one `ClientSession` stream with the broker. Jobs are submitted
//! over it, layers the broker lacks are uploaded when it asks for them, and each job's
//! state changes, output and result arrive on its [`JobHandle`].

pub mod standalone;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;

use crate::digest::LayerDigest;
use crate::error::{Result, StratumError};
use crate::grpc::convert::{
    job_completed_from_proto, job_state_from_proto, output_stream_from_proto, parse_digest,
    parse_job_id, reject_reason_from_proto,
};
use crate::grpc::LAYER_CHUNK_BYTES;
use crate::proto;
use crate::proto::broker_service_client::BrokerServiceClient;
use crate::proto::broker_to_client::Msg as BrokerMsg;
use crate::proto::client_message::Msg as ClientMsg;
use crate::scheduler::{JobId, JobState, Outcome, OutputStream, RejectReason, ResultRecord};
use crate::spec::{JobSpec, LayerManifest};

pub use standalone::{Standalone, StandaloneConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that happened to a submitted job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    StateChanged(JobState),
    Output { stream: OutputStream, data: Vec<u8> },
    Completed(ResultRecord),
}

/// A finished job with its collected output.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub result: ResultRecord,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl JobOutcome {
    pub fn exit_code(&self) -> i32 {
        exit_code(&self.result.outcome)
    }
}

/// Process exit code for a CLI mirroring a job: the job's own code when it exited,
/// `128 + signal` when it was killed, 1 otherwise.
pub fn exit_code(outcome: &Outcome) -> i32 {
    match outcome {
        Outcome::Exited(code) => *code,
        Outcome::Signaled(signal) => 128 + signal,
        Outcome::Failed(_) | Outcome::Cancelled => 1,
    }
}

/// Where the bytes of a registered layer come from.
#[derive(Debug, Clone)]
enum LayerBytes {
    Memory(Arc<Vec<u8>>),
    File(PathBuf),
}

impl LayerBytes {
    async fn load(&self) -> std::io::Result<Vec<u8>> {
        match self {
            LayerBytes::Memory(data) => Ok(data.as_ref().clone()),
            LayerBytes::File(path) => tokio::fs::read(path).await,
        }
    }
}

type Submission = std::result::Result<(JobId, mpsc::UnboundedReceiver<JobEvent>), StratumError>;

#[derive(Default)]
struct SessionState {
    layers: HashMap<LayerDigest, LayerBytes>,
    next_request: u64,
    submissions: HashMap<u64, oneshot::Sender<Submission>>,
    jobs: HashMap<JobId, mpsc::UnboundedSender<JobEvent>>,
}

pub struct Client {
    outbound: mpsc::UnboundedSender<proto::ClientMessage>,
    state: Arc<Mutex<SessionState>>,
    queries: BrokerServiceClient<Channel>,
    reader: JoinHandle<()>,
}

impl Client {
    /// Open a session with the broker at `url`, e.g. `http://127.0.0.1:9900`.
    pub async fn connect(url: impl Into<String>) -> Result<Self> {
        let channel = Endpoint::from_shared(url.into())?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await?;
        let mut queries = BrokerServiceClient::new(channel);

        let (outbound, rx) = mpsc::unbounded_channel();
        let inbound = queries
            .client_session(UnboundedReceiverStream::new(rx))
            .await?
            .into_inner();

        let state = Arc::new(Mutex::new(SessionState::default()));
        let reader = tokio::spawn(read_session(inbound, state.clone(), outbound.clone()));

        Ok(Self {
            outbound,
            state,
            queries,
            reader,
        })
    }

    /// Make in-memory layer bytes available to the broker on request.
    pub fn add_layer(&self, data: Vec<u8>) -> LayerDigest {
        let digest = LayerDigest::compute(&data);
        self.state
            .lock()
            .layers
            .insert(digest, LayerBytes::Memory(Arc::new(data)));
        digest
    }

    /// Register a layer tarball on disk. It is hashed now and re-read only if the
    /// broker asks for it.
    pub async fn add_layer_file(&self, path: impl AsRef<Path>) -> Result<LayerDigest> {
        let path = path.as_ref().to_path_buf();
        let data = tokio::fs::read(&path).await?;
        let digest = LayerDigest::compute(&data);
        self.state
            .lock()
            .layers
            .insert(digest, LayerBytes::File(path));
        Ok(digest)
    }

    /// Submit a job. Resolves once the broker has accepted it, which may involve
    /// uploading layers it asks for.
    pub async fn submit(&self, spec: JobSpec, manifest: LayerManifest) -> Result<JobHandle> {
        let (reply, accepted) = oneshot::channel();
        let request_id = {
            let mut state = self.state.lock();
            state.next_request += 1;
            let request_id = state.next_request;
            state.submissions.insert(request_id, reply);
            request_id
        };

        self.send(ClientMsg::Submit(proto::SubmitJob {
            request_id,
            spec: Some((&spec).into()),
            manifest: Some((&manifest).into()),
        }))?;

        let (job_id, events) = accepted
            .await
            .map_err(|_| StratumError::BrokerUnavailable)??;
        Ok(JobHandle {
            job_id,
            events,
            outbound: self.outbound.clone(),
        })
    }

    /// Submit a job and wait for its result.
    pub async fn run(&self, spec: JobSpec, manifest: LayerManifest) -> Result<JobOutcome> {
        self.submit(spec, manifest).await?.wait().await
    }

    pub fn cancel(&self, job_id: JobId) -> Result<()> {
        self.send(ClientMsg::Cancel(proto::CancelJob {
            job_id: job_id.to_string(),
        }))
    }

    pub async fn job_status(&self, job_id: JobId) -> Result<proto::GetJobStatusResponse> {
        let response = self
            .queries
            .clone()
            .get_job_status(proto::GetJobStatusRequest {
                job_id: job_id.to_string(),
            })
            .await?;
        Ok(response.into_inner())
    }

    pub async fn list_jobs(
        &self,
        page_size: u32,
        page_token: String,
    ) -> Result<proto::ListJobsResponse> {
        let response = self
            .queries
            .clone()
            .list_jobs(proto::ListJobsRequest {
                page_size,
                page_token,
            })
            .await?;
        Ok(response.into_inner())
    }

    pub async fn cluster_status(&self) -> Result<proto::GetClusterStatusResponse> {
        let response = self
            .queries
            .clone()
            .get_cluster_status(proto::GetClusterStatusRequest {})
            .await?;
        Ok(response.into_inner())
    }

    fn send(&self, msg: ClientMsg) -> Result<()> {
        self.outbound
            .send(proto::ClientMessage { msg: Some(msg) })
            .map_err(|_| StratumError::BrokerUnavailable)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// An accepted job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    events: mpsc::UnboundedReceiver<JobEvent>,
    outbound: mpsc::UnboundedSender<proto::ClientMessage>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.job_id
    }

    /// Next event, or `None` once the job completed or the session ended.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) -> Result<()> {
        self.outbound
            .send(proto::ClientMessage {
                msg: Some(ClientMsg::Cancel(proto::CancelJob {
                    job_id: self.job_id.to_string(),
                })),
            })
            .map_err(|_| StratumError::BrokerUnavailable)
    }

    /// Collect output until the job finishes.
    pub async fn wait(mut self) -> Result<JobOutcome> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(event) = self.events.recv().await {
            match event {
                JobEvent::StateChanged(state) => {
                    tracing::debug!(job_id = %self.job_id, %state, "Job state changed");
                }
                JobEvent::Output { stream, data } => match stream {
                    OutputStream::Stdout => stdout.extend_from_slice(&data),
                    OutputStream::Stderr => stderr.extend_from_slice(&data),
                },
                JobEvent::Completed(result) => {
                    return Ok(JobOutcome {
                        job_id: self.job_id,
                        result,
                        stdout,
                        stderr,
                    })
                }
            }
        }
        Err(StratumError::BrokerUnavailable)
    }
}

/// Dispatch broker messages to submitters and job handles, and serve layer requests.
async fn read_session(
    mut inbound: Streaming<proto::BrokerToClient>,
    state: Arc<Mutex<SessionState>>,
    outbound: mpsc::UnboundedSender<proto::ClientMessage>,
) {
    loop {
        let msg = match inbound.message().await {
            Ok(Some(proto::BrokerToClient { msg: Some(msg) })) => msg,
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(status) => {
                tracing::warn!(%status, "Broker session failed");
                break;
            }
        };
        if let Err(status) = dispatch(msg, &state, &outbound) {
            tracing::warn!(%status, "Ignoring malformed broker message");
        }
    }

    // Dropping the senders fails pending submissions and ends every job's events.
    let mut state = state.lock();
    state.submissions.clear();
    state.jobs.clear();
}

fn dispatch(
    msg: BrokerMsg,
    state: &Mutex<SessionState>,
    outbound: &mpsc::UnboundedSender<proto::ClientMessage>,
) -> std::result::Result<(), tonic::Status> {
    match msg {
        BrokerMsg::Accepted(accepted) => {
            let job_id = parse_job_id(&accepted.job_id)?;
            let (tx, rx) = mpsc::unbounded_channel();
            let mut state = state.lock();
            if let Some(reply) = state.submissions.remove(&accepted.request_id) {
                if reply.send(Ok((job_id, rx))).is_ok() {
                    state.jobs.insert(job_id, tx);
                }
            }
        }
        BrokerMsg::Rejected(rejected) => {
            let reason = match reject_reason_from_proto(rejected.reason) {
                RejectReason::InvalidSpec => "invalid spec",
                RejectReason::QueueFull => "queue full",
            };
            if let Some(reply) = state.lock().submissions.remove(&rejected.request_id) {
                let _ = reply.send(Err(StratumError::Rejected(format!(
                    "{reason}: {}",
                    rejected.message
                ))));
            }
        }
        BrokerMsg::StateChanged(changed) => {
            let job_id = parse_job_id(&changed.job_id)?;
            let job_state = job_state_from_proto(changed.state)
                .ok_or_else(|| tonic::Status::invalid_argument("unknown job state"))?;
            deliver(state, job_id, JobEvent::StateChanged(job_state), false);
        }
        BrokerMsg::Output(chunk) => {
            let job_id = parse_job_id(&chunk.job_id)?;
            let stream = output_stream_from_proto(chunk.stream)?;
            deliver(
                state,
                job_id,
                JobEvent::Output {
                    stream,
                    data: chunk.data,
                },
                false,
            );
        }
        BrokerMsg::Completed(completed) => {
            let (job_id, result) = job_completed_from_proto(completed)?;
            deliver(state, job_id, JobEvent::Completed(result), true);
        }
        BrokerMsg::LayerRequest(request) => {
            let digest = parse_digest(&request.hash)?;
            let source = state.lock().layers.get(&digest).cloned();
            tokio::spawn(upload(digest, source, outbound.clone()));
        }
    }
    Ok(())
}

fn deliver(state: &Mutex<SessionState>, job_id: JobId, event: JobEvent, last: bool) {
    let mut state = state.lock();
    if let Some(tx) = state.jobs.get(&job_id) {
        let _ = tx.send(event);
    }
    if last {
        state.jobs.remove(&job_id);
    }
}

async fn upload(
    digest: LayerDigest,
    source: Option<LayerBytes>,
    outbound: mpsc::UnboundedSender<proto::ClientMessage>,
) {
    let data = match source {
        Some(source) => match source.load().await {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::warn!(layer = %digest.short(), error = %e, "Cannot read layer");
                None
            }
        },
        None => None,
    };

    let messages = match data {
        Some(data) => {
            tracing::debug!(layer = %digest.short(), bytes = data.len(), "Uploading layer");
            layer_upload(digest, &data)
        }
        None => {
            tracing::warn!(layer = %digest.short(), "Broker asked for a layer this client does not have");
            vec![ClientMsg::LayerMissing(proto::LayerMissing {
                hash: digest.to_vec(),
            })]
        }
    };
    for msg in messages {
        if outbound.send(proto::ClientMessage { msg: Some(msg) }).is_err() {
            break;
        }
    }
}

fn layer_upload(digest: LayerDigest, data: &[u8]) -> Vec<ClientMsg> {
    let hash = digest.to_vec();
    let mut chunks: Vec<&[u8]> = data.chunks(LAYER_CHUNK_BYTES).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            ClientMsg::LayerData(proto::LayerData {
                hash: hash.clone(),
                data: chunk.to_vec(),
                last: i + 1 == count,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{FailureKind, FailureReason};

    #[test]
    fn exit_code_mirrors_the_outcome() {
        let outcome = |outcome| JobOutcome {
            job_id: JobId::new(),
            result: ResultRecord::new(outcome, Duration::ZERO),
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert_eq!(outcome(Outcome::Exited(3)).exit_code(), 3);
        assert_eq!(outcome(Outcome::Signaled(9)).exit_code(), 137);
        assert_eq!(outcome(Outcome::Cancelled).exit_code(), 1);
        let failed = Outcome::Failed(FailureReason::new(FailureKind::Internal, "x"));
        assert_eq!(outcome(failed).exit_code(), 1);
    }

    #[test]
    fn uploads_end_with_a_last_chunk() {
        let data = vec![1u8; LAYER_CHUNK_BYTES + 1];
        let messages = layer_upload(LayerDigest::compute(&data), &data);
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[1], ClientMsg::LayerData(d) if d.last && d.data.len() == 1));
    }

    #[tokio::test]
    async fn unknown_layer_is_answered_with_missing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let digest = LayerDigest::compute(b"nothing");
        upload(digest, None, tx).await;
        let message = rx.recv().await.unwrap();
        assert!(matches!(
            message.msg,
            Some(ClientMsg::LayerMissing(ref m)) if m.hash == digest.to_vec()
        ));
    }

    #[tokio::test]
    async fn events_are_routed_to_their_job() {
        let state = Mutex::new(SessionState::default());
        let (outbound, _rx) = mpsc::unbounded_channel();
        let (reply, accepted) = oneshot::channel();
        state.lock().submissions.insert(1, reply);

        let job_id = JobId::new();
        dispatch(
            BrokerMsg::Accepted(proto::JobAccepted {
                request_id: 1,
                job_id: job_id.to_string(),
            }),
            &state,
            &outbound,
        )
        .unwrap();
        let (accepted_id, mut events) = accepted.await.unwrap().unwrap();
        assert_eq!(accepted_id, job_id);

        dispatch(
            BrokerMsg::Completed(crate::grpc::convert::job_completed_to_proto(
                job_id,
                &ResultRecord::new(Outcome::Exited(0), Duration::from_millis(5)),
            )),
            &state,
            &outbound,
        )
        .unwrap();
        assert!(matches!(events.recv().await, Some(JobEvent::Completed(_))));
        assert!(events.recv().await.is_none());
    }
}
