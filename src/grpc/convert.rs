//! Conversions between domain types and their protobuf messages.

use std::time::Duration;

use tonic::Status;

use crate::digest::LayerDigest;
use crate::proto;
use crate::proto::broker_to_client::Msg as ClientMsg;
use crate::proto::broker_to_worker::Msg as WorkerMsg;
use crate::proto::job_mount::Kind as MountKind;
use crate::proto::result_record::Outcome as ProtoOutcome;
use crate::scheduler::{
    ClientEvent, FailureKind, FailureReason, JobId, JobState, Outcome, OutputStream,
    RejectReason, ResultRecord, WorkerCommand,
};
use crate::spec::{InvalidSpec, JobMount, JobSpec, LayerManifest, ResourceLimits};

pub fn parse_job_id(raw: &str) -> Result<JobId, Status> {
    raw.parse()
        .map_err(|_| Status::invalid_argument(format!("invalid job id: {raw:?}")))
}

pub fn parse_digest(raw: &[u8]) -> Result<LayerDigest, Status> {
    LayerDigest::from_slice(raw).map_err(|e| Status::invalid_argument(e.to_string()))
}

pub fn parse_digests(raw: &[Vec<u8>]) -> Result<Vec<LayerDigest>, Status> {
    raw.iter().map(|d| parse_digest(d)).collect()
}

pub fn digests_to_proto(digests: &[LayerDigest]) -> Vec<Vec<u8>> {
    digests.iter().map(LayerDigest::to_vec).collect()
}

// ---- job spec ----

impl From<&JobMount> for proto::JobMount {
    fn from(mount: &JobMount) -> Self {
        let kind = match mount {
            JobMount::Bind {
                source,
                target,
                read_only,
            } => MountKind::Bind(proto::BindMount {
                source: source.clone(),
                target: target.clone(),
                read_only: *read_only,
            }),
            JobMount::Tmp { target } => MountKind::Tmp(proto::TmpMount {
                target: target.clone(),
            }),
            JobMount::Proc { target } => MountKind::Proc(proto::ProcMount {
                target: target.clone(),
            }),
        };
        proto::JobMount { kind: Some(kind) }
    }
}

impl TryFrom<proto::JobMount> for JobMount {
    type Error = InvalidSpec;

    fn try_from(mount: proto::JobMount) -> Result<Self, Self::Error> {
        match mount.kind {
            Some(MountKind::Bind(b)) => Ok(JobMount::Bind {
                source: b.source,
                target: b.target,
                read_only: b.read_only,
            }),
            Some(MountKind::Tmp(t)) => Ok(JobMount::Tmp { target: t.target }),
            Some(MountKind::Proc(p)) => Ok(JobMount::Proc { target: p.target }),
            None => Err(InvalidSpec("mount without a kind".into())),
        }
    }
}

impl From<&JobSpec> for proto::JobSpec {
    fn from(spec: &JobSpec) -> Self {
        proto::JobSpec {
            program: spec.program.clone(),
            arguments: spec.arguments.clone(),
            environment: spec
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            working_directory: spec.working_directory.clone(),
            user: spec.user,
            group: spec.group,
            mounts: spec.mounts.iter().map(Into::into).collect(),
            limits: Some(proto::ResourceLimits {
                timeout_ms: spec.limits.timeout_ms,
                memory_bytes: spec.limits.memory_bytes,
                cpu_seconds: spec.limits.cpu_seconds,
            }),
            enable_loopback: spec.enable_loopback,
            writable_root: spec.writable_root,
        }
    }
}

impl TryFrom<proto::JobSpec> for JobSpec {
    type Error = InvalidSpec;

    fn try_from(spec: proto::JobSpec) -> Result<Self, Self::Error> {
        let mounts = spec
            .mounts
            .into_iter()
            .map(JobMount::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let limits = spec.limits.unwrap_or_default();
        Ok(JobSpec {
            program: spec.program,
            arguments: spec.arguments,
            environment: spec.environment.into_iter().collect(),
            working_directory: if spec.working_directory.is_empty() {
                "/".to_string()
            } else {
                spec.working_directory
            },
            user: spec.user,
            group: spec.group,
            mounts,
            limits: ResourceLimits {
                timeout_ms: limits.timeout_ms,
                memory_bytes: limits.memory_bytes,
                cpu_seconds: limits.cpu_seconds,
            },
            enable_loopback: spec.enable_loopback,
            writable_root: spec.writable_root,
        })
    }
}

impl From<&LayerManifest> for proto::LayerManifest {
    fn from(manifest: &LayerManifest) -> Self {
        proto::LayerManifest {
            layers: digests_to_proto(&manifest.layers),
        }
    }
}

impl TryFrom<proto::LayerManifest> for LayerManifest {
    type Error = InvalidSpec;

    fn try_from(manifest: proto::LayerManifest) -> Result<Self, Self::Error> {
        manifest
            .layers
            .iter()
            .map(|raw| LayerDigest::from_slice(raw).map_err(|e| InvalidSpec(e.to_string())))
            .collect()
    }
}

/// Decode the spec and manifest carried by a submission or an assignment.
pub fn job_from_proto(
    spec: Option<proto::JobSpec>,
    manifest: Option<proto::LayerManifest>,
) -> Result<(JobSpec, LayerManifest), InvalidSpec> {
    let spec = spec
        .ok_or_else(|| InvalidSpec("missing job spec".into()))?
        .try_into()?;
    let manifest = manifest.unwrap_or_default().try_into()?;
    Ok((spec, manifest))
}

// ---- enums ----

impl From<JobState> for proto::JobState {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Queued => proto::JobState::Queued,
            JobState::Scheduled => proto::JobState::Scheduled,
            JobState::Executing => proto::JobState::Executing,
            JobState::Completed => proto::JobState::Completed,
            JobState::Failed => proto::JobState::Failed,
            JobState::Cancelled => proto::JobState::Cancelled,
        }
    }
}

pub fn job_state_from_proto(raw: i32) -> Option<JobState> {
    match proto::JobState::try_from(raw).ok()? {
        proto::JobState::Unspecified => None,
        proto::JobState::Queued => Some(JobState::Queued),
        proto::JobState::Scheduled => Some(JobState::Scheduled),
        proto::JobState::Executing => Some(JobState::Executing),
        proto::JobState::Completed => Some(JobState::Completed),
        proto::JobState::Failed => Some(JobState::Failed),
        proto::JobState::Cancelled => Some(JobState::Cancelled),
    }
}

impl From<OutputStream> for proto::OutputStream {
    fn from(stream: OutputStream) -> Self {
        match stream {
            OutputStream::Stdout => proto::OutputStream::Stdout,
            OutputStream::Stderr => proto::OutputStream::Stderr,
        }
    }
}

pub fn output_stream_from_proto(raw: i32) -> Result<OutputStream, Status> {
    match proto::OutputStream::try_from(raw) {
        Ok(proto::OutputStream::Stdout) => Ok(OutputStream::Stdout),
        Ok(proto::OutputStream::Stderr) => Ok(OutputStream::Stderr),
        _ => Err(Status::invalid_argument("unknown output stream")),
    }
}

impl From<FailureKind> for proto::FailureKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::LayerFetch => proto::FailureKind::LayerFetch,
            FailureKind::ContainerSetup => proto::FailureKind::ContainerSetup,
            FailureKind::ExecutionTimeout => proto::FailureKind::ExecutionTimeout,
            FailureKind::WorkerLost => proto::FailureKind::WorkerLost,
            FailureKind::Internal => proto::FailureKind::Internal,
        }
    }
}

fn failure_kind_from_proto(raw: i32) -> FailureKind {
    match proto::FailureKind::try_from(raw) {
        Ok(proto::FailureKind::LayerFetch) => FailureKind::LayerFetch,
        Ok(proto::FailureKind::ContainerSetup) => FailureKind::ContainerSetup,
        Ok(proto::FailureKind::ExecutionTimeout) => FailureKind::ExecutionTimeout,
        Ok(proto::FailureKind::WorkerLost) => FailureKind::WorkerLost,
        _ => FailureKind::Internal,
    }
}

impl From<RejectReason> for proto::RejectReason {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::InvalidSpec => proto::RejectReason::InvalidSpec,
            RejectReason::QueueFull => proto::RejectReason::QueueFull,
        }
    }
}

pub fn reject_reason_from_proto(raw: i32) -> RejectReason {
    match proto::RejectReason::try_from(raw) {
        Ok(proto::RejectReason::QueueFull) => RejectReason::QueueFull,
        _ => RejectReason::InvalidSpec,
    }
}

// ---- results ----

impl From<&ResultRecord> for proto::ResultRecord {
    fn from(result: &ResultRecord) -> Self {
        let outcome = match &result.outcome {
            Outcome::Exited(code) => ProtoOutcome::Exited(*code),
            Outcome::Signaled(signal) => ProtoOutcome::Signaled(*signal),
            Outcome::Failed(reason) => ProtoOutcome::Failure(proto::Failure {
                kind: proto::FailureKind::from(reason.kind) as i32,
                message: reason.message.clone(),
            }),
            Outcome::Cancelled => ProtoOutcome::Cancelled(true),
        };
        proto::ResultRecord {
            outcome: Some(outcome),
            duration_ms: result.duration.as_millis() as u64,
            stdout_truncated: result.stdout_truncated,
            stderr_truncated: result.stderr_truncated,
        }
    }
}

impl TryFrom<proto::ResultRecord> for ResultRecord {
    type Error = Status;

    fn try_from(result: proto::ResultRecord) -> Result<Self, Self::Error> {
        let outcome = match result.outcome {
            Some(ProtoOutcome::Exited(code)) => Outcome::Exited(code),
            Some(ProtoOutcome::Signaled(signal)) => Outcome::Signaled(signal),
            Some(ProtoOutcome::Failure(f)) => {
                Outcome::Failed(FailureReason::new(failure_kind_from_proto(f.kind), f.message))
            }
            Some(ProtoOutcome::Cancelled(_)) => Outcome::Cancelled,
            None => return Err(Status::invalid_argument("result without an outcome")),
        };
        Ok(ResultRecord {
            outcome,
            duration: Duration::from_millis(result.duration_ms),
            stdout_truncated: result.stdout_truncated,
            stderr_truncated: result.stderr_truncated,
        })
    }
}

pub fn job_completed_to_proto(job_id: JobId, result: &ResultRecord) -> proto::JobCompleted {
    proto::JobCompleted {
        job_id: job_id.to_string(),
        result: Some(result.into()),
    }
}

pub fn job_completed_from_proto(msg: proto::JobCompleted) -> Result<(JobId, ResultRecord), Status> {
    let job_id = parse_job_id(&msg.job_id)?;
    let result = msg
        .result
        .ok_or_else(|| Status::invalid_argument("completion without a result"))?
        .try_into()?;
    Ok((job_id, result))
}

pub fn output_to_proto(job_id: JobId, stream: OutputStream, data: Vec<u8>) -> proto::JobOutputChunk {
    proto::JobOutputChunk {
        job_id: job_id.to_string(),
        stream: proto::OutputStream::from(stream) as i32,
        data,
    }
}

// ---- session messages ----

impl From<ClientEvent> for proto::BrokerToClient {
    fn from(event: ClientEvent) -> Self {
        let msg = match event {
            ClientEvent::Accepted { request_id, job_id } => ClientMsg::Accepted(proto::JobAccepted {
                request_id,
                job_id: job_id.to_string(),
            }),
            ClientEvent::Rejected {
                request_id,
                reason,
                message,
            } => ClientMsg::Rejected(proto::JobRejected {
                request_id,
                reason: proto::RejectReason::from(reason) as i32,
                message,
            }),
            ClientEvent::StateChanged { job_id, state } => {
                ClientMsg::StateChanged(proto::JobStateChanged {
                    job_id: job_id.to_string(),
                    state: proto::JobState::from(state) as i32,
                })
            }
            ClientEvent::Output {
                job_id,
                stream,
                data,
            } => ClientMsg::Output(output_to_proto(job_id, stream, data)),
            ClientEvent::Completed { job_id, result } => {
                ClientMsg::Completed(job_completed_to_proto(job_id, &result))
            }
            ClientEvent::LayerRequest { digest } => ClientMsg::LayerRequest(proto::LayerRequest {
                hash: digest.to_vec(),
            }),
        };
        proto::BrokerToClient { msg: Some(msg) }
    }
}

impl From<WorkerCommand> for proto::BrokerToWorker {
    fn from(command: WorkerCommand) -> Self {
        let msg = match command {
            WorkerCommand::Registered {
                worker_id,
                heartbeat_interval,
            } => WorkerMsg::Registered(proto::WorkerRegistered {
                worker_id: worker_id.0,
                heartbeat_interval_ms: heartbeat_interval.as_millis() as u64,
            }),
            WorkerCommand::Assign {
                job_id,
                spec,
                manifest,
            } => WorkerMsg::Assign(proto::AssignJob {
                job_id: job_id.to_string(),
                spec: Some((&spec).into()),
                manifest: Some((&manifest).into()),
            }),
            WorkerCommand::Cancel { job_id } => WorkerMsg::Cancel(proto::CancelJob {
                job_id: job_id.to_string(),
            }),
        };
        proto::BrokerToWorker { msg: Some(msg) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_survives_the_wire() {
        let spec = JobSpec::new("/bin/sh")
            .args(["-c", "echo hi"])
            .env("PATH", "/bin")
            .mount(JobMount::Tmp {
                target: "/tmp".into(),
            })
            .mount(JobMount::Bind {
                source: "/data".into(),
                target: "/data".into(),
                read_only: true,
            })
            .timeout(Duration::from_secs(3));
        let wire = proto::JobSpec::from(&spec);
        assert_eq!(JobSpec::try_from(wire).unwrap(), spec);
    }

    #[test]
    fn empty_working_directory_defaults_to_root() {
        let wire = proto::JobSpec {
            program: "/bin/true".into(),
            ..Default::default()
        };
        assert_eq!(JobSpec::try_from(wire).unwrap().working_directory, "/");
    }

    #[test]
    fn mount_without_kind_is_invalid() {
        let wire = proto::JobSpec {
            program: "/bin/true".into(),
            mounts: vec![proto::JobMount { kind: None }],
            ..Default::default()
        };
        assert!(JobSpec::try_from(wire).is_err());
    }

    #[test]
    fn short_digest_in_manifest_is_invalid() {
        let manifest = proto::LayerManifest {
            layers: vec![vec![1, 2, 3]],
        };
        assert!(LayerManifest::try_from(manifest).is_err());
    }

    #[test]
    fn failure_results_keep_their_kind() {
        let result = ResultRecord::failed(FailureKind::ExecutionTimeout, "after 1s");
        let back = ResultRecord::try_from(proto::ResultRecord::from(&result)).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn result_without_outcome_is_rejected() {
        assert!(ResultRecord::try_from(proto::ResultRecord::default()).is_err());
    }

    #[test]
    fn job_state_mapping() {
        for state in [
            JobState::Queued,
            JobState::Scheduled,
            JobState::Executing,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            let raw = proto::JobState::from(state) as i32;
            assert_eq!(job_state_from_proto(raw), Some(state));
        }
        assert_eq!(job_state_from_proto(0), None);
    }
}
