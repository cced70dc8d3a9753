use std::time::Duration;

use crate::digest::LayerDigest;
use crate::scheduler::job::{ClientId, JobId, JobState, OutputStream, ResultRecord, WorkerId};
use crate::spec::{JobSpec, LayerManifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidSpec,
    QueueFull,
}

/// Message the scheduler wants delivered on a client session.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Accepted {
        request_id: u64,
        job_id: JobId,
    },
    Rejected {
        request_id: u64,
        reason: RejectReason,
        message: String,
    },
    StateChanged {
        job_id: JobId,
        state: JobState,
    },
    Output {
        job_id: JobId,
        stream: OutputStream,
        data: Vec<u8>,
    },
    Completed {
        job_id: JobId,
        result: ResultRecord,
    },
    LayerRequest {
        digest: LayerDigest,
    },
}

/// Message the scheduler wants delivered on a worker session.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    Registered {
        worker_id: WorkerId,
        heartbeat_interval: Duration,
    },
    Assign {
        job_id: JobId,
        spec: JobSpec,
        manifest: LayerManifest,
    },
    Cancel {
        job_id: JobId,
    },
}

/// Output of a scheduler step. The broker actor routes these to connection tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Client(ClientId, ClientEvent),
    Worker(WorkerId, WorkerCommand),
    /// Close the worker's session; it was declared lost.
    DisconnectWorker(WorkerId),
}

impl Effect {
    pub fn client(&self) -> Option<ClientId> {
        match self {
            Effect::Client(id, _) => Some(*id),
            _ => None,
        }
    }

    pub fn worker(&self) -> Option<WorkerId> {
        match self {
            Effect::Worker(id, _) | Effect::DisconnectWorker(id) => Some(*id),
            _ => None,
        }
    }
}
