use thiserror::Error;

use crate::layer::LayerStoreError;
use crate::scheduler::JobId;
use crate::spec::InvalidSpec;

#[derive(Error, Debug)]
pub enum StratumError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error(transparent)]
    InvalidSpec(#[from] InvalidSpec),

    #[error("Job rejected: {0}")]
    Rejected(String),

    #[error("No free slot on this worker")]
    SlotUnavailable,

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Layer store error: {0}")]
    LayerStore(#[from] LayerStoreError),

    #[error("Cannot create namespaces: {0}")]
    NamespacesUnavailable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Broker is unavailable")]
    BrokerUnavailable,

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StratumError>;
