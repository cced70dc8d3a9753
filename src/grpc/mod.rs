pub mod broker_service;
pub mod convert;
pub mod server;

pub use broker_service::{BrokerGrpcService, LAYER_CHUNK_BYTES};
pub use server::GrpcServer;
