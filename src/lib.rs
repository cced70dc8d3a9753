pub mod broker;
pub mod client;
pub mod config;
pub mod container;
pub mod digest;
pub mod error;
pub mod grpc;
pub mod layer;
pub mod scheduler;
pub mod shutdown;
pub mod spec;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("stratum");
}
