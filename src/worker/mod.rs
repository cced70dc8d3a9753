//! Worker side of the cluster.
//!
//! A worker owns a fixed number of execution slots and one session with the broker.
//! For every assignment it:
//!
//! 1. reserves a slot ([`SlotPool::try_acquire`]), refusing the assignment if none is free,
//! 2. pins the job's layers in the local cache and fetches the missing ones
//!    ([`LayerFetcher`]),
//! 3. runs the job through an [`Executor`] (normally the container runtime), streaming
//!    its output,
//! 4. tears the job down, releases the slot and reports the result.
//!
//! # Components
//!
//! - [`Worker`]: session with the broker, reconnecting with backoff
//! - [`JobRunner`]: per-job pipeline, including the execution timeout
//! - [`HeartbeatSender`]: registration and heartbeat messages
//! - [`executor`]: the seam between the worker and whatever runs the program

pub mod executor;
pub mod fetcher;
pub mod heartbeat;
pub mod runner;
pub mod session;
pub mod slots;

pub use executor::{ExecutionError, ExecutionRequest, Executor, OutputSink, Termination, WorkerEvent};
pub use fetcher::{FetchError, GrpcLayerSource, LayerFetcher, LayerSource};
pub use heartbeat::HeartbeatSender;
pub use runner::{Assignment, JobRunner};
pub use session::Worker;
pub use slots::{SlotPermit, SlotPool};
