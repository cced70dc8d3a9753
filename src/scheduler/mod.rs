//! Broker-side scheduling.
//!
//! [`Scheduler`] is a synchronous state machine over the job table ([`JobQueue`]) and
//! the worker pool ([`WorkerPool`]). The broker actor feeds it connection events and
//! routes the [`Effect`]s it returns.

pub mod assigner;
pub mod engine;
pub mod effects;
pub mod job;
pub mod queue;

pub use self::assigner::{WorkerDescriptor, WorkerPool};
pub use self::engine::{Counters, LayerAvailability, Scheduler, Statistics, WorkerSnapshot};
pub use self::effects::{ClientEvent, Effect, RejectReason, WorkerCommand};
pub use self::job::{
    ClientId, FailureKind, FailureReason, Job, JobId, JobState, Outcome, OutputStream,
    ResultRecord, WorkerId,
};
pub use self::queue::JobQueue;
