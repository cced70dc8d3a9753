use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::spec::{JobSpec, LayerManifest};

/// Broker-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Scheduled,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Scheduled|Executing -> Queued` is the requeue after a worker is lost.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Scheduled) => true,
            (Scheduled, Executing) => true,
            (Scheduled | Executing, Queued) => true,
            (Queued | Scheduled | Executing, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Scheduled => write!(f, "scheduled"),
            JobState::Executing => write!(f, "executing"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    LayerFetch,
    ContainerSetup,
    ExecutionTimeout,
    WorkerLost,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::LayerFetch => "layer fetch failed",
            FailureKind::ContainerSetup => "container setup failed",
            FailureKind::ExecutionTimeout => "execution timed out",
            FailureKind::WorkerLost => "worker lost",
            FailureKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Exited(i32),
    Signaled(i32),
    Failed(FailureReason),
    Cancelled,
}

impl Outcome {
    /// The terminal job state this outcome produces.
    pub fn terminal_state(&self) -> JobState {
        match self {
            Outcome::Exited(_) | Outcome::Signaled(_) => JobState::Completed,
            Outcome::Failed(_) => JobState::Failed,
            Outcome::Cancelled => JobState::Cancelled,
        }
    }
}

/// Final result of one job.
///
/// Output is streamed separately; the record carries only what was cut off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub outcome: Outcome,
    pub duration: Duration,
    pub stdout_truncated: u64,
    pub stderr_truncated: u64,
}

impl ResultRecord {
    pub fn new(outcome: Outcome, duration: Duration) -> Self {
        Self {
            outcome,
            duration,
            stdout_truncated: 0,
            stderr_truncated: 0,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::new(
            Outcome::Failed(FailureReason::new(kind, message)),
            Duration::ZERO,
        )
    }

    pub fn cancelled() -> Self {
        Self::new(Outcome::Cancelled, Duration::ZERO)
    }
}

/// Broker-side job record.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub client: ClientId,
    pub spec: JobSpec,
    pub manifest: LayerManifest,
    pub state: JobState,
    /// Submission sequence number; orders requeued jobs.
    pub seq: u64,
    pub assigned_worker: Option<WorkerId>,
    /// Number of times the job was requeued after losing its worker.
    pub attempts: u32,
    /// Number of times a younger job was scheduled ahead of this one.
    pub skips: u32,
    pub result: Option<ResultRecord>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        id: JobId,
        client: ClientId,
        seq: u64,
        spec: JobSpec,
        manifest: LayerManifest,
    ) -> Self {
        Self {
            id,
            client,
            spec,
            manifest,
            state: JobState::Queued,
            seq,
            assigned_worker: None,
            attempts: 0,
            skips: 0,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to `next`, refusing transitions the state machine forbids.
    pub fn transition(&mut self, next: JobState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(next) {
            return Err(IllegalTransition {
                job_id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record the terminal result. Fails if the job already finished.
    pub fn finish(&mut self, result: ResultRecord) -> Result<JobState, IllegalTransition> {
        let next = result.outcome.terminal_state();
        self.transition(next)?;
        self.assigned_worker = None;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition for job {job_id}: {from} -> {to}")]
pub struct IllegalTransition {
    pub job_id: JobId,
    pub from: JobState,
    pub to: JobState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            JobId::new(),
            ClientId(1),
            0,
            JobSpec::new("/bin/true"),
            LayerManifest::default(),
        )
    }

    #[test]
    fn happy_path_transitions() {
        let mut job = job();
        assert_eq!(job.state, JobState::Queued);
        job.transition(JobState::Scheduled).unwrap();
        job.transition(JobState::Executing).unwrap();
        let state = job
            .finish(ResultRecord::new(Outcome::Exited(0), Duration::from_millis(3)))
            .unwrap();
        assert_eq!(state, JobState::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn terminal_states_are_never_left() {
        let mut job = job();
        job.finish(ResultRecord::cancelled()).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.transition(JobState::Queued).is_err());
        assert!(job.finish(ResultRecord::cancelled()).is_err());
    }

    #[test]
    fn requeue_is_allowed_only_from_allocated_states() {
        assert!(JobState::Scheduled.can_transition_to(JobState::Queued));
        assert!(JobState::Executing.can_transition_to(JobState::Queued));
        assert!(!JobState::Queued.can_transition_to(JobState::Executing));
        assert!(!JobState::Completed.can_transition_to(JobState::Queued));
    }

    #[test]
    fn outcome_maps_to_terminal_state() {
        assert_eq!(Outcome::Exited(1).terminal_state(), JobState::Completed);
        assert_eq!(Outcome::Signaled(9).terminal_state(), JobState::Completed);
        assert_eq!(
            Outcome::Failed(FailureReason::new(FailureKind::WorkerLost, "")).terminal_state(),
            JobState::Failed
        );
        assert_eq!(Outcome::Cancelled.terminal_state(), JobState::Cancelled);
    }

    #[test]
    fn job_id_round_trips_through_string() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
