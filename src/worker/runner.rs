use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::layer::LayerCache;
use crate::scheduler::{FailureKind, JobId, Outcome, ResultRecord};
use crate::spec::{JobSpec, LayerManifest};
use crate::worker::executor::{
    ExecutionError, ExecutionRequest, Executor, OutputSink, Termination, WorkerEvent,
};
use crate::worker::fetcher::LayerFetcher;
use crate::worker::slots::SlotPermit;

/// One accepted assignment.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub job_id: JobId,
    pub spec: JobSpec,
    pub manifest: LayerManifest,
}

/// Drives a job through materialization, execution and teardown, then reports it.
#[derive(Clone)]
pub struct JobRunner {
    executor: Arc<dyn Executor>,
    fetcher: Arc<LayerFetcher>,
    max_output_bytes: u64,
}

impl JobRunner {
    pub fn new(executor: Arc<dyn Executor>, fetcher: Arc<LayerFetcher>, max_output_bytes: u64) -> Self {
        Self {
            executor,
            fetcher,
            max_output_bytes,
        }
    }

    pub fn cache(&self) -> &Arc<LayerCache> {
        self.fetcher.cache()
    }

    /// Run `assignment` to completion. The slot is released and `Completed` sent only
    /// after the container is torn down and the layer pins are dropped.
    pub async fn run(
        &self,
        assignment: Assignment,
        permit: SlotPermit,
        events: mpsc::UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> ResultRecord {
        let job_id = assignment.job_id;
        let started = Instant::now();
        let sink = OutputSink::new(job_id, events.clone(), self.max_output_bytes);

        let outcome = self.execute(assignment, &sink, &cancel).await;

        let (stdout_truncated, stderr_truncated) = sink.truncated();
        let result = ResultRecord {
            outcome,
            duration: started.elapsed(),
            stdout_truncated,
            stderr_truncated,
        };
        drop(permit);

        tracing::info!(
            job_id = %job_id,
            outcome = ?result.outcome,
            duration_ms = result.duration.as_millis() as u64,
            "Job finished"
        );
        let _ = events.send(WorkerEvent::Completed {
            job_id,
            result: result.clone(),
        });
        result
    }

    async fn execute(
        &self,
        assignment: Assignment,
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Outcome {
        let job_id = assignment.job_id;

        let pins = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            pins = self.fetcher.materialize(&assignment.manifest) => pins,
        };
        let pins = match pins {
            Ok(pins) => pins,
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "Layer materialization failed");
                return failed(FailureKind::LayerFetch, err.to_string());
            }
        };

        let timeout = assignment.spec.limits.timeout();
        let request = ExecutionRequest {
            job_id,
            spec: assignment.spec,
            manifest: assignment.manifest,
            layers: Arc::clone(self.fetcher.cache()),
        };

        let stop = cancel.child_token();
        let execution = self.executor.execute(request, sink.clone(), stop.clone());
        tokio::pin!(execution);

        let mut timed_out = false;
        let result = match timeout {
            Some(limit) => tokio::select! {
                result = &mut execution => result,
                _ = tokio::time::sleep(limit) => {
                    timed_out = true;
                    stop.cancel();
                    execution.await
                }
            },
            None => execution.await,
        };
        drop(pins);

        match result {
            Ok(Termination::Exited(code)) => Outcome::Exited(code),
            Ok(Termination::Signaled(signal)) => Outcome::Signaled(signal),
            Ok(Termination::Killed) if timed_out => failed(
                FailureKind::ExecutionTimeout,
                format!("exceeded {}", format_duration(timeout.unwrap_or_default())),
            ),
            Ok(Termination::Killed) => Outcome::Cancelled,
            Err(ExecutionError::Setup { stage, message }) => {
                tracing::warn!(job_id = %job_id, stage, error = %message, "Container setup failed");
                failed(FailureKind::ContainerSetup, format!("{stage}: {message}"))
            }
            Err(ExecutionError::Internal(message)) => {
                tracing::error!(job_id = %job_id, error = %message, "Execution failed");
                failed(FailureKind::Internal, message)
            }
        }
    }
}

fn failed(kind: FailureKind, message: impl Into<String>) -> Outcome {
    Outcome::Failed(crate::scheduler::FailureReason::new(kind, message))
}

fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::digest::LayerDigest;
    use crate::scheduler::OutputStream;
    use crate::worker::fetcher::{FetchError, LayerSource};
    use crate::worker::slots::SlotPool;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NoLayers;

    #[async_trait]
    impl LayerSource for NoLayers {
        async fn fetch(&self, digest: LayerDigest) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::NotFound(digest))
        }
    }

    /// Prints, then either exits or waits to be killed.
    struct ScriptedExecutor {
        run_for: Option<Duration>,
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(
            &self,
            _request: ExecutionRequest,
            sink: OutputSink,
            cancel: CancellationToken,
        ) -> Result<Termination, ExecutionError> {
            sink.started();
            sink.write(OutputStream::Stdout, b"hello\n");
            match self.run_for {
                Some(d) => tokio::select! {
                    _ = tokio::time::sleep(d) => Ok(Termination::Exited(3)),
                    _ = cancel.cancelled() => Ok(Termination::Killed),
                },
                None => {
                    cancel.cancelled().await;
                    Ok(Termination::Killed)
                }
            }
        }
    }

    async fn runner(executor: ScriptedExecutor) -> (TempDir, JobRunner) {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path(), u64::MAX).await.unwrap();
        let fetcher = LayerFetcher::new(cache, Arc::new(NoLayers), FetchConfig::default());
        (dir, JobRunner::new(Arc::new(executor), fetcher, 1024))
    }

    fn assignment(spec: JobSpec, manifest: LayerManifest) -> Assignment {
        Assignment {
            job_id: JobId::new(),
            spec,
            manifest,
        }
    }

    #[tokio::test]
    async fn natural_exit_is_reported_after_output() {
        let (_dir, runner) = runner(ScriptedExecutor {
            run_for: Some(Duration::from_millis(10)),
        })
        .await;
        let slots = SlotPool::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = assignment(JobSpec::new("/bin/x"), LayerManifest::default());
        let job_id = job.job_id;

        let result = runner
            .run(job, slots.try_acquire().unwrap(), tx, CancellationToken::new())
            .await;
        assert_eq!(result.outcome, Outcome::Exited(3));
        assert_eq!(slots.available(), 1);

        let events: Vec<WorkerEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(events[0], WorkerEvent::Started { .. }));
        assert!(matches!(events[1], WorkerEvent::Output { .. }));
        assert!(matches!(&events[2], WorkerEvent::Completed { job_id: id, .. } if *id == job_id));
    }

    #[tokio::test]
    async fn timeout_fails_the_job() {
        let (_dir, runner) = runner(ScriptedExecutor { run_for: None }).await;
        let slots = SlotPool::new(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let job = assignment(
            JobSpec::new("/bin/sleep").timeout(Duration::from_millis(50)),
            LayerManifest::default(),
        );

        let started = Instant::now();
        let result = runner
            .run(job, slots.try_acquire().unwrap(), tx, CancellationToken::new())
            .await;
        match result.outcome {
            Outcome::Failed(reason) => assert_eq!(reason.kind, FailureKind::ExecutionTimeout),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_is_reported_as_cancelled() {
        let (_dir, runner) = runner(ScriptedExecutor { run_for: None }).await;
        let slots = SlotPool::new(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let job = assignment(JobSpec::new("/bin/sleep"), LayerManifest::default());

        let handle = {
            let runner = runner.clone();
            let cancel = cancel.clone();
            let permit = slots.try_acquire().unwrap();
            tokio::spawn(async move { runner.run(job, permit, tx, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert_eq!(result.outcome, Outcome::Cancelled);
        assert_eq!(slots.available(), 1);
    }

    #[tokio::test]
    async fn missing_layer_fails_with_layer_fetch() {
        let (_dir, runner) = runner(ScriptedExecutor { run_for: None }).await;
        let slots = SlotPool::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = assignment(
            JobSpec::new("/bin/true"),
            LayerManifest::new(vec![LayerDigest::from(1u64)]),
        );

        let result = runner
            .run(job, slots.try_acquire().unwrap(), tx, CancellationToken::new())
            .await;
        match result.outcome {
            Outcome::Failed(reason) => assert_eq!(reason.kind, FailureKind::LayerFetch),
            other => panic!("unexpected outcome {other:?}"),
        }
        // Never started.
        assert!(matches!(rx.try_recv(), Ok(WorkerEvent::Completed { .. })));
    }
}
