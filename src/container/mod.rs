//! Rootless per-job containers.
//!
//! Each job gets a scratch directory holding a root filesystem unpacked from its
//! layers, and runs as PID 1 of new user, mount, PID, network, IPC and UTS namespaces
//! with the root pivoted into that directory. No external container runtime or
//! privileges are needed, only unprivileged user namespaces.

pub mod probe;
pub mod rootfs;
pub mod setup;

use std::os::unix::process::ExitStatusExt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::config::ContainerConfig;
use crate::scheduler::OutputStream;
use crate::worker::{ExecutionError, ExecutionRequest, Executor, OutputSink, Termination};

pub use probe::probe_namespaces;
pub use rootfs::JobDir;
pub use setup::{LaunchPlan, Stage};

const READ_CHUNK: usize = 64 * 1024;

/// Runs jobs in rootless containers.
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    config: ContainerConfig,
}

impl ContainerExecutor {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    async fn run_in(
        &self,
        dir: &JobDir,
        request: ExecutionRequest,
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Result<Termination, ExecutionError> {
        let job_id = request.job_id;

        tokio::select! {
            result = rootfs::assemble(dir.root(), &request.manifest, &request.layers, &request.spec) => result?,
            _ = cancel.cancelled() => return Ok(Termination::Killed),
        }

        let plan = LaunchPlan::new(&request.spec, dir.root(), &self.config.hostname)?;
        let mut child = setup::launch(plan).await?;
        sink.started();
        tracing::debug!(job_id = %job_id, pid = ?child.id(), "Container running");

        let stdout = pump(child.stdout.take(), OutputStream::Stdout, sink);
        let stderr = pump(child.stderr.take(), OutputStream::Stderr, sink);
        let wait = async {
            tokio::select! {
                status = child.wait() => (status, false),
                _ = cancel.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to kill container");
                    }
                    (child.wait().await, true)
                }
            }
        };
        let ((status, killed), (), ()) = tokio::join!(wait, stdout, stderr);
        let status = status.map_err(|e| ExecutionError::Internal(format!("waiting for job: {e}")))?;

        if killed {
            return Ok(Termination::Killed);
        }
        match (status.code(), status.signal()) {
            (Some(code), _) => Ok(Termination::Exited(code)),
            (None, Some(signal)) => Ok(Termination::Signaled(signal)),
            (None, None) => Err(ExecutionError::Internal(format!(
                "unrecognised exit status {status}"
            ))),
        }
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<Termination, ExecutionError> {
        let job_id = request.job_id;
        let dir = JobDir::create(&self.config.scratch_dir, job_id)
            .map_err(|e| ExecutionError::setup("scratch", e.to_string()))?;

        let result = self.run_in(&dir, request, &sink, &cancel).await;

        if let Err(e) = dir.remove().await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to remove job directory");
        }
        result
    }
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, stream: OutputStream, sink: &OutputSink) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.write(stream, &buf[..n]),
            Err(e) => {
                tracing::warn!(job_id = %sink.job_id(), ?stream, error = %e, "Reading job output failed");
                break;
            }
        }
    }
}
