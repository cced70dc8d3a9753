use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::layer::LayerCache;
use crate::scheduler::{JobId, OutputStream, ResultRecord};
use crate::spec::{JobSpec, LayerManifest};

/// Something a running job wants reported to the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Started {
        job_id: JobId,
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
}

/// How the job's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    /// The executor killed the job because its cancellation token fired.
    Killed,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{stage}: {message}")]
    Setup {
        stage: &'static str,
        message: String,
    },

    #[error("internal execution error: {0}")]
    Internal(String),
}

impl ExecutionError {
    pub fn setup(stage: &'static str, message: impl Into<String>) -> Self {
        ExecutionError::Setup {
            stage,
            message: message.into(),
        }
    }
}

/// Everything an executor needs to run one job. The manifest's layers are pinned in
/// `layers` for the duration of the call.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub spec: JobSpec,
    pub manifest: LayerManifest,
    pub layers: Arc<LayerCache>,
}

/// Runs one job to completion.
///
/// Implementations must call [`OutputSink::started`] once the program is running,
/// stream its output through the sink, stop it promptly when `cancel` fires, and
/// release every per-job resource before returning.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        request: ExecutionRequest,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<Termination, ExecutionError>;
}

#[derive(Debug, Default)]
struct StreamBudget {
    captured: AtomicU64,
    truncated: AtomicU64,
}

/// Forwards a job's output to the worker session, bounded per stream.
#[derive(Debug, Clone)]
pub struct OutputSink {
    job_id: JobId,
    events: mpsc::UnboundedSender<WorkerEvent>,
    limit: u64,
    started: Arc<AtomicBool>,
    stdout: Arc<StreamBudget>,
    stderr: Arc<StreamBudget>,
}

impl OutputSink {
    pub fn new(job_id: JobId, events: mpsc::UnboundedSender<WorkerEvent>, limit: u64) -> Self {
        Self {
            job_id,
            events,
            limit,
            started: Arc::new(AtomicBool::new(false)),
            stdout: Arc::default(),
            stderr: Arc::default(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Report that the job is running. Only the first call has an effect.
    pub fn started(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(WorkerEvent::Started {
                job_id: self.job_id,
            });
        }
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn budget(&self, stream: OutputStream) -> &StreamBudget {
        match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        }
    }

    /// Forward `data`; whatever exceeds the stream's bound is only counted.
    pub fn write(&self, stream: OutputStream, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let budget = self.budget(stream);
        let len = data.len() as u64;
        let before = budget
            .captured
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |captured| {
                Some((captured + len).min(self.limit))
            })
            .unwrap_or(self.limit);
        let keep = self.limit.saturating_sub(before).min(len);
        if keep < len {
            budget.truncated.fetch_add(len - keep, Ordering::SeqCst);
        }
        if keep > 0 {
            let _ = self.events.send(WorkerEvent::Output {
                job_id: self.job_id,
                stream,
                data: data[..keep as usize].to_vec(),
            });
        }
    }

    /// Bytes dropped per stream, (stdout, stderr).
    pub fn truncated(&self) -> (u64, u64) {
        (
            self.stdout.truncated.load(Ordering::SeqCst),
            self.stderr.truncated.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(limit: u64) -> (OutputSink, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutputSink::new(JobId::new(), tx, limit), rx)
    }

    #[test]
    fn started_is_sent_once() {
        let (sink, mut rx) = sink(10);
        sink.started();
        sink.clone().started();
        assert!(matches!(rx.try_recv(), Ok(WorkerEvent::Started { .. })));
        assert!(rx.try_recv().is_err());
        assert!(sink.has_started());
    }

    #[test]
    fn output_beyond_the_bound_is_counted() {
        let (sink, mut rx) = sink(5);
        sink.write(OutputStream::Stdout, b"abc");
        sink.write(OutputStream::Stdout, b"defg");
        sink.write(OutputStream::Stdout, b"hij");
        sink.write(OutputStream::Stderr, b"xy");

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Ok(WorkerEvent::Output { stream, data, .. }) = rx.try_recv() {
            match stream {
                OutputStream::Stdout => stdout.extend(data),
                OutputStream::Stderr => stderr.extend(data),
            }
        }
        assert_eq!(stdout, b"abcde");
        assert_eq!(stderr, b"xy");
        assert_eq!(sink.truncated(), (5, 0));
    }
}
