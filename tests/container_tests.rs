//! Jobs in real rootless containers.
//!
//! These need unprivileged user namespaces. Where the host does not allow them each
//! test logs why and returns early.

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use stratum::config::ContainerConfig;
use stratum::container::{probe_namespaces, ContainerExecutor};
use stratum::digest::LayerDigest;
use stratum::layer::LayerCache;
use stratum::scheduler::{JobId, OutputStream};
use stratum::spec::{JobMount, JobSpec, LayerManifest};
use stratum::worker::{ExecutionError, ExecutionRequest, Executor, OutputSink, Termination, WorkerEvent};

const HOST_DIRS: [&str; 5] = ["bin", "sbin", "lib", "lib64", "usr"];

struct Sandbox {
    executor: ContainerExecutor,
    cache: std::sync::Arc<LayerCache>,
    base: LayerDigest,
    mounts: Vec<JobMount>,
    _dir: TempDir,
}

struct Run {
    result: Result<Termination, ExecutionError>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Sandbox {
    /// A base layer that borrows the host's programs and libraries, or `None` when
    /// this host cannot run containers.
    async fn new() -> Option<Self> {
        if let Err(e) = probe_namespaces() {
            eprintln!("skipping container test: {e}");
            return None;
        }

        let dir = TempDir::new().expect("temp dir");
        let cache = LayerCache::open(dir.path().join("cache"), u64::MAX)
            .await
            .expect("cache");

        // Merged-usr hosts make bin, lib and friends symlinks into /usr; copy the
        // links into the layer and bind the real directories.
        let mut builder = tar::Builder::new(Vec::new());
        let mut mounts = Vec::new();
        for name in HOST_DIRS {
            let host = Path::new("/").join(name);
            match std::fs::symlink_metadata(&host) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    let target = std::fs::read_link(&host).expect("read link");
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    builder
                        .append_link(&mut header, name, target)
                        .expect("append link");
                }
                Ok(meta) if meta.is_dir() => mounts.push(JobMount::Bind {
                    source: host.to_string_lossy().into_owned(),
                    target: format!("/{name}"),
                    read_only: true,
                }),
                _ => {}
            }
        }
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o1777);
        builder
            .append_data(&mut header, "tmp", std::io::empty())
            .expect("append dir");
        let layer = builder.into_inner().expect("finish tar");

        let base = LayerDigest::compute(&layer);
        cache.insert(base, &layer).await.expect("insert layer");

        let executor = ContainerExecutor::new(ContainerConfig {
            scratch_dir: dir.path().join("scratch"),
            hostname: "job-host".into(),
        });
        let sandbox = Self {
            executor,
            cache,
            base,
            mounts,
            _dir: dir,
        };

        let smoke = sandbox.run(JobSpec::new("/bin/true")).await;
        if !matches!(smoke.result, Ok(Termination::Exited(0))) {
            eprintln!(
                "skipping container test: sanity run failed: {:?}",
                smoke.result
            );
            return None;
        }
        Some(sandbox)
    }

    fn spec(&self, spec: JobSpec) -> JobSpec {
        self.mounts.iter().cloned().fold(spec, JobSpec::mount)
    }

    async fn run(&self, spec: JobSpec) -> Run {
        self.run_with(spec, CancellationToken::new()).await
    }

    async fn run_with(&self, spec: JobSpec, cancel: CancellationToken) -> Run {
        let job_id = JobId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = OutputSink::new(job_id, tx, 1 << 20);
        let request = ExecutionRequest {
            job_id,
            spec: self.spec(spec),
            manifest: LayerManifest::new(vec![self.base]),
            layers: self.cache.clone(),
        };

        let result = self.executor.execute(request, sink, cancel).await;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::Output { stream, data, .. } = event {
                match stream {
                    OutputStream::Stdout => stdout.extend(data),
                    OutputStream::Stderr => stderr.extend(data),
                }
            }
        }
        Run {
            result,
            stdout,
            stderr,
        }
    }
}

#[tokio::test]
async fn test_echo_output_is_captured() {
    let Some(sandbox) = Sandbox::new().await else {
        return;
    };
    let run = sandbox
        .run(JobSpec::new("/bin/echo").args(["hello", "from", "a", "container"]))
        .await;
    assert!(matches!(run.result, Ok(Termination::Exited(0))), "{:?}", run.result);
    assert_eq!(run.stdout, b"hello from a container\n");
    assert!(run.stderr.is_empty());
}

#[tokio::test]
async fn test_exit_code_and_stderr() {
    let Some(sandbox) = Sandbox::new().await else {
        return;
    };
    let run = sandbox
        .run(JobSpec::new("/bin/sh").args(["-c", "echo oops >&2; exit 3"]))
        .await;
    assert!(matches!(run.result, Ok(Termination::Exited(3))), "{:?}", run.result);
    assert_eq!(run.stderr, b"oops\n");
}

#[tokio::test]
async fn test_job_runs_as_requested_user() {
    let Some(sandbox) = Sandbox::new().await else {
        return;
    };
    let mut spec = JobSpec::new("/bin/sh").args(["-c", "id -u; id -g"]);
    spec.user = 1000;
    spec.group = 1000;
    let run = sandbox.run(spec).await;
    assert!(matches!(run.result, Ok(Termination::Exited(0))), "{:?}", run.result);
    assert_eq!(run.stdout, b"1000\n1000\n");
}

#[tokio::test]
async fn test_hostname_and_environment() {
    let Some(sandbox) = Sandbox::new().await else {
        return;
    };
    let run = sandbox
        .run(JobSpec::new("/bin/sh").args(["-c", "uname -n; echo $GREETING"]).env("GREETING", "hi"))
        .await;
    assert!(matches!(run.result, Ok(Termination::Exited(0))), "{:?}", run.result);
    assert_eq!(run.stdout, b"job-host\nhi\n");
}

#[tokio::test]
async fn test_job_sees_only_its_own_processes() {
    let Some(sandbox) = Sandbox::new().await else {
        return;
    };
    let spec = JobSpec::new("/bin/sh")
        .args(["-c", "echo $$"])
        .mount(JobMount::Proc {
            target: "/proc".into(),
        });
    let run = sandbox.run(spec).await;
    assert!(matches!(run.result, Ok(Termination::Exited(0))), "{:?}", run.result);
    assert_eq!(run.stdout, b"1\n", "the job is PID 1 of its namespace");
}

#[tokio::test]
async fn test_cancel_kills_the_job() {
    let Some(sandbox) = Sandbox::new().await else {
        return;
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let run = sandbox
        .run_with(JobSpec::new("/bin/sleep").arg("30"), cancel)
        .await;
    assert!(matches!(run.result, Ok(Termination::Killed)), "{:?}", run.result);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_missing_executable_is_a_setup_failure() {
    let Some(sandbox) = Sandbox::new().await else {
        return;
    };
    let run = sandbox.run(JobSpec::new("/no/such/program")).await;
    match run.result {
        Err(ExecutionError::Setup { message, .. }) => {
            assert!(message.contains("ENOENT") || message.contains("No such file"), "{message}");
        }
        other => panic!("expected a setup failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_scratch_space_is_removed() {
    let Some(sandbox) = Sandbox::new().await else {
        return;
    };
    let run = sandbox
        .run(JobSpec::new("/bin/sh").args(["-c", "echo data > /tmp/file"]))
        .await;
    assert!(matches!(run.result, Ok(Termination::Exited(0))), "{:?}", run.result);

    let scratch = sandbox._dir.path().join("scratch");
    let leftovers = std::fs::read_dir(&scratch)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "job directories should be cleaned up");
}
