use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use stratum::broker::Broker;
use stratum::client::{exit_code, Client, JobEvent, JobHandle, Standalone, StandaloneConfig};
use stratum::config::{BrokerConfig, WorkerConfig};
use stratum::container::{probe_namespaces, ContainerExecutor};
use stratum::digest::LayerDigest;
use stratum::proto::JobState as ProtoJobState;
use stratum::scheduler::{JobId, Outcome, OutputStream, ResultRecord};
use stratum::shutdown::install_shutdown_handler;
use stratum::spec::{JobMount, JobSpec, LayerManifest};
use stratum::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "stratum")]
#[command(version)]
#[command(about = "A clustered, hermetic job-execution engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the broker
    Broker(BrokerArgs),

    /// Run a worker attached to a broker
    Worker(WorkerArgs),

    /// Submit jobs to a broker and print their output
    Run {
        /// Broker address
        #[arg(long, short = 'b', default_value = "http://127.0.0.1:9900")]
        broker: String,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Run jobs on an in-process broker and worker
    Standalone {
        /// Concurrent job slots
        #[arg(long, default_value = "1")]
        slots: usize,

        /// Directory for layers, cache and scratch space (default: a temporary directory)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Show workers, queue depth and counters
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Job queries and cancellation
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BrokerArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value = "9900")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Canonical layer store directory
    #[arg(long)]
    layer_dir: Option<PathBuf>,

    /// Interval workers heartbeat at
    #[arg(long, default_value = "1000")]
    heartbeat_interval_ms: u64,

    /// Silence after which a worker is declared lost
    #[arg(long, default_value = "5000")]
    heartbeat_timeout_ms: u64,

    /// How long a cancelled running job waits for its worker
    #[arg(long, default_value = "10000")]
    cancel_timeout_ms: u64,

    /// Worker-loss requeues a job survives
    #[arg(long, default_value = "3")]
    max_requeues: u32,

    /// Queued jobs considered for cache affinity
    #[arg(long, default_value = "16")]
    lookahead: usize,

    /// Times a job may be passed over before it goes first
    #[arg(long, default_value = "16")]
    max_skips: u32,

    /// Largest layer a client may upload, in bytes
    #[arg(long, default_value = "1073741824")]
    max_upload_bytes: usize,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Broker address
    #[arg(long, short = 'b', default_value = "http://127.0.0.1:9900")]
    broker: String,

    /// Concurrent job slots
    #[arg(long, default_value = "1")]
    slots: usize,

    /// Name reported to the broker (default: hostname)
    #[arg(long)]
    name: Option<String>,

    /// Local layer cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Cache size before least-recently-used layers are evicted
    #[arg(long, default_value = "4096")]
    cache_capacity_mb: u64,

    /// Parent directory of per-job root filesystems
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Attempts per layer fetch before the job fails
    #[arg(long, default_value = "5")]
    fetch_attempts: u32,

    /// Captured output per stream
    #[arg(long, default_value = "16")]
    max_output_mb: u64,
}

// =============================================================================
// Job Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct JobArgs {
    /// Layer tarball, uploaded if the broker lacks it (repeatable, bottom first)
    #[arg(long = "layer")]
    layers: Vec<PathBuf>,

    /// Layer the broker already holds, by SHA-256 hex digest (repeatable)
    #[arg(long = "layer-digest")]
    layer_digests: Vec<String>,

    /// File of JSON job descriptions: {"spec": {...}, "layers": ["file.tar" | digest]}
    #[arg(long, conflicts_with = "command")]
    spec: Option<PathBuf>,

    /// Kill the job after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Environment variable KEY=VALUE (repeatable)
    #[arg(long = "env", short = 'e')]
    env: Vec<String>,

    /// Working directory inside the container
    #[arg(long, default_value = "/")]
    workdir: String,

    /// User id inside the container
    #[arg(long, default_value = "0")]
    user: u32,

    /// Group id inside the container
    #[arg(long, default_value = "0")]
    group: u32,

    /// Mount a tmpfs at this path (repeatable)
    #[arg(long = "tmp")]
    tmp: Vec<String>,

    /// Mount procfs at this path (repeatable)
    #[arg(long = "proc")]
    proc_mounts: Vec<String>,

    /// Bind a host path, SOURCE:TARGET[:ro] (repeatable)
    #[arg(long = "bind")]
    binds: Vec<String>,

    /// Bring up the loopback interface
    #[arg(long)]
    loopback: bool,

    /// Mount the root filesystem read-only
    #[arg(long)]
    read_only_root: bool,

    /// Address-space limit in MiB
    #[arg(long)]
    memory_mb: Option<u64>,

    /// CPU time limit in seconds
    #[arg(long)]
    cpu_secs: Option<u64>,

    /// Program and arguments
    #[arg(last = true)]
    command: Vec<String>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Broker address
    #[arg(long, short = 'b', default_value = "http://127.0.0.1:9900")]
    broker: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List retained jobs
    List {
        /// Number of jobs per page (default: 100, max: 1000)
        #[arg(long, default_value = "100")]
        page_size: u32,

        /// Fetch all pages automatically
        #[arg(long)]
        all: bool,
    },
    /// Cancel a job
    Cancel {
        /// The job ID (UUID)
        job_id: String,
    },
}

// =============================================================================
// JSON Types
// =============================================================================

/// One entry of a `--spec` file.
#[derive(Deserialize, Debug)]
struct JobFile {
    spec: JobSpec,
    #[serde(default)]
    layers: Vec<String>,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    state: String,
    program: String,
    assigned_worker: u64,
    attempts: u32,
    result: Option<ResultRecord>,
    created_at_ms: i64,
    completed_at_ms: Option<i64>,
}

#[derive(Serialize)]
struct JobListItem {
    job_id: String,
    state: String,
    program: String,
    assigned_worker: u64,
    created_at_ms: i64,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobListItem>,
    total_count: u32,
    has_more: bool,
}

#[derive(Serialize)]
struct WorkerInfoOutput {
    worker_id: u64,
    name: String,
    slots: u32,
    free_slots: u32,
    cached_layers: u32,
}

#[derive(Serialize)]
struct ClusterStatusOutput {
    workers: Vec<WorkerInfoOutput>,
    pool_version: u64,
    num_clients: u32,
    queued_jobs: u32,
    running_jobs: u32,
    completed_jobs: u64,
    failed_jobs: u64,
    cancelled_jobs: u64,
    requeued_jobs: u64,
    consistency_violations: u64,
    layer_requests: u64,
    stored_layers: u64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(default: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn job_state_to_string(state: i32) -> String {
    match ProtoJobState::try_from(state) {
        Ok(ProtoJobState::Queued) => "QUEUED".to_string(),
        Ok(ProtoJobState::Scheduled) => "SCHEDULED".to_string(),
        Ok(ProtoJobState::Executing) => "EXECUTING".to_string(),
        Ok(ProtoJobState::Completed) => "COMPLETED".to_string(),
        Ok(ProtoJobState::Failed) => "FAILED".to_string(),
        Ok(ProtoJobState::Cancelled) => "CANCELLED".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

fn describe_outcome(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Exited(code) => format!("exited with {code}"),
        Outcome::Signaled(signal) => format!("killed by signal {signal}"),
        Outcome::Failed(reason) => format!("failed: {reason}"),
        Outcome::Cancelled => "cancelled".to_string(),
    }
}

fn parse_bind(raw: &str) -> Result<JobMount, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    match parts.as_slice() {
        [source, target] => Ok(JobMount::Bind {
            source: source.to_string(),
            target: target.to_string(),
            read_only: false,
        }),
        [source, target, "ro"] => Ok(JobMount::Bind {
            source: source.to_string(),
            target: target.to_string(),
            read_only: true,
        }),
        _ => Err(format!("invalid bind mount {raw:?}, expected SOURCE:TARGET[:ro]")),
    }
}

/// Build the job described by command-line flags.
fn spec_from_args(args: &JobArgs) -> Result<JobSpec, Box<dyn std::error::Error>> {
    let (program, arguments) = args
        .command
        .split_first()
        .ok_or("no program given; pass it after `--` or use --spec")?;

    let mut spec = JobSpec::new(program.clone()).args(arguments.iter().cloned());
    for pair in &args.env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid --env {pair:?}, expected KEY=VALUE"))?;
        spec = spec.env(key, value);
    }
    for target in &args.tmp {
        spec = spec.mount(JobMount::Tmp {
            target: target.clone(),
        });
    }
    for target in &args.proc_mounts {
        spec = spec.mount(JobMount::Proc {
            target: target.clone(),
        });
    }
    for bind in &args.binds {
        spec = spec.mount(parse_bind(bind)?);
    }
    if let Some(secs) = args.timeout_secs {
        spec = spec.timeout(Duration::from_secs(secs));
    }
    spec.working_directory = args.workdir.clone();
    spec.user = args.user;
    spec.group = args.group;
    spec.enable_loopback = args.loopback;
    spec.writable_root = !args.read_only_root;
    spec.limits.memory_bytes = args.memory_mb.map(|mb| mb << 20);
    spec.limits.cpu_seconds = args.cpu_secs;
    Ok(spec)
}

/// A layer given as a 64-character digest refers to the broker's store; anything
/// else is a tarball path, relative to `base`.
async fn resolve_layer(
    client: &Client,
    raw: &str,
    base: &Path,
) -> Result<LayerDigest, Box<dyn std::error::Error>> {
    if let Ok(digest) = raw.parse::<LayerDigest>() {
        return Ok(digest);
    }
    let path = base.join(raw);
    client
        .add_layer_file(&path)
        .await
        .map_err(|e| format!("layer {}: {e}", path.display()).into())
}

async fn jobs_from_args(
    client: &Client,
    args: &JobArgs,
) -> Result<Vec<(JobSpec, LayerManifest)>, Box<dyn std::error::Error>> {
    if let Some(path) = &args.spec {
        let text = tokio::fs::read_to_string(path).await?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut jobs = Vec::new();
        for entry in serde_json::Deserializer::from_str(&text).into_iter::<JobFile>() {
            let entry = entry?;
            let mut layers = Vec::with_capacity(entry.layers.len());
            for raw in &entry.layers {
                layers.push(resolve_layer(client, raw, base).await?);
            }
            jobs.push((entry.spec, LayerManifest::new(layers)));
        }
        return Ok(jobs);
    }

    let mut layers = Vec::new();
    for path in &args.layers {
        layers.push(client.add_layer_file(path).await?);
    }
    for raw in &args.layer_digests {
        layers.push(raw.parse::<LayerDigest>()?);
    }
    Ok(vec![(spec_from_args(args)?, LayerManifest::new(layers))])
}

/// Stream one job's output to our stdout/stderr as it arrives.
async fn follow(mut handle: JobHandle) -> Result<ResultRecord, Box<dyn std::error::Error>> {
    let job_id = handle.id();
    while let Some(event) = handle.next_event().await {
        match event {
            JobEvent::StateChanged(state) => {
                tracing::info!(job_id = %job_id, %state, "Job state changed");
            }
            JobEvent::Output { stream, data } => match stream {
                OutputStream::Stdout => {
                    let mut out = std::io::stdout().lock();
                    out.write_all(&data)?;
                    out.flush()?;
                }
                OutputStream::Stderr => {
                    let mut err = std::io::stderr().lock();
                    err.write_all(&data)?;
                    err.flush()?;
                }
            },
            JobEvent::Completed(result) => return Ok(result),
        }
    }
    Err(format!("lost the broker before job {job_id} finished").into())
}

/// Submit every job, print output, and return the exit code for this process.
async fn submit_and_report(
    client: &Client,
    args: &JobArgs,
) -> Result<i32, Box<dyn std::error::Error>> {
    let jobs = jobs_from_args(client, args).await?;

    if let [(spec, manifest)] = jobs.as_slice() {
        let handle = client.submit(spec.clone(), manifest.clone()).await?;
        let result = follow(handle).await?;
        if !matches!(result.outcome, Outcome::Exited(_)) {
            eprintln!("Job {}", describe_outcome(&result.outcome));
        }
        return Ok(exit_code(&result.outcome));
    }

    let mut handles = Vec::with_capacity(jobs.len());
    for (spec, manifest) in jobs {
        handles.push(client.submit(spec, manifest).await?);
    }
    let outcomes = futures::future::join_all(handles.into_iter().map(JobHandle::wait)).await;

    let mut exit_code = 0;
    for outcome in outcomes {
        let outcome = outcome?;
        eprintln!(
            "==> job {} {}",
            outcome.job_id,
            describe_outcome(&outcome.result.outcome)
        );
        std::io::stdout().write_all(&outcome.stdout)?;
        std::io::stderr().write_all(&outcome.stderr)?;
        if outcome.exit_code() != 0 {
            exit_code = 1;
        }
    }
    Ok(exit_code)
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_broker(args: BrokerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info");

    let listen_addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let mut config = BrokerConfig {
        listen_addr,
        ..BrokerConfig::default()
    }
    .with_heartbeat(
        Duration::from_millis(args.heartbeat_interval_ms),
        Duration::from_millis(args.heartbeat_timeout_ms),
    )
    .with_cancel_timeout(Duration::from_millis(args.cancel_timeout_ms))
    .with_max_requeues(args.max_requeues)
    .with_max_upload_bytes(args.max_upload_bytes);
    if let Some(dir) = args.layer_dir {
        config.layer_dir = dir;
    }
    config.scheduler.lookahead = args.lookahead;
    config.scheduler.max_skips = args.max_skips;

    tracing::info!(
        listen_addr = %config.listen_addr,
        layer_dir = %config.layer_dir.display(),
        max_requeues = config.scheduler.max_requeues,
        "Starting stratum broker"
    );

    let shutdown = install_shutdown_handler()?;
    let broker = Broker::new(config).await?;
    broker.run(shutdown).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info");

    if let Err(e) = probe_namespaces() {
        tracing::error!(error = %e, "This host cannot run rootless containers");
        return Err(e.into());
    }

    let mut config = WorkerConfig::new(args.broker, args.slots);
    if let Some(name) = args.name {
        config = config.with_name(name);
    }
    if let Some(dir) = args.cache_dir {
        config.cache_dir = dir;
    }
    if let Some(dir) = args.scratch_dir {
        config = config.with_scratch_dir(dir);
    }
    config.cache_capacity_bytes = args.cache_capacity_mb << 20;
    config.max_output_bytes = args.max_output_mb << 20;
    config.fetch.max_attempts = args.fetch_attempts.max(1);

    tracing::info!(
        broker = %config.broker_url,
        name = %config.name,
        slots = config.slots,
        cache_dir = %config.cache_dir.display(),
        "Starting stratum worker"
    );

    let shutdown = install_shutdown_handler()?;
    let executor = Arc::new(ContainerExecutor::new(config.container.clone()));
    let worker = Worker::new(config, executor).await?;
    worker.run(shutdown).await?;
    Ok(())
}

async fn run_standalone(
    slots: usize,
    data_dir: Option<PathBuf>,
    job: JobArgs,
) -> Result<i32, Box<dyn std::error::Error>> {
    init_logging("warn");

    // A directory we made up is ours to remove afterwards.
    let (data_dir, owned) = match data_dir {
        Some(dir) => (dir, false),
        None => (
            std::env::temp_dir().join(format!("stratum-standalone-{}", std::process::id())),
            true,
        ),
    };
    let standalone = Standalone::start(StandaloneConfig::new(slots, &data_dir)).await?;

    let shutdown = install_shutdown_handler()?;
    let code = tokio::select! {
        result = submit_and_report(standalone.client(), &job) => result,
        _ = shutdown.cancelled() => Ok(130),
    };
    standalone.shutdown().await?;
    if owned {
        if let Err(e) = tokio::fs::remove_dir_all(&data_dir).await {
            tracing::warn!(dir = %data_dir.display(), error = %e, "Failed to remove data directory");
        }
    }
    code
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_status(
    client: &Client,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_id: JobId = job_id.parse().map_err(|_| "Invalid job ID")?;
    let response = client.job_status(job_id).await?;
    let result = response
        .result
        .map(ResultRecord::try_from)
        .transpose()?;

    match output_format {
        OutputFormat::Json => {
            let output = JobStatusOutput {
                job_id: response.job_id,
                state: job_state_to_string(response.state),
                program: response.program,
                assigned_worker: response.assigned_worker,
                attempts: response.attempts,
                result,
                created_at_ms: response.created_at_ms,
                completed_at_ms: response.completed_at_ms,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:          {}", response.job_id);
            println!("State:           {}", job_state_to_string(response.state));
            println!("Program:         {}", response.program);
            if response.assigned_worker > 0 {
                println!("Assigned Worker: {}", response.assigned_worker);
            }
            if response.attempts > 0 {
                println!("Requeues:        {}", response.attempts);
            }
            if let Some(result) = result {
                println!("Result:          {}", describe_outcome(&result.outcome));
                println!("Duration:        {:?}", result.duration);
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &Client,
    page_size: u32,
    all: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut all_jobs: Vec<JobListItem> = Vec::new();
    let mut total_count;
    let mut has_more = false;

    let mut page_token = String::new();
    loop {
        let response = client.list_jobs(page_size, page_token.clone()).await?;
        total_count = response.total_count;

        for job in response.jobs {
            all_jobs.push(JobListItem {
                job_id: job.job_id,
                state: job_state_to_string(job.state),
                program: job.program,
                assigned_worker: job.assigned_worker,
                created_at_ms: job.created_at_ms,
            });
        }

        if response.next_page_token.is_empty() || !all {
            has_more = !response.next_page_token.is_empty();
            break;
        }
        page_token = response.next_page_token;
    }

    match output_format {
        OutputFormat::Json => {
            let output = JobListOutput {
                jobs: all_jobs,
                total_count,
                has_more,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if all_jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<38} {:<10} {:<8} PROGRAM", "JOB ID", "STATE", "WORKER");
                println!("{}", "-".repeat(78));

                for job in &all_jobs {
                    let worker = if job.assigned_worker > 0 {
                        job.assigned_worker.to_string()
                    } else {
                        "-".to_string()
                    };
                    println!(
                        "{:<38} {:<10} {:<8} {}",
                        job.job_id, job.state, worker, job.program
                    );
                }
                println!();
                println!("Showing {} of {} jobs", all_jobs.len(), total_count);
                if has_more {
                    println!("(Use --all to fetch all pages)");
                }
            }
        }
    }
    Ok(())
}

async fn handle_cluster_status(
    client: &Client,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.cluster_status().await?;

    match output_format {
        OutputFormat::Json => {
            let output = ClusterStatusOutput {
                workers: response
                    .workers
                    .into_iter()
                    .map(|w| WorkerInfoOutput {
                        worker_id: w.worker_id,
                        name: w.name,
                        slots: w.slots,
                        free_slots: w.free_slots,
                        cached_layers: w.cached_layers,
                    })
                    .collect(),
                pool_version: response.pool_version,
                num_clients: response.num_clients,
                queued_jobs: response.queued_jobs,
                running_jobs: response.running_jobs,
                completed_jobs: response.completed_jobs,
                failed_jobs: response.failed_jobs,
                cancelled_jobs: response.cancelled_jobs,
                requeued_jobs: response.requeued_jobs,
                consistency_violations: response.consistency_violations,
                layer_requests: response.layer_requests,
                stored_layers: response.stored_layers,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Cluster Status");
            println!("{}", "=".repeat(40));
            println!("Pool version:   {}", response.pool_version);
            println!("Clients:        {}", response.num_clients);
            println!("Queued:         {}", response.queued_jobs);
            println!("Running:        {}", response.running_jobs);
            println!(
                "Finished:       {} completed, {} failed, {} cancelled",
                response.completed_jobs, response.failed_jobs, response.cancelled_jobs
            );
            println!("Requeued:       {}", response.requeued_jobs);
            println!(
                "Layers:         {} stored, {} fetches served",
                response.stored_layers, response.layer_requests
            );
            if response.consistency_violations > 0 {
                println!("Violations:     {}", response.consistency_violations);
            }
            println!();
            println!("Workers:");
            println!("{:<6} {:<20} {:<12} CACHED", "ID", "NAME", "FREE/SLOTS");
            println!("{}", "-".repeat(50));
            for worker in response.workers {
                println!(
                    "{:<6} {:<20} {:<12} {}",
                    worker.worker_id,
                    worker.name,
                    format!("{}/{}", worker.free_slots, worker.slots),
                    worker.cached_layers
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Broker(broker_args) => {
            run_broker(broker_args).await?;
        }
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Run { broker, job } => {
            init_logging("warn");
            let client = Client::connect(broker).await?;
            let code = submit_and_report(&client, &job).await?;
            std::process::exit(code);
        }
        Commands::Standalone {
            slots,
            data_dir,
            job,
        } => {
            let code = run_standalone(slots, data_dir, job).await?;
            std::process::exit(code);
        }
        Commands::Status { client } => {
            let output = client.output.clone();
            let client = Client::connect(client.broker).await?;
            handle_cluster_status(&client, &output).await?;
        }
        Commands::Job { client, command } => {
            let output = client.output.clone();
            let client = Client::connect(client.broker).await?;

            match command {
                JobCommands::Status { job_id } => {
                    handle_job_status(&client, job_id, &output).await?;
                }
                JobCommands::List { page_size, all } => {
                    handle_job_list(&client, page_size, all, &output).await?;
                }
                JobCommands::Cancel { job_id } => {
                    let id: JobId = job_id.parse().map_err(|_| "Invalid job ID")?;
                    client.cancel(id)?;
                    // Give the session a moment to flush before we drop it.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    println!("Cancellation requested for job {}", id);
                }
            }
        }
    }

    Ok(())
}
