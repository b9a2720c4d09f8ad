use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use chunk_relay::clock::SystemClock;
use chunk_relay::config::RelayConfig;
use chunk_relay::job::{CheckpointShape, Job, JobSpec};
use chunk_relay::relay::Relay;
use chunk_relay::shutdown::install_shutdown_handler;
use chunk_relay::worker::SimulatedProcessor;

#[derive(Parser, Debug)]
#[command(name = "chunk-relay")]
#[command(version)]
#[command(about = "Chunked, resumable background jobs with stuck-job auto-resume")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a relay: API server, chunk worker and resume monitor
    Serve(ServeArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Show admission gate health
    Health {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Show resume monitor stats and per-job health
    Monitor {
        #[command(flatten)]
        client: ClientArgs,

        /// Run a sweep immediately instead of reporting
        #[arg(long)]
        sweep: bool,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Port to listen on for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Worker identity written into job leases
    #[arg(long, default_value = "local")]
    worker_id: String,

    /// Units processed per chunk
    #[arg(long, default_value = "50")]
    chunk_size: u64,

    /// Maximum concurrently running jobs
    #[arg(long, default_value = "3")]
    max_concurrent_jobs: usize,

    /// Seconds between resume monitor sweeps
    #[arg(long, default_value = "30")]
    poll_interval: u64,

    /// Seconds without activity before a running job counts as stuck
    #[arg(long, default_value = "300")]
    stuck_threshold: u64,

    /// Automatic resumes per job per day
    #[arg(long, default_value = "3")]
    max_resume_attempts: u32,

    /// File for the resume attempt ledger (kept in memory when omitted)
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// File for job records (kept in memory when omitted)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Simulated per-unit latency in milliseconds
    #[arg(long, default_value = "20")]
    sim_latency_ms: u64,

    /// Simulated probability of a unit failing
    #[arg(long, default_value = "0.0")]
    sim_failure_rate: f64,
}

// =============================================================================
// Client Arguments (shared by job, health and monitor commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Relay address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Start a new job
    Submit {
        /// Job kind (e.g. "annotate")
        kind: String,

        /// Number of units for an offset-checkpointed job
        #[arg(long, conflicts_with = "groups")]
        units: Option<u64>,

        /// Comma-separated group sizes for a nested-checkpointed job (e.g. "12,30,7")
        #[arg(long)]
        groups: Option<String>,
    },
    /// Show one job
    Status { job_id: String },
    /// List jobs
    List {
        /// Comma-separated statuses to include
        #[arg(long)]
        status: Option<String>,
    },
    /// Pause a job at its next unit boundary
    Pause { job_id: String },
    /// Resume a job from its checkpoint, resetting automatic attempts
    Resume { job_id: String },
    /// Request cooperative cancellation
    Cancel { job_id: String },
    /// Rewind a job to its first unit
    Restart { job_id: String },
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_groups(groups: &str) -> Result<Vec<u64>, Box<dyn std::error::Error>> {
    groups
        .split(',')
        .map(|g| g.trim())
        .filter(|g| !g.is_empty())
        .map(|g| {
            g.parse::<u64>()
                .map_err(|e| {
                    Box::<dyn std::error::Error>::from(format!("invalid group size {:?}: {}", g, e))
                })
        })
        .collect()
}

fn build_spec(
    kind: String,
    units: Option<u64>,
    groups: Option<String>,
) -> Result<JobSpec, Box<dyn std::error::Error>> {
    match (units, groups) {
        (_, Some(groups)) => Ok(JobSpec::new(kind)
            .with_shape(CheckpointShape::Nested)
            .with_params(json!({ "groups": parse_groups(&groups)? }))),
        (Some(units), None) => Ok(JobSpec::new(kind)
            .with_total(units)
            .with_params(json!({ "units": units }))),
        (None, None) => Err("either --units or --groups is required".into()),
    }
}

async fn send<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, Box<dyn std::error::Error>> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let message = body["error"].as_str().unwrap_or("request failed").to_string();
    Err(format!("{}: {}", status, message).into())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_progress(job: &Job) -> String {
    match (job.total_units, job.progress_percent()) {
        (Some(total), Some(pct)) => format!("{}/{} ({:.0}%)", job.processed_units, total, pct),
        _ => format!("{}/?", job.processed_units),
    }
}

fn print_job(job: &Job) {
    println!("Job ID:        {}", job.id);
    println!("Kind:          {}", job.kind);
    println!("Status:        {}", job.status);
    println!("Progress:      {}", format_progress(job));
    println!("Failed units:  {}", job.failed_units);
    println!("Checkpoint:    {}", job.checkpoint);
    if let Some(at) = job.last_activity_at {
        println!("Last activity: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if job.is_cancelling {
        println!("Cancelling:    yes");
    }
    if let Some(error) = &job.error_message {
        println!("Error:         {}", error);
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = RelayConfig::new(format!("0.0.0.0:{}", args.port).parse()?)
        .with_worker_id(args.worker_id)
        .with_chunk_size(args.chunk_size)
        .with_max_concurrent_jobs(args.max_concurrent_jobs);
    config.monitor.poll_interval_secs = args.poll_interval;
    config.monitor.stuck_threshold_secs = args.stuck_threshold;
    config.monitor.max_auto_resume_attempts = args.max_resume_attempts;
    if let Some(ledger) = args.ledger {
        config = config.with_ledger_path(ledger);
    }
    if let Some(store) = args.store {
        config = config.with_store_path(store);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        worker_id = %config.worker.worker_id,
        chunk_size = config.worker.chunk_size,
        max_concurrent_jobs = config.gate.max_concurrent_jobs,
        store = ?config.store_path,
        "Starting chunk-relay"
    );

    let processor = Arc::new(SimulatedProcessor::new(
        Duration::from_millis(args.sim_latency_ms),
        args.sim_failure_rate,
    ));
    let shutdown = install_shutdown_handler();
    let relay = Relay::open(config, processor, Arc::new(SystemClock), shutdown).await?;
    relay.run().await
}

// =============================================================================
// Client Implementation
// =============================================================================

async fn run_job_command(
    client: ClientArgs,
    command: JobCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let http = reqwest::Client::new();
    let base = client.addr.trim_end_matches('/');

    let action = |job_id: &str, verb: &str| {
        http.post(format!("{}/api/jobs/{}/{}", base, job_id, verb))
    };

    let job: Job = match command {
        JobCommands::Submit {
            kind,
            units,
            groups,
        } => {
            let spec = build_spec(kind, units, groups)?;
            send(http.post(format!("{}/api/jobs", base)).json(&spec)).await?
        }
        JobCommands::Status { job_id } => {
            send(http.get(format!("{}/api/jobs/{}", base, job_id))).await?
        }
        JobCommands::List { status } => {
            let mut request = http.get(format!("{}/api/jobs", base));
            if let Some(status) = status {
                request = request.query(&[("status", status)]);
            }
            let jobs: Vec<Job> = send(request).await?;
            return match client.output {
                OutputFormat::Json => print_json(&jobs),
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found");
                        return Ok(());
                    }
                    println!(
                        "{:<36}  {:<12}  {:<10}  {:<18}  CHECKPOINT",
                        "JOB ID", "KIND", "STATUS", "PROGRESS"
                    );
                    for job in &jobs {
                        println!(
                            "{:<36}  {:<12}  {:<10}  {:<18}  {}",
                            job.id,
                            job.kind,
                            job.status.to_string(),
                            format_progress(job),
                            job.checkpoint
                        );
                    }
                    Ok(())
                }
            };
        }
        JobCommands::Pause { job_id } => send(action(&job_id, "pause")).await?,
        JobCommands::Resume { job_id } => send(action(&job_id, "resume")).await?,
        JobCommands::Cancel { job_id } => send(action(&job_id, "cancel")).await?,
        JobCommands::Restart { job_id } => send(action(&job_id, "restart")).await?,
    };

    match client.output {
        OutputFormat::Json => print_json(&job),
        OutputFormat::Table => {
            print_job(&job);
            Ok(())
        }
    }
}

async fn run_health_command(client: ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let base = client.addr.trim_end_matches('/');
    let health: Value = send(reqwest::Client::new().get(format!("{}/api/health", base))).await?;

    match client.output {
        OutputFormat::Json => print_json(&health),
        OutputFormat::Table => {
            let gate = &health["gate"];
            println!("Dependency:       {}", gate["status"].as_str().unwrap_or("unknown"));
            println!(
                "Running jobs:     {}/{}",
                gate["active_jobs"], gate["max_concurrent_jobs"]
            );
            println!("Delay multiplier: {}", gate["delay_multiplier"]);
            if let Some(until) = gate["cooldown_until"].as_str() {
                println!("Cooldown until:   {}", until);
            }
            println!(
                "Admission:        {}",
                health["admission"]["decision"].as_str().unwrap_or("unknown")
            );
            Ok(())
        }
    }
}

async fn run_monitor_command(
    client: ClientArgs,
    sweep: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let http = reqwest::Client::new();
    let base = client.addr.trim_end_matches('/');

    if sweep {
        let report: Value = send(http.post(format!("{}/api/monitor/sweep", base))).await?;
        return print_json(&report);
    }

    let monitor: Value = send(http.get(format!("{}/api/monitor", base))).await?;
    match client.output {
        OutputFormat::Json => print_json(&monitor),
        OutputFormat::Table => {
            let stats = &monitor["stats"];
            println!(
                "Auto-resumes today: {} ({} ok, {} failed)",
                stats["attempts"], stats["successes"], stats["failures"]
            );
            println!();
            println!("{:<36}  {:<10}  {:<10}  ATTEMPTS", "JOB ID", "STATUS", "HEALTH");
            for entry in monitor["jobs"].as_array().into_iter().flatten() {
                let health = entry["health"].as_str().unwrap_or("unknown");
                println!(
                    "{:<36}  {:<10}  {:<10}  {}",
                    entry["job_id"].as_str().unwrap_or(""),
                    entry["status"].as_str().unwrap_or(""),
                    health,
                    entry["auto_resume_attempts"]
                );
                if health == "abandoned" {
                    println!("  -> automatic resumes exhausted, run `chunk-relay job resume <id>`");
                }
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_server(serve_args).await,
        Commands::Job { client, command } => run_job_command(client, command).await,
        Commands::Health { client } => run_health_command(client).await,
        Commands::Monitor { client, sweep } => run_monitor_command(client, sweep).await,
    }
}
