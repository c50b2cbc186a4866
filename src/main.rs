use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use queuectl::config::ConfigStore;
use queuectl::dlq::DlqRepository;
use queuectl::job::{DeadJob, Job, JobId, JobSpec, JobState};
use queuectl::repo::JobRepository;
use queuectl::store::FileStore;
use queuectl::worker::WorkerPool;

#[derive(Parser)]
#[command(
    name = "queuectl",
    version,
    about = "A command-line job queue with workers, retries, and a dead letter queue"
)]
struct Cli {
    /// Data directory for the queue's state files
    /// (default: $QUEUECTL_DATA_DIR or ./.queuectl)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a new job, given as a JSON document
    Enqueue {
        /// Job spec, e.g. '{"id":"job1","command":"echo hello"}'
        job_json: String,
        /// Override max retries for this job
        #[arg(short, long)]
        retries: Option<u32>,
    },
    /// Manage worker loops
    #[command(subcommand)]
    Worker(WorkerCommand),
    /// Show queue and worker status summary
    Status,
    /// List jobs, optionally filtered by state
    List {
        /// pending, processing, completed, failed, or dead
        #[arg(short, long)]
        state: Option<String>,
    },
    /// Inspect or delete individual jobs
    #[command(subcommand)]
    Job(JobCommand),
    /// Manage the dead letter queue
    #[command(subcommand)]
    Dlq(DlqCommand),
    /// Manage configuration settings
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Start workers and process jobs until Ctrl-C
    Start {
        /// Number of workers to start (1-10)
        #[arg(short, long, default_value_t = 1)]
        count: usize,
    },
    /// Show the last persisted worker snapshot
    Status,
}

#[derive(Subcommand)]
enum JobCommand {
    /// Show a job's full record
    Get { id: String },
    /// Hard-delete a job record
    Delete { id: String },
}

#[derive(Subcommand)]
enum DlqCommand {
    /// List all dead jobs
    List,
    /// Retry a specific dead job
    Retry { id: String },
    /// Retry every dead job
    RetryAll,
    /// Permanently delete all dead jobs
    Purge,
    /// Show dead letter queue statistics
    Stats,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Show configuration value(s)
    Get { key: Option<String> },
    /// Set a configuration value (max-retries, backoff-base)
    Set { key: String, value: String },
    /// Restore the default configuration
    Reset,
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("QUEUECTL_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".queuectl"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "queuectl=info".into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let store = FileStore::open(&data_dir)?;
    let config = ConfigStore::new(store.clone());
    let repo = JobRepository::new(store.clone(), config.clone());
    let dlq = DlqRepository::new(store.clone(), repo.clone());

    match cli.command {
        Command::Enqueue { job_json, retries } => {
            let mut spec: JobSpec = serde_json::from_str(&job_json)
                .map_err(|err| format!("invalid job JSON: {err}"))?;
            if let Some(retries) = retries {
                spec.max_retries = Some(retries);
            }
            let job = repo.create(spec)?;
            println!("Job enqueued");
            println!("  ID:          {}", job.id);
            println!("  Command:     {}", job.command);
            println!("  State:       {}", job.state);
            println!("  Max retries: {}", job.max_retries);
            println!("  Priority:    {}", job.priority);
            println!("  Created:     {}", job.created_at);
        }
        Command::Worker(WorkerCommand::Start { count }) => {
            let pool = WorkerPool::new(store, repo, dlq);
            pool.start(count)?;
            println!("{count} worker(s) started, press Ctrl-C to stop");
            shutdown_signal().await?;
            println!("\nShutting down gracefully...");
            pool.stop().await?;
            println!("All workers stopped");
        }
        Command::Worker(WorkerCommand::Status) => {
            let registry = store.workers()?;
            if registry.count == 0 {
                println!("No workers are running");
            } else {
                println!(
                    "{} worker(s) last started at {} (snapshot; reflects the process that started them)",
                    registry.count,
                    registry
                        .started_at
                        .map(|at| at.to_string())
                        .unwrap_or_else(|| "unknown".to_owned()),
                );
                for worker in &registry.workers {
                    println!("  [{}] {} (pid {})", worker.index, worker.id, worker.pid);
                }
            }
        }
        Command::Status => {
            let stats = repo.queue_stats()?;
            println!("Queue:");
            println!("  total:      {}", stats.total);
            println!("  pending:    {}", stats.pending);
            println!("  processing: {}", stats.processing);
            println!("  completed:  {}", stats.completed);
            println!("  failed:     {}", stats.failed);
            println!("  dead:       {}", stats.dead);

            let dlq_stats = dlq.stats()?;
            println!("Dead letter queue: {} job(s)", dlq_stats.total);

            let registry = store.workers()?;
            if registry.count == 0 {
                println!("Workers: stopped");
            } else {
                println!("Workers: {} running (per last snapshot)", registry.count);
            }
        }
        Command::List { state } => {
            let jobs = match state {
                Some(state) => {
                    let state: JobState = state.parse()?;
                    repo.list_by_state(state)?
                }
                None => repo.list_all()?,
            };
            if jobs.is_empty() {
                println!("No jobs found");
            } else {
                for job in &jobs {
                    print_job_line(job);
                }
            }
        }
        Command::Job(JobCommand::Get { id }) => {
            let id: JobId = id.into();
            let job = repo
                .get(&id)?
                .ok_or_else(|| format!("job '{id}' not found"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            if job.state == JobState::Dead {
                if let Some(entry) = dlq.get_dead_job(&id)? {
                    println!("In dead letter queue since {}", entry.moved_to_dlq_at);
                    println!("Retry with: queuectl dlq retry {id}");
                }
            }
        }
        Command::Job(JobCommand::Delete { id }) => {
            let id: JobId = id.into();
            if repo.delete_job(&id)? {
                println!("Job '{id}' deleted");
            } else {
                return Err(format!("job '{id}' not found").into());
            }
        }
        Command::Dlq(DlqCommand::List) => {
            let dead = dlq.list_dead_jobs()?;
            if dead.is_empty() {
                println!("No jobs in dead letter queue");
            } else {
                println!("{} dead job(s):", dead.len());
                for entry in &dead {
                    print_dead_job(entry);
                }
            }
        }
        Command::Dlq(DlqCommand::Retry { id }) => {
            let id: JobId = id.into();
            if dlq.retry_dead_job(&id)? {
                println!("Job '{id}' moved back to pending with attempts reset");
            } else {
                return Err(format!("job '{id}' not found in dead letter queue").into());
            }
        }
        Command::Dlq(DlqCommand::RetryAll) => {
            let count = dlq.retry_all_dead_jobs()?;
            println!("{count} job(s) moved back to pending");
        }
        Command::Dlq(DlqCommand::Purge) => {
            let count = dlq.purge_all_dead_jobs()?;
            println!("{count} dead job(s) permanently deleted");
        }
        Command::Dlq(DlqCommand::Stats) => {
            let stats = dlq.stats()?;
            println!("Dead letter queue: {} job(s)", stats.total);
            for entry in &stats.recent {
                print_dead_job(entry);
            }
        }
        Command::Config(ConfigCommand::Get { key }) => match key {
            Some(key) => match config.get(&key)? {
                Some(value) => println!("{key} = {value}"),
                None => return Err(format!("config key '{key}' is not set").into()),
            },
            None => {
                for (key, value) in config.all()? {
                    println!("{key} = {value}");
                }
            }
        },
        Command::Config(ConfigCommand::Set { key, value }) => {
            config.set(&key, &value)?;
            println!("{key} = {value}");
        }
        Command::Config(ConfigCommand::Reset) => {
            config.reset()?;
            println!("Configuration reset to defaults");
        }
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM, so both Ctrl-C and a plain `kill` stop
/// the pool gracefully instead of abandoning in-flight claims.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn print_job_line(job: &Job) {
    println!(
        "{:<12} {:<10} attempts {}/{} priority {} :: {}",
        job.id.as_str(),
        job.state.as_str(),
        job.attempts,
        job.max_retries,
        job.priority,
        job.command,
    );
}

fn print_dead_job(entry: &DeadJob) {
    println!(
        "{:<12} attempts {}/{} moved {} :: {}",
        entry.id().as_str(),
        entry.job.attempts,
        entry.job.max_retries,
        entry.moved_to_dlq_at,
        entry.job.command,
    );
    if let Some(error) = &entry.job.error {
        println!("             last error: {error}");
    }
}
