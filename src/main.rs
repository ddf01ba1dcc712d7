use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use chronos_lite::agent::Agent;
use chronos_lite::cluster::{ClusterClient, MemoryClusterClient, MemoryStore};
use chronos_lite::config::{AgentConfig, ClusterConfig, JobsFile, QueueConfig};
use chronos_lite::executor::ShellRunner;
use chronos_lite::shutdown::install_shutdown_handler;

const REAPER_PERIOD: Duration = Duration::from_millis(250);
const BASE_PORT: u16 = 7700;

#[derive(Parser, Debug)]
#[command(name = "chronos-lite")]
#[command(version)]
#[command(about = "A distributed cron-like job scheduler with leader election")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a fleet of agents sharing an in-process coordination store
    Run(RunArgs),

    /// Validate a jobs file and show upcoming runs
    Check(CheckArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum QueueKind {
    Heap,
    Calendar,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the jobs file (JSON)
    #[arg(long)]
    jobs: PathBuf,

    /// Number of agents to start
    #[arg(long, default_value = "3")]
    agents: u16,

    /// Structure backing the leader's schedule
    #[arg(long, value_enum, default_value = "heap")]
    queue: QueueKind,

    /// Calendar queue bucket width in seconds
    #[arg(long, default_value = "60")]
    bucket_width_secs: u64,

    /// Calendar queue bucket count
    #[arg(long, default_value = "64")]
    bucket_count: usize,

    /// Lease renewal interval; lease TTLs are derived from it
    #[arg(long)]
    heartbeat_secs: Option<u64>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// Path to the jobs file (JSON)
    #[arg(long)]
    jobs: PathBuf,

    /// Upcoming runs to show per job
    #[arg(long, default_value = "5")]
    count: usize,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct JobCheckOutput {
    name: String,
    command: String,
    cron: String,
    max_executions: i64,
    retries: u32,
    disabled: bool,
    upcoming: Vec<String>,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn cluster_config(heartbeat_secs: Option<u64>) -> ClusterConfig {
    match heartbeat_secs {
        Some(secs) => {
            let heartbeat = Duration::from_secs(secs);
            ClusterConfig::default().with_timings(heartbeat * 3 / 2, heartbeat * 3, heartbeat)
        }
        None => ClusterConfig::default(),
    }
}

async fn run_fleet(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(args.verbose);

    let jobs = JobsFile::load(&args.jobs)?.to_jobs()?;
    let cluster = cluster_config(args.heartbeat_secs);
    cluster.validate()?;
    let queue = match args.queue {
        QueueKind::Heap => QueueConfig::Heap,
        QueueKind::Calendar => QueueConfig::Calendar {
            bucket_width: Duration::from_secs(args.bucket_width_secs.max(1)),
            bucket_count: args.bucket_count.max(1),
        },
    };

    let store = MemoryStore::with_reaper(REAPER_PERIOD);

    let registrar = MemoryClusterClient::new(store.clone(), cluster.clone());
    registrar.connect().await?;
    for job in &jobs {
        registrar.register_job(job).await?;
    }
    registrar.disconnect().await?;
    tracing::info!(jobs = jobs.len(), path = %args.jobs.display(), "Jobs registered");

    let shutdown = install_shutdown_handler();
    let runner = Arc::new(ShellRunner::new());
    let mut fleet = JoinSet::new();

    for i in 0..args.agents.max(1) {
        let config = AgentConfig::new(
            format!("agent-{}", i + 1),
            format!("127.0.0.1:{}", BASE_PORT + i),
        )
        .with_cluster(cluster.clone())
        .with_queue(queue);
        let client = Arc::new(MemoryClusterClient::new(store.clone(), cluster.clone()));
        let agent = Agent::new(config, client, runner.clone()).with_shutdown_token(&shutdown);

        fleet.spawn(async move {
            let result = agent.run().await;
            (agent.id().to_string(), result)
        });
    }
    tracing::info!(agents = args.agents.max(1), "Fleet started");

    let mut failed = 0;
    while let Some(joined) = fleet.join_next().await {
        match joined {
            Ok((agent_id, Ok(()))) => tracing::info!(agent_id = %agent_id, "Agent exited"),
            Ok((agent_id, Err(e))) => {
                failed += 1;
                tracing::error!(agent_id = %agent_id, error = %e, "Agent failed");
            }
            Err(e) => {
                failed += 1;
                tracing::error!(error = %e, "Agent task panicked");
            }
        }
    }

    if failed > 0 {
        return Err(format!("{} agent(s) ended in recovery", failed).into());
    }
    Ok(())
}

fn check_jobs(args: CheckArgs) -> Result<(), Box<dyn std::error::Error>> {
    let file = JobsFile::load(&args.jobs)?;
    let now = Utc::now();

    let mut checked = Vec::with_capacity(file.jobs.len());
    for definition in &file.jobs {
        let job = definition.to_job()?;
        let upcoming = match &job.trigger {
            Some(trigger) => trigger
                .upcoming(now, args.count)
                .into_iter()
                .map(|at| at.to_rfc3339())
                .collect(),
            None => vec![job.next_run_at.to_rfc3339()],
        };
        checked.push(JobCheckOutput {
            name: job.id,
            command: job.command,
            cron: definition.cron.clone(),
            max_executions: definition.max_executions,
            retries: job.retries,
            disabled: job.disabled,
            upcoming,
        });
    }

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&checked)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<20} {:<20} {:<10} {:<8} {}",
                "NAME", "CRON", "RUNS", "RETRIES", "COMMAND"
            );
            println!("{}", "-".repeat(80));
            for job in &checked {
                let runs = if job.max_executions < 0 {
                    "forever".to_string()
                } else {
                    job.max_executions.to_string()
                };
                let name = if job.disabled {
                    format!("{} (disabled)", job.name)
                } else {
                    job.name.clone()
                };
                println!(
                    "{:<20} {:<20} {:<10} {:<8} {}",
                    name, job.cron, runs, job.retries, job.command
                );
                for at in &job.upcoming {
                    println!("    {}", at);
                }
            }
            println!("\n{} job(s) valid", checked.len());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => run_fleet(run_args).await?,
        Commands::Check(check_args) => check_jobs(check_args)?,
    }

    Ok(())
}
