use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use dispatch_lite::config::ClusterConfig;
use dispatch_lite::shutdown::install_shutdown_handler;
use dispatch_lite::{Cluster, ClusterStatus, JobError, JobFuture, LocalWorker};

#[derive(Parser, Debug)]
#[command(name = "dispatch-lite")]
#[command(version)]
#[command(about = "A job distribution engine for a pool of worker nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a cluster of local workers against synthetic jobs
    Demo(DemoArgs),

    /// Print the effective cluster configuration
    Config(ConfigArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// JSON configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Parser, Debug)]
struct ConfigOverrides {
    /// Capacity of the queue for submitted jobs
    #[arg(long)]
    normal_capacity: Option<usize>,

    /// Capacity of the queue for requeued jobs
    #[arg(long)]
    priority_capacity: Option<usize>,

    /// Free queue slots a submission must leave for requeues
    #[arg(long)]
    guaranteed_capacity: Option<usize>,

    /// Scheduler poll interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,
}

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Number of local workers
    #[arg(long, default_value = "2")]
    workers: u64,

    /// Concurrent jobs per worker
    #[arg(long, default_value = "2")]
    threads: usize,

    /// Number of jobs to submit
    #[arg(long, default_value = "16")]
    jobs: u64,

    /// How long each job sleeps, in milliseconds
    #[arg(long, default_value = "200")]
    job_ms: u64,

    /// Close worker 1 while jobs are running to show rescheduling
    #[arg(long)]
    kill_worker: bool,

    /// Finish with shutdown_now instead of a graceful drain
    #[arg(long)]
    now: bool,

    /// Seconds to wait for the cluster to terminate
    #[arg(long, default_value = "30")]
    termination_timeout: u64,

    /// JSON configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,

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
// JSON Output Types
// =============================================================================

#[derive(Serialize, Default)]
struct JobTally {
    completed: u64,
    failed: u64,
    cancelled: u64,
    rejected: u64,
    checksum: u64,
}

#[derive(Serialize)]
struct DemoOutput {
    workers: u64,
    threads: usize,
    jobs_submitted: u64,
    jobs: JobTally,
    unexecuted: usize,
    interrupted: bool,
    terminated: bool,
    elapsed_ms: u128,
    status: ClusterStatus,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn load_config(
    path: Option<&PathBuf>,
    overrides: &ConfigOverrides,
) -> Result<ClusterConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => ClusterConfig::from_json_file(path)?,
        None => ClusterConfig::default(),
    };
    if let Some(n) = overrides.normal_capacity {
        config.normal_capacity = n;
    }
    if let Some(n) = overrides.priority_capacity {
        config.priority_capacity = n;
    }
    if let Some(n) = overrides.guaranteed_capacity {
        config.guaranteed_capacity = n;
    }
    if let Some(ms) = overrides.poll_ms {
        config.poll_interval_ms = ms;
    }
    config.validate()?;
    Ok(config)
}

async fn collect(futures: Vec<JobFuture<u64>>) -> JobTally {
    let mut tally = JobTally::default();
    for future in futures {
        match future.get().await {
            Ok(Some(value)) => {
                tally.completed += 1;
                tally.checksum = tally.checksum.wrapping_add(value);
            }
            Ok(None) => tally.rejected += 1,
            Err(JobError::Cancelled(_)) => tally.cancelled += 1,
            Err(e) => {
                tracing::warn!(error = %e, "Job failed");
                tally.failed += 1;
            }
        }
    }
    tally
}

fn print_table(output: &DemoOutput) {
    println!("Demo Summary");
    println!("{}", "=".repeat(40));
    println!("{:<18} {}", "State:", output.status.state);
    println!(
        "{:<18} {} x {} threads",
        "Workers:", output.workers, output.threads
    );
    println!("{:<18} {}", "Submitted:", output.jobs_submitted);
    println!("{:<18} {}", "Completed:", output.jobs.completed);
    println!("{:<18} {}", "Failed:", output.jobs.failed);
    println!("{:<18} {}", "Cancelled:", output.jobs.cancelled);
    println!("{:<18} {}", "Rejected:", output.jobs.rejected);
    println!("{:<18} {}", "Unexecuted:", output.unexecuted);
    println!("{:<18} {}", "Checksum:", output.jobs.checksum);
    println!("{:<18} {}", "Interrupted:", output.interrupted);
    println!("{:<18} {}ms", "Elapsed:", output.elapsed_ms);
}

// =============================================================================
// Commands
// =============================================================================

async fn run_demo(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_ref(), &args.overrides)?;
    let started = Instant::now();

    tracing::info!(
        workers = args.workers,
        threads = args.threads,
        jobs = args.jobs,
        job_ms = args.job_ms,
        poll_ms = config.poll_interval_ms,
        "Starting dispatch-lite demo"
    );

    let cluster = Cluster::new(config)?;
    let token = install_shutdown_handler();

    for id in 1..=args.workers {
        let worker = LocalWorker::new(id, format!("local-{id}"), args.threads.max(1));
        cluster.add_node(Arc::new(worker))?;
    }

    let job_ms = args.job_ms;
    let futures: Vec<JobFuture<u64>> = (0..args.jobs)
        .map(|n| {
            cluster.submit(move || {
                std::thread::sleep(Duration::from_millis(job_ms));
                n * n
            })
        })
        .collect();

    if args.kill_worker {
        let cluster = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(job_ms / 2 + 1)).await;
            if let Some(node) = cluster.node(1) {
                tracing::warn!(worker_id = node.id(), "Killing worker");
                node.close();
            }
        });
    }

    let waiter = collect(futures);
    tokio::pin!(waiter);

    let mut unexecuted = 0;
    let (jobs, interrupted) = tokio::select! {
        jobs = &mut waiter => (jobs, false),
        _ = token.cancelled() => {
            unexecuted = cluster.shutdown_now().len();
            (waiter.await, true)
        }
    };

    if !interrupted {
        if args.now {
            unexecuted = cluster.shutdown_now().len();
        } else {
            cluster.shutdown();
        }
    }

    let terminated = cluster
        .await_termination(Duration::from_secs(args.termination_timeout))
        .await;
    if !terminated {
        tracing::warn!("Cluster did not terminate in time");
    }

    let output = DemoOutput {
        workers: args.workers,
        threads: args.threads,
        jobs_submitted: args.jobs,
        jobs,
        unexecuted,
        interrupted,
        terminated,
        elapsed_ms: started.elapsed().as_millis(),
        status: cluster.status(),
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => print_table(&output),
    }
    Ok(())
}

fn show_config(args: ConfigArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_ref(), &args.overrides)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Demo(demo_args) => run_demo(demo_args).await?,
        Commands::Config(config_args) => show_config(config_args)?,
    }

    Ok(())
}
