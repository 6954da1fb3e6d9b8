use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use schedd_lite::config::{FlockConfig, HandlerConfig, SchedulerConfig, ThrottleConfig};
use schedd_lite::core::SchedulerCore;
use schedd_lite::grpc::{GrpcResourceOwner, GrpcServer};
use schedd_lite::job::{JobId, JobQueue};
use schedd_lite::policy::SimpleEvaluator;
use schedd_lite::proto::scheduler_service_client::SchedulerServiceClient;
use schedd_lite::proto::{
    GetStatusRequest, HoldJobRequest, JobIdMsg, ReassignSlotRequest, RemoveJobRequest,
    SubmitJobRequest,
};
use schedd_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "schedd-lite")]
#[command(version)]
#[command(about = "A claim-based batch job scheduler daemon")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler daemon
    Server(ServerArgs),

    /// Job queue commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Slot commands
    Slot {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: SlotCommands,
    },

    /// Show claim, handler and job counts
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value = "9618")]
    port: u16,

    /// Name advertised to resource owners
    #[arg(long, default_value = "schedd-lite")]
    name: String,

    /// Job-handler executable spawned for every dispatched job
    #[arg(long)]
    handler: Option<PathBuf>,

    /// Directory for per-job working directories
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// JSON file the job queue is persisted to
    #[arg(long)]
    queue_file: Option<PathBuf>,

    /// Maximum number of jobs in the queue
    #[arg(long, default_value = "100000")]
    max_jobs: usize,

    /// Maximum number of concurrently running job handlers
    #[arg(long, default_value = "10000")]
    max_jobs_running: usize,

    /// Handlers started per throttle window
    #[arg(long, default_value = "1")]
    job_start_count: usize,

    /// Throttle window in milliseconds
    #[arg(long, default_value = "0")]
    job_start_delay_ms: u64,

    /// Cap on in-flight claim requests (0 = unbounded)
    #[arg(long, default_value = "0")]
    max_pending_contacts: usize,

    /// Claim requests still unanswered after this long are canceled
    #[arg(long, default_value = "1800000")]
    request_claim_timeout_ms: u64,

    /// Exceptions tolerated on one claim before it is released
    #[arg(long, default_value = "5")]
    max_exceptions: u32,

    /// Remote pools to flock to, in order (comma-separated)
    #[arg(long, value_delimiter = ',')]
    flock_to: Vec<String>,

    /// Expression giving a requeued job's cooldown in seconds
    #[arg(long)]
    cooldown_expr: Option<String>,
}

// =============================================================================
// Client Arguments (shared by all client commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Daemon address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:9618")]
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

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job
    Submit {
        /// Job owner
        #[arg(long)]
        owner: String,

        /// Universe (vanilla, java, container, parallel)
        #[arg(long, default_value = "vanilla")]
        universe: String,

        #[arg(long, default_value = "0")]
        priority: i32,

        /// Job attributes as a JSON object
        #[arg(long, default_value = "{}")]
        ad: String,

        /// Pools the job may flock to (repeatable; default: any)
        #[arg(long = "pool")]
        pools: Vec<String>,
    },
    /// Put a job on hold
    Hold {
        /// Job id as <cluster>.<proc>
        job_id: JobId,

        #[arg(long, default_value = "held by user")]
        reason: String,
    },
    /// Remove a job from the queue
    Remove {
        /// Job id as <cluster>.<proc>
        job_id: JobId,

        /// Drop the job record immediately
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum SlotCommands {
    /// Vacate running jobs and give their slot to an idle job
    Reassign {
        #[arg(long)]
        beneficiary: JobId,

        /// Running job to vacate (repeatable)
        #[arg(long = "victim", required = true)]
        victims: Vec<JobId>,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
}

#[derive(Serialize)]
struct StatusOutput {
    claims_limbo: u32,
    claims_claimed: u32,
    claims_active: u32,
    handlers_queued: u32,
    handlers_running: u32,
    jobs_idle: u32,
    jobs_running: u32,
    jobs_held: u32,
    jobs_completed: u32,
    negotiation_sessions: u32,
    negotiation_round: u64,
    max_jobs_to_offer: u32,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    let mut handler = HandlerConfig::default();
    if let Some(program) = args.handler {
        handler.program = program;
    }
    if let Some(spool_dir) = args.spool_dir {
        handler.spool_dir = spool_dir;
    }

    let config = SchedulerConfig {
        max_jobs_running: args.max_jobs_running,
        max_pending_contacts: args.max_pending_contacts,
        request_claim_timeout_ms: args.request_claim_timeout_ms,
        max_exceptions: args.max_exceptions,
        cooldown_expr: args.cooldown_expr,
        throttle: ThrottleConfig {
            job_start_count: args.job_start_count.max(1),
            job_start_delay_ms: args.job_start_delay_ms,
            ..ThrottleConfig::default()
        },
        flock: FlockConfig {
            pools: args.flock_to,
            ..FlockConfig::default()
        },
        handler,
        ..SchedulerConfig::new(args.name, listen_addr)
    };

    tracing::info!(
        name = %config.name,
        listen_addr = %config.listen_addr,
        handler = %config.handler.program.display(),
        max_jobs_running = config.max_jobs_running,
        flock_pools = ?config.flock.pools,
        "Starting schedd-lite"
    );

    let store = match args.queue_file {
        Some(path) => JobQueue::open(path, args.max_jobs)?,
        None => JobQueue::with_capacity(args.max_jobs),
    };

    let signal = install_shutdown_handler()?;
    let owner = GrpcResourceOwner::new(config.request_claim_timeout());
    let (core, handle) = SchedulerCore::new(
        config,
        Box::new(store),
        Arc::new(SimpleEvaluator),
        Arc::new(owner),
    );
    let mut core = core.with_shutdown(signal);
    core.recover();

    let stop = CancellationToken::new();
    let server = tokio::spawn(GrpcServer::new(listen_addr, handle).run(stop.clone()));

    core.run().await;
    stop.cancel();
    server.await??;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn job_id_msg(id: JobId) -> JobIdMsg {
    JobIdMsg {
        cluster: id.cluster,
        proc: id.proc,
    }
}

async fn handle_job_command(
    client: &mut SchedulerServiceClient<Channel>,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            owner,
            universe,
            priority,
            ad,
            pools,
        } => {
            let response = client
                .submit_job(SubmitJobRequest {
                    owner,
                    universe,
                    priority,
                    ad_json: ad,
                    allowed_pools: pools,
                })
                .await?
                .into_inner();
            let job_id = response
                .job
                .map(|id| JobId::new(id.cluster, id.proc).to_string())
                .unwrap_or_default();
            match output_format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&JobSubmitOutput { job_id })?);
                }
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", job_id);
                }
            }
        }
        JobCommands::Hold { job_id, reason } => {
            client
                .hold_job(HoldJobRequest {
                    job: Some(job_id_msg(job_id)),
                    reason,
                })
                .await?;
            println!("Job {} held", job_id);
        }
        JobCommands::Remove { job_id, force } => {
            client
                .remove_job(RemoveJobRequest {
                    job: Some(job_id_msg(job_id)),
                    force,
                })
                .await?;
            if force {
                println!("Job {} removed and purged", job_id);
            } else {
                println!("Job {} removed", job_id);
            }
        }
    }
    Ok(())
}

async fn handle_slot_command(
    client: &mut SchedulerServiceClient<Channel>,
    command: SlotCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        SlotCommands::Reassign {
            beneficiary,
            victims,
        } => {
            client
                .reassign_slot(ReassignSlotRequest {
                    beneficiary: Some(job_id_msg(beneficiary)),
                    victims: victims.iter().copied().map(job_id_msg).collect(),
                })
                .await?;
            println!(
                "Vacating {} job(s) for {}",
                victims.len(),
                beneficiary
            );
        }
    }
    Ok(())
}

async fn handle_status(
    client: &mut SchedulerServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let r = client
        .get_status(GetStatusRequest {})
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = StatusOutput {
                claims_limbo: r.claims_limbo,
                claims_claimed: r.claims_claimed,
                claims_active: r.claims_active,
                handlers_queued: r.handlers_queued,
                handlers_running: r.handlers_running,
                jobs_idle: r.jobs_idle,
                jobs_running: r.jobs_running,
                jobs_held: r.jobs_held,
                jobs_completed: r.jobs_completed,
                negotiation_sessions: r.negotiation_sessions,
                negotiation_round: r.negotiation_round,
                max_jobs_to_offer: r.max_jobs_to_offer,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Scheduler Status");
            println!("{}", "=".repeat(40));
            println!(
                "Claims:    {} limbo, {} claimed, {} active",
                r.claims_limbo, r.claims_claimed, r.claims_active
            );
            println!(
                "Handlers:  {} queued, {} running",
                r.handlers_queued, r.handlers_running
            );
            println!(
                "Jobs:      {} idle, {} running, {} held, {} completed",
                r.jobs_idle, r.jobs_running, r.jobs_held, r.jobs_completed
            );
            println!(
                "Negotiation: round {}, {} open session(s), offering up to {} job(s)",
                r.negotiation_round, r.negotiation_sessions, r.max_jobs_to_offer
            );
        }
    }
    Ok(())
}

async fn connect(args: &ClientArgs) -> Result<SchedulerServiceClient<Channel>, Box<dyn std::error::Error>> {
    let channel = Channel::from_shared(args.addr.clone())?.connect().await?;
    Ok(SchedulerServiceClient::new(channel))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Job { client, command } => {
            let mut grpc = connect(&client).await?;
            handle_job_command(&mut grpc, command, &client.output).await
        }
        Commands::Slot { client, command } => {
            let mut grpc = connect(&client).await?;
            handle_slot_command(&mut grpc, command).await
        }
        Commands::Status { client } => {
            let mut grpc = connect(&client).await?;
            handle_status(&mut grpc, &client.output).await
        }
    }
}
