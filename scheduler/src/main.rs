use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use db::dtos::{ExecutionKind, Job, JobSignal, Phase, Stage, UnitBackend};
use db::{JobStore, PgJobStore, MIGRATOR};
use scheduler::{
    driver, run_once, Config, CycleLease, EventSink, InProcessLease, LogEventSink, NatsEventSink,
    ReconcileSettings, Reconciler, RedisLease,
};
use sqlx::postgres::PgPoolOptions;
use tokio::signal::ctrl_c;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use uuid::Uuid;
use worker::{DockerRuntime, WorkerPool, WorkerRuntime};

#[derive(Parser)]
#[command(name = "scheduler")]
#[command(about = "Reconciles simulation jobs against the container runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile periodically until interrupted (default)
    Run,

    /// Run a single reconciliation cycle
    Once,

    /// Submit a new job
    Submit {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "main")]
        kind: ExecutionKind,

        /// Pause in Idle once this stage has finished
        #[arg(long)]
        idle_after: Option<Stage>,
    },

    /// Record a pending signal (abort, resume, stop) for a job
    Signal { job_id: Uuid, signal: JobSignal },

    /// Overwrite the stored phase of a job, e.g. `RunningSimulation`
    SetPhase { job_id: Uuid, phase: Phase },

    /// Apply database migrations
    Migrate,
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let filter_layer = EnvFilter::from_default_env();
    let fmt_layer = fmt::layer().with_target(false).with_line_number(true);

    let loki_layer = match &config.loki_url {
        Some(url) => {
            let (loki_layer, loki_task) = tracing_loki::builder()
                .label("service", "scheduler")?
                .extra_field("pid", format!("{}", process::id()))?
                .build_url(url.parse()?)?;
            tokio::spawn(loki_task);
            Some(loki_layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(loki_layer)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    let store = Arc::new(PgJobStore::new(pool.clone()));

    match cli.command.unwrap_or(Command::Run) {
        Command::Migrate => {
            MIGRATOR.run(&pool).await?;
            info!("Migrations applied");
        }
        Command::Submit {
            name,
            kind,
            idle_after,
        } => {
            let mut job = Job::new(name, kind, chrono::Utc::now());
            job.idle_after = idle_after;
            let job = store.insert_job(&job).await?;
            info!(job_id = %job.id, key = job.key, "Submitted job");
            println!("{}", job.id);
        }
        Command::Signal { job_id, signal } => {
            if !store.set_signal(job_id, Some(signal)).await? {
                anyhow::bail!("job {job_id} not found");
            }
            info!(%job_id, "Recorded {signal} signal");
        }
        Command::SetPhase { job_id, phase } => {
            if !store.set_phase(job_id, phase).await? {
                anyhow::bail!("job {job_id} not found");
            }
            warn!(%job_id, "Phase overwritten with {phase}");
        }
        Command::Once => reconcile(&config, store, true).await?,
        Command::Run => reconcile(&config, store, false).await?,
    }

    Ok(())
}

async fn reconcile(config: &Config, store: Arc<dyn JobStore>, once: bool) -> anyhow::Result<()> {
    let templates = config.load_templates()?;
    if templates.is_empty() {
        warn!("STAGE_TEMPLATES is not set, jobs will fail when they allocate a unit");
    }

    let docker = Arc::new(DockerRuntime::connect(config.runtime_label.clone())?);

    let events: Arc<dyn EventSink> = match &config.nats_url {
        Some(url) => Arc::new(NatsEventSink::new(async_nats::connect(url.as_str()).await?)),
        None => Arc::new(LogEventSink),
    };
    let lease: Box<dyn CycleLease> = match &config.redis_url {
        Some(url) => Box::new(RedisLease::connect(url).await?),
        None => Box::new(InProcessLease::new()),
    };

    // Runtime calls run on their own threads.
    let worker_runtime = WorkerRuntime::new(config.worker_threads)?;
    let workers = Arc::new(
        WorkerPool::new(worker_runtime.handle(), config.worker_concurrency)
            .with_client(UnitBackend::Container, docker.clone()),
    );

    let mut reconciler = Reconciler::new(
        store,
        docker,
        workers.clone(),
        events,
        templates,
        ReconcileSettings::from(config),
    );

    let result = if once {
        match run_once(&mut reconciler, lease.as_ref(), config.lease_ttl).await {
            Ok(Some(report)) => {
                info!(
                    transitions = report.transitions.len(),
                    orphans = report.orphans_removed.len(),
                    corrupted = report.corrupted.len(),
                    "Cycle done"
                );
                Ok(())
            }
            Ok(None) => {
                warn!("Another instance holds the reconciliation lease");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    } else {
        let shutdown = async {
            if let Err(error) = ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {error}");
                std::future::pending::<()>().await;
            }
        };
        driver::run(
            reconciler,
            lease.as_ref(),
            config.reconcile_interval,
            config.lease_ttl,
            shutdown,
        )
        .await;
        Ok(())
    };

    workers.close();
    drop(worker_runtime);

    result
}
