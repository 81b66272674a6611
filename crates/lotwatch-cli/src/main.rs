use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lotwatch_core::RunOutcome;
use lotwatch_storage::PgItemStore;
use lotwatch_sync::{Pipeline, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "lotwatch", version)]
#[command(about = "Auction listing ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging for lotwatch crates
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text", env = "LOTWATCH_LOG_FORMAT")]
    log_format: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// Enable every configured source regardless of LOTWATCH_AUTOSTART
        #[arg(long)]
        enable_all: bool,
    },
    /// Run one source once and print its run record
    Sync {
        source_id: String,
    },
    /// List registered jobs
    Jobs,
    /// Show persisted run history for a job
    History {
        job_id: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(&cli.log_format, cli.verbose)?;
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Run { enable_all } => run(config, enable_all).await?,
        Commands::Sync { source_id } => {
            let pipeline = Pipeline::bootstrap(config).await?;
            let record = pipeline.run_source_once(&source_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            if record.outcome == RunOutcome::Failed {
                bail!("sync of `{source_id}` failed");
            }
        }
        Commands::Jobs => {
            let pipeline = Pipeline::bootstrap(config).await?;
            let jobs = pipeline.scheduler().available_jobs();
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        Commands::History { job_id, limit } => {
            let pipeline = Pipeline::bootstrap(config).await?;
            let runs = pipeline.store().recent_runs(&job_id, limit).await?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to migrate")?;
            let store = PgItemStore::connect(url, 1).await?;
            store.migrate().await?;
            tracing::info!("migrations applied");
        }
    }

    Ok(())
}

async fn run(config: SyncConfig, enable_all: bool) -> Result<()> {
    let auto_start = config.auto_start;
    let pipeline = Pipeline::bootstrap(config).await?;
    if enable_all && !auto_start {
        pipeline.enable_configured()?;
    }
    let scheduler = pipeline.scheduler();
    scheduler.start().await?;

    let status = scheduler.status();
    tracing::info!(
        active_jobs = status.active_jobs,
        registered_jobs = status.registered_jobs,
        "lotwatch running; press ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    scheduler.shutdown().await?;
    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let default_filter = if verbose { "lotwatch=debug,info" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        "text" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
        other => bail!("unknown log format `{other}` (expected text or json)"),
    }

    Ok(())
}
