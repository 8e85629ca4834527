use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "evtrack-cli")]
#[command(about = "Incremental event ingestion into Postgres with Slack reporting")]
struct Cli {
    /// Log output format; falls back to LOG_FORMAT.
    #[arg(long, value_enum, env = "LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ingestion pipeline once (default).
    Sync,
    /// Apply the embedded SQL migrations.
    Migrate,
    /// Run the pipeline on EVTRACK_SYNC_CRON until interrupted.
    Schedule,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real deployments set the environment directly.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = evtrack_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} fetched={} processed={} skipped={} errors={} cursor={}",
                summary.run_id,
                summary.fetched,
                summary.processed,
                summary.skipped,
                summary.errored,
                summary.cursor.as_deref().unwrap_or("unchanged")
            );
        }
        Commands::Migrate => {
            evtrack_sync::migrate_from_env().await?;
            tracing::info!("migrations applied");
        }
        Commands::Schedule => {
            evtrack_sync::run_scheduler_from_env().await?;
        }
    }

    Ok(())
}
