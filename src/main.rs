use neo_lakehouse::config::{ApiConfig, PipelineConfig, TierPaths, DEFAULT_BASE_URL};
use neo_lakehouse::{DeltaTableStore, DuplicatePolicy, Orchestrator, RunStatus, StorageOptimizer};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "neo-lakehouse")]
#[command(about = "Incremental bronze/silver/gold lakehouse for NASA NeoWs close approaches")]
#[command(version)]
struct Args {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Settings {
    /// NeoWs base URL
    #[arg(long, env = "NEO_API_URL", default_value = DEFAULT_BASE_URL)]
    api_url: String,

    /// NeoWs API token (or set NEO_API_TOKEN)
    #[arg(long, env = "NEO_API_TOKEN", default_value = "", hide_env_values = true)]
    api_token: String,

    /// Max concurrent asteroid lookups (unbounded if unset)
    #[arg(long, env = "NEO_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    /// Bronze tier directory
    #[arg(long, env = "NEO_BRONZE_PATH", default_value = "lake/bronze")]
    bronze: PathBuf,

    /// Silver tier directory
    #[arg(long, env = "NEO_SILVER_PATH", default_value = "lake/silver")]
    silver: PathBuf,

    /// Gold tier directory
    #[arg(long, env = "NEO_GOLD_PATH", default_value = "lake/gold")]
    gold: PathBuf,

    /// Schema document
    #[arg(long, env = "NEO_SCHEMA_PATH", default_value = "metadata/schemas.json")]
    schemas: PathBuf,

    /// Extraction state document
    #[arg(long, env = "NEO_STATE_PATH", default_value = "metadata/stateful.json")]
    state: PathBuf,

    /// Days superseded files are kept before vacuum (0 = immediately)
    #[arg(long, env = "NEO_RETENTION_DAYS", default_value_t = 7)]
    retention_days: u32,

    /// Length of each extraction window in days
    #[arg(long, env = "NEO_WINDOW_DAYS", default_value_t = 7)]
    window_days: u32,

    /// Policy for batches repeating a natural key: keep-first or reject
    #[arg(long, env = "NEO_DUPLICATE_POLICY", default_value = "keep-first")]
    duplicates: DuplicatePolicy,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once for the next extraction window
    Run {
        /// Compact and vacuum every tier after a successful run
        #[arg(long)]
        optimize: bool,
    },
    /// Compact and vacuum every table of every tier
    Optimize,
}

impl Settings {
    fn into_config(self, optimize_after_run: bool) -> PipelineConfig {
        let api = ApiConfig {
            base_url: self.api_url,
            token: self.api_token,
            max_concurrency: self.max_concurrency,
        };
        let tiers = TierPaths {
            bronze: self.bronze,
            silver: self.silver,
            gold: self.gold,
        };

        let mut config = PipelineConfig::new(api, tiers);
        config.schema_path = self.schemas;
        config.state_path = self.state;
        config.retention_days = self.retention_days;
        config.window_days = self.window_days;
        config.duplicate_policy = self.duplicates;
        config.optimize_after_run = optimize_after_run;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run { optimize } => {
            let orchestrator = Orchestrator::from_config(args.settings.into_config(optimize))?;
            let report = orchestrator.run().await?;

            match report.status {
                RunStatus::Completed => info!(
                    "Run complete for [{}, {}), next window starts {}",
                    report.window.start, report.window.end, report.window.end
                ),
                RunStatus::Empty => warn!(
                    "No close approaches in [{}, {}), next window starts {}",
                    report.window.start, report.window.end, report.window.end
                ),
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Optimize => {
            let config = args.settings.into_config(false);
            let optimizer = StorageOptimizer::new(Arc::new(DeltaTableStore::new()));
            let reports = optimizer
                .optimize_tiers(&config.tiers.all(), config.retention_days)
                .await;

            let failed = reports.iter().filter(|r| !r.is_clean()).count();
            if failed > 0 {
                error!("{} of {} tables had maintenance errors", failed, reports.len());
            }
            info!("Optimized {} tables", reports.len());
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
    }

    Ok(())
}
