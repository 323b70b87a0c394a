use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use labdock::driver::{DockerDriver, LocalStorage};
use labdock::{IdleReaper, LifecycleController, OrchestratorConfig};

#[derive(Parser)]
#[command(name = "labdock")]
#[command(about = "Lab environment orchestrator for course platforms", long_about = None)]
struct Cli {
    /// Directory for log files (console only when omitted)
    #[arg(long)]
    log_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator daemon with the idle reaper
    Serve {
        /// Hours a lab may sit idle before it is reclaimed
        #[arg(long)]
        max_idle_hours: Option<i64>,
    },

    /// Run a single idle cleanup pass and exit
    Cleanup {
        /// Hours a lab may sit idle before it is reclaimed
        #[arg(long)]
        max_idle_hours: Option<i64>,
    },

    /// Print every managed lab environment as JSON
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let _ = labdock::logging::init_logging(cli.log_dir.as_deref());

    let config = OrchestratorConfig::from_env();

    match cli.command {
        Commands::Serve { max_idle_hours } => {
            let max_idle_hours = max_idle_hours.unwrap_or(config.max_idle_hours);
            let controller = connect(&config).await?;

            let adopted = controller.adopt_managed_containers().await;
            info!(
                "labdock serving: {} lab(s) adopted, reaping idle labs past {}h",
                adopted, max_idle_hours
            );

            let reaper =
                IdleReaper::new(controller.clone(), config.reap_interval(), max_idle_hours);
            let handle = reaper.spawn();

            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            handle.shutdown().await;
        }
        Commands::Cleanup { max_idle_hours } => {
            let max_idle_hours = max_idle_hours.unwrap_or(config.max_idle_hours);
            let controller = connect(&config).await?;

            controller.adopt_managed_containers().await;
            let reclaimed = controller.cleanup_idle_labs(max_idle_hours).await;
            println!("reclaimed {} idle lab(s)", reclaimed);
        }
        Commands::List => {
            let controller = connect(&config).await?;
            controller.adopt_managed_containers().await;
            let labs = controller.registry().list_all();
            println!("{}", serde_json::to_string_pretty(&labs)?);
        }
    }

    Ok(())
}

async fn connect(config: &OrchestratorConfig) -> Result<Arc<LifecycleController>> {
    let driver = Arc::new(DockerDriver::connect(config).await?);
    let storage = Arc::new(LocalStorage::new(&config.storage_root));
    Ok(Arc::new(LifecycleController::new(
        config.clone(),
        driver,
        storage,
    )))
}
