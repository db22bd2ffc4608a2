use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use edgewise_core::config::{AgentConfig, ConfigError};
use edgewise_core::driver::Driver;
use edgewise_core::model::{ReconciliationResult, TargetState};

use edgewise_agent::factory::DriverFactory;
use edgewise_agent::managers::{DriverContainerManager, LocalConfigManager};
use edgewise_agent::queue::OfflineQueue;
use edgewise_agent::reconciler::{ReconcileOutcome, StateReconciler};
use edgewise_agent::store::Store;

/// Queue of reconciliation outcomes awaiting upload by the cloud transport.
const RESULTS_QUEUE: &str = "reconciliation-results";

#[derive(Parser)]
#[command(name = "edgewise")]
#[command(about = "Keep edge workloads and device config in sync with the fleet target state", long_about = None)]
struct Cli {
    /// Path to the agent config file (otherwise discovered).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent: reconcile on the configured interval until ctrl-c.
    Run,
    /// Apply a target-state document once and exit.
    Apply { file: PathBuf },
    /// Print the current runtime state as JSON.
    Status,
    /// Probe for an available orchestrator and print it.
    Detect,
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    if let Some(path) = &cli.config {
        return AgentConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    match AgentConfig::discover(&std::env::current_dir()?) {
        Ok((path, config)) => {
            info!(path = %path.display(), "loaded configuration");
            Ok(config)
        }
        Err(ConfigError::NotFound { .. }) => {
            info!("no config file found, using defaults");
            Ok(AgentConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

async fn build_driver(
    config: &AgentConfig,
    initial_target: Option<TargetState>,
) -> anyhow::Result<Arc<dyn Driver>> {
    let mut factory = DriverFactory::new(config.clone());
    if let Some(target) = initial_target {
        factory = factory.with_initial_target(target);
    }
    let kind = match config.orchestrator {
        Some(kind) => kind,
        None => factory.detect_orchestrator().await,
    };
    let driver = factory.create(kind).await?;
    Ok(Arc::from(driver))
}

async fn open_store(config: &AgentConfig) -> anyhow::Result<Arc<Store>> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    Ok(Arc::new(
        Store::open(&config.data_dir.join("edgewise.db")).await?,
    ))
}

async fn build_reconciler(
    store: Arc<Store>,
    driver: Arc<dyn Driver>,
) -> anyhow::Result<StateReconciler> {
    let containers = Arc::new(DriverContainerManager::new(driver));
    let device_config = Arc::new(LocalConfigManager::new());
    let reconciler = StateReconciler::new(containers, device_config, store);
    reconciler.init().await?;
    Ok(reconciler)
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let persisted = store.load_target_state().await?;
    let driver = build_driver(&config, persisted).await?;
    let reconciler = build_reconciler(store.clone(), driver.clone()).await?;

    // Reconciliation outcomes queue up durably until the cloud transport
    // drains them; surviving restarts is the point.
    let results: OfflineQueue<ReconciliationResult> =
        OfflineQueue::open(store, RESULTS_QUEUE, config.queue_max_size).await?;
    if !results.is_empty().await {
        info!(pending = results.len().await, "queued results awaiting upload");
    }

    let mut interval = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match reconciler.reconcile().await {
                    Ok(ReconcileOutcome::Completed(result)) => {
                        if let Err(e) = results.enqueue(result).await {
                            warn!(error = %e, "failed to queue reconciliation result");
                        }
                    }
                    Ok(ReconcileOutcome::Skipped) => {}
                    Err(e) => warn!(error = %e, "reconcile pass failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let _ = driver.shutdown().await;
                break;
            }
        }
    }
    Ok(())
}

async fn apply(config: AgentConfig, file: PathBuf) -> anyhow::Result<()> {
    let content =
        std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
    let state: TargetState =
        serde_json::from_str(&content).context("parsing target-state document")?;

    let store = open_store(&config).await?;
    let persisted = store.load_target_state().await?;
    let driver = build_driver(&config, persisted).await?;
    let reconciler = build_reconciler(store, driver).await?;
    match reconciler.set_target(&state).await? {
        ReconcileOutcome::Completed(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        ReconcileOutcome::Skipped => {
            println!("reconcile already in progress, state queued");
        }
    }
    Ok(())
}

async fn status(config: AgentConfig) -> anyhow::Result<()> {
    let driver = build_driver(&config, None).await?;
    let current = driver.get_current_state().await?;
    println!("{}", serde_json::to_string_pretty(&current)?);
    Ok(())
}

async fn detect(config: AgentConfig) -> anyhow::Result<()> {
    let factory = DriverFactory::new(config);
    let kind = factory.detect_orchestrator().await;
    println!("{kind}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Apply { file } => apply(config, file).await,
        Commands::Status => status(config).await,
        Commands::Detect => detect(config).await,
    }
}
