//! # streamkeep
//!
//! Long-running recorder daemon. Loads configuration, restores the tracked
//! entity registry, and runs one availability poller per entity alongside
//! the compression pool, the half-hourly merge scheduler and the disk
//! watchdog. The process exits with status 1 as soon as free space on the
//! download volume drops below the configured threshold.

use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use streamkeep_config::{ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use streamkeep_core::registry::{EntityRegistry, RegistryStore};
use streamkeep_core::{InstanceLock, RecorderConfig, RecorderRuntime, RuntimeDeps};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "streamkeep")]
#[command(about = "Records tracked live streams and archives them as merged files")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ConfigArgs {
    /// Path to a streamkeep.toml file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the recorder until interrupted (default)
    Run,
    /// Delete merged output, thumbnails and stale leftovers, then exit
    Sweep,
    /// Edit the tracked entity registry (refused while the daemon runs)
    #[command(subcommand)]
    Streamers(StreamersCommand),
}

#[derive(Debug, Subcommand)]
enum StreamersCommand {
    /// Print every tracked entity
    List,
    /// Start tracking an entity
    Add { id: String },
    /// Stop tracking an entity
    Remove { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli.config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_recorder(config).await,
        Command::Sweep => run_sweep(config).await,
        Command::Streamers(command) => run_streamers(config, command).await,
    }
}

fn load_runtime_config(args: &ConfigArgs) -> anyhow::Result<RecorderConfig> {
    let ConfigLoad {
        config,
        warnings,
        source,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reqwest=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(path) = source.as_ref() {
        info!(path = %path.display(), "configuration file loaded");
    }

    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => {
                warn!(message = %warning.message, "configuration warning")
            }
        }
    }

    info!(
        download_dir = %config.storage.download_dir.display(),
        registry = %config.storage.registry_path.display(),
        merge.min_age_secs = config.merge.min_age_secs,
        watchdog.min_free_bytes = config.watchdog.min_free_bytes,
        start_active = config.start_active,
        "configuration resolved"
    );

    Ok(config)
}

async fn run_recorder(config: RecorderConfig) -> anyhow::Result<()> {
    let deps = RuntimeDeps::production(&config)
        .context("failed to build runtime dependencies")?;
    let runtime = RecorderRuntime::new(config, deps);
    runtime.start().await.context("failed to start recorder")?;

    let watchdog = runtime.watchdog();
    let token = runtime.shutdown_token();

    tokio::select! {
        result = watchdog.run(token.clone()) => {
            if let Err(err) = result {
                error!(error = %err, "stopping: free disk space exhausted");
                std::process::exit(1);
            }
        }
        signal = shutdown_signal() => {
            signal.context("failed to listen for shutdown signals")?;
            info!("shutdown signal received");
        }
    }

    runtime
        .shutdown()
        .await
        .context("graceful shutdown failed")?;
    info!("recorder stopped");
    Ok(())
}

async fn run_sweep(config: RecorderConfig) -> anyhow::Result<()> {
    let _instance = acquire_offline_lock(&config)?;
    let deps = RuntimeDeps::production(&config)
        .context("failed to build runtime dependencies")?;
    let runtime = RecorderRuntime::new(config, deps);
    let report = runtime
        .sweep_retention()
        .await
        .context("retention sweep failed")?;

    for (path, err) in &report.failures {
        warn!(path = %path.display(), error = %err, "could not remove");
    }
    println!(
        "removed {} files and {} directories at {}",
        report.files_removed.len(),
        report.dirs_removed.len(),
        Utc::now().to_rfc3339(),
    );
    Ok(())
}

async fn run_streamers(
    config: RecorderConfig,
    command: StreamersCommand,
) -> anyhow::Result<()> {
    let _instance = match command {
        StreamersCommand::List => None,
        _ => Some(acquire_offline_lock(&config)?),
    };
    let store = RegistryStore::new(&config.storage.registry_path);
    let document = store.load().await.context("failed to read registry")?;

    let registry = EntityRegistry::new();
    for record in &document.streamers {
        if let Err(err) = registry.add(&record.username).await {
            warn!(entity = %record.username, error = %err, "skipping registry entry");
        }
    }

    match command {
        StreamersCommand::List => {
            for entity in registry.list().await {
                println!("{}", entity.id);
            }
            return Ok(());
        }
        StreamersCommand::Add { id } => {
            registry
                .add(&id)
                .await
                .with_context(|| format!("cannot add {id}"))?;
            info!(entity = %id, "entity added");
        }
        StreamersCommand::Remove { id } => {
            registry
                .remove(&id)
                .await
                .with_context(|| format!("cannot remove {id}"))?;
            info!(entity = %id, "entity removed");
        }
    }

    store
        .save(&registry.list().await)
        .await
        .context("failed to write registry")?;
    Ok(())
}

/// Offline commands refuse to run next to a live daemon on the same
/// download directory.
fn acquire_offline_lock(config: &RecorderConfig) -> anyhow::Result<InstanceLock> {
    InstanceLock::acquire(&config.storage.download_dir).with_context(|| {
        format!(
            "stop the recorder using {} first",
            config.storage.download_dir.display()
        )
    })
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

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
