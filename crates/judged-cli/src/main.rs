//! judged CLI
//!
//! Runs the judge daemon over a spool directory broker and a filesystem object
//! store, and offers a few helpers for inspecting configuration and queueing
//! tasks by hand.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use judged::{
    ArtifactCache, Config, Daemon, EXAMPLE_CONFIG, FsObjectStore, IsolateSandbox, Runner,
    SpoolBroker, Task, prepare_cgroup,
};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "judged")]
#[command(about = "A judge daemon running submissions in isolate sandboxes")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume tasks until interrupted
    Serve,

    /// Initialize a new configuration file
    Init {
        /// Output path (default: judged.toml)
        #[arg(short, long, default_value = "judged.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Queue a task file in the spool directory
    Enqueue {
        /// JSON task file
        #[arg(value_name = "FILE")]
        task: PathBuf,
    },

    /// List available languages
    Languages,

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Commands::Init { output, force } = &cli.command {
        return init_config(output, *force).await;
    }

    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using example configuration");
        Config::example().context("embedded example configuration is invalid")?
    };

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Enqueue { task } => enqueue(&config, &task).await,
        Commands::Languages => {
            list_languages(&config);
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
        Commands::Init { .. } => Ok(()),
    }
}

async fn serve(mut config: Config) -> Result<()> {
    // Set up cgroup hierarchy if cgroup mode is enabled
    if config.cgroup {
        match prepare_cgroup(&config.cg_root) {
            Ok(true) => debug!("cgroup hierarchy ready"),
            Ok(false) => {
                warn!(
                    "cgroup support unavailable (memory controller not found), falling back to RLIMIT_AS"
                );
                config.cgroup = false;
            }
            Err(e) => {
                warn!("cgroup setup failed: {e}, falling back to RLIMIT_AS memory limiting");
                config.cgroup = false;
            }
        }
    }

    tokio::fs::create_dir_all(&config.meta_dir)
        .await
        .with_context(|| format!("failed to create meta directory {}", config.meta_dir.display()))?;

    let sandbox = Arc::new(IsolateSandbox::from_config(&config).context("invalid sandbox setup")?);
    let store = Arc::new(FsObjectStore::new(&config.storage.root));
    let cache = ArtifactCache::open(
        &config.cache.root,
        config.cache.budget_bytes,
        config.cache.safety_margin_bytes,
        store.clone(),
    )
    .await
    .context("failed to open artifact cache")?;
    let broker = SpoolBroker::open(
        &config.broker.spool_dir,
        Duration::from_millis(config.broker.poll_interval_ms),
        config.broker.max_deliveries,
    )
    .await
    .context("failed to open spool directory")?;

    let slots = config.slot_count();
    info!(
        slots,
        spool = %config.broker.spool_dir.display(),
        storage = %config.storage.root.display(),
        cache_budget = config.cache.budget_bytes,
        "starting judge daemon"
    );

    let runner = Runner::new(Arc::new(config), sandbox, store, Arc::new(cache));
    let daemon = Daemon::new(runner, Arc::new(broker), slots);
    daemon
        .run(shutdown_signal())
        .await
        .context("judge daemon failed")?;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn enqueue(config: &Config, task_path: &Path) -> Result<()> {
    let payload = tokio::fs::read(task_path)
        .await
        .context("failed to read task file")?;
    let task = Task::from_slice(&payload).context("task file is not a valid task")?;
    config
        .get_language(task.language())
        .context("task uses an unknown language")?;

    let broker = SpoolBroker::open(
        &config.broker.spool_dir,
        Duration::from_millis(config.broker.poll_interval_ms),
        config.broker.max_deliveries,
    )
    .await
    .context("failed to open spool directory")?;
    let path = broker
        .enqueue(&task.to_vec()?)
        .await
        .context("failed to enqueue task")?;

    println!(
        "Queued {} task for submission '{}' at '{}'",
        task.kind(),
        task.submission_id(),
        path.display()
    );
    Ok(())
}

fn list_languages(config: &Config) {
    println!("Available languages:\n");

    let mut languages: Vec<_> = config.languages.iter().collect();
    languages.sort_by_key(|(id, _)| *id);

    for (id, lang) in languages {
        let lang_type = if lang.is_compiled() {
            "compiled"
        } else {
            "interpreted"
        };
        println!("  {:<15} {} ({})", id, lang.name, lang_type);
    }
}

fn show_config(config: &Config) {
    println!("Isolate binary: {}", config.isolate_binary().display());
    println!("Cgroup memory limits: {}", config.cgroup);
    println!("Meta directory: {}", config.meta_dir.display());
    println!("Slots: {}", config.slot_count());
    println!();
    println!("Cache root: {}", config.cache.root.display());
    println!("  Budget: {} bytes", config.cache.budget_bytes);
    println!("  Safety margin: {} bytes", config.cache.safety_margin_bytes);
    println!("Storage root: {}", config.storage.root.display());
    println!("Spool directory: {}", config.broker.spool_dir.display());
    println!("  Poll interval: {} ms", config.broker.poll_interval_ms);
    println!("  Max deliveries: {}", config.broker.max_deliveries);
    println!("Output comparison: {:?}", config.comparison);
    println!();
    println!("Languages configured: {}", config.languages.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
