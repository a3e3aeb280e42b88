//! # mcphub-cli
//!
//! Command-line entry point for the hub: config loading, tracing setup,
//! the run loop with graceful shutdown, and secrets management commands.

#![warn(missing_docs, rust_2018_idioms, clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mcphub_secrets::{ExportFormat, SecretsStore, StorePolicy};
use mcphub_server::generation::FileMigrationStore;
use mcphub_server::{Hub, HubConfig, HubOptions, RolloverController, WorkerFactory};

/// Where log output goes; the stdio downstream mode must keep stdout clean
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogSink {
    /// Log to stderr (safe with a stdio downstream)
    #[default]
    Stderr,
    /// Log to stdout
    Stdout,
    /// Discard logs
    Silent,
}

/// mcphub - aggregate many MCP servers behind one endpoint
#[derive(Debug, Parser)]
#[command(name = "mcphub", version, about)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "mcphub.config.json")]
    pub config: PathBuf,

    /// Log level filter (overrides the config's logLevel)
    #[arg(long, global = true, env = "MCPHUB_LOG")]
    pub log_level: Option<String>,

    /// Log output sink
    #[arg(long, global = true, value_enum, default_value_t = LogSink::Stderr)]
    pub log_sink: LogSink,

    /// Working directory for persisted state
    #[arg(long, global = true, default_value = ".mcphub")]
    pub work_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the hub
    Run,
    /// Validate the configuration and exit
    CheckConfig,
    /// Manage the secrets store
    Secrets {
        /// Secrets operation
        #[command(subcommand)]
        command: SecretsCommand,
    },
}

/// Secrets store operations
#[derive(Debug, Subcommand)]
pub enum SecretsCommand {
    /// Store a secret
    Set {
        /// Key name
        key: String,
        /// Value (read from stdin when omitted)
        value: Option<String>,
    },
    /// Read a secret
    Get {
        /// Key name
        key: String,
    },
    /// List stored secrets
    List,
    /// Remove a secret
    Rm {
        /// Key name
        key: String,
    },
    /// Re-encrypt everything under a fresh master key
    Rotate,
    /// Export all secrets
    Export {
        /// Output format
        #[arg(long, default_value = "json")]
        format: String,
    },
    /// Import secrets from a JSON object on stdin
    Import,
}

/// Initialise tracing with the configured sink and filter
pub fn init_tracing(level: Option<&str>, sink: LogSink) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match sink {
        LogSink::Stderr => {
            fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        LogSink::Stdout => {
            fmt().with_env_filter(filter).init();
        }
        LogSink::Silent => {
            fmt()
                .with_env_filter(filter)
                .with_writer(std::io::sink)
                .init();
        }
    }
}

/// Load and validate the configuration file
pub fn load_config(path: &PathBuf) -> Result<Arc<HubConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config at {}", path.display()))?;
    let config = HubConfig::from_json(&raw).context("configuration rejected")?;
    Ok(Arc::new(config))
}

/// The worker factory used by the run loop: builds a hub per generation and
/// mounts every configured server.
pub fn production_worker_factory(secrets: Option<Arc<SecretsStore>>) -> WorkerFactory {
    Arc::new(move |config: Arc<HubConfig>| {
        let secrets = secrets.clone();
        Box::pin(async move {
            let options = HubOptions::from_config(&config);
            let hub = Hub::with_parts(
                options,
                mcphub_server::InterceptorChain::new().with(Arc::new(
                    mcphub_server::LoggingInterceptor::new(mcphub_core::Redactor::new(
                        &config.security.redact_keys,
                    )),
                )),
                Arc::new(mcphub_server::AllowAllGate),
                secrets,
            );
            for spec in &config.servers {
                hub.import(spec.clone()).await?;
            }
            Ok(hub)
        })
    })
}

/// Run the hub until SIGINT/SIGTERM.
///
/// Shutdown order: stop sweepers, drain sessions, disconnect upstreams,
/// flush state.
pub async fn run(cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)?;

    let secrets = Arc::new(
        SecretsStore::open(cli.work_dir.join("secrets"), StorePolicy::default())
            .context("cannot open secrets store")?,
    );
    let migration_store = Arc::new(FileMigrationStore::new(cli.work_dir.join("migrations")));

    let events = Arc::new(mcphub_core::EventBus::new());
    let controller = RolloverController::new(
        config.rollover.clone(),
        config.generation.clone(),
        production_worker_factory(Some(secrets)),
        Arc::clone(&events),
        migration_store,
    );

    let generation = controller
        .apply_config(Arc::clone(&config))
        .await
        .map_err(|e| anyhow::anyhow!("startup failed: {e}"))?;
    info!(generation, "hub is serving");

    let cancel = CancellationToken::new();
    controller.spawn_guard(cancel.clone());

    // Readiness aggregation over the active worker's upstreams.
    let monitor = Arc::new(mcphub_server::HealthMonitor::new(3));
    {
        let controller_for_probe = Arc::clone(&controller);
        monitor.register(mcphub_server::Probe::new(
            "rollover",
            "active-worker",
            true,
            std::time::Duration::from_millis(config.timeouts.health_check_ms),
            move || {
                let controller = Arc::clone(&controller_for_probe);
                async move {
                    let Some(generation) = controller.active_generation() else {
                        return Err(mcphub_core::HubError::server_not_connected(
                            "no active generation",
                        ));
                    };
                    for worker in controller.workers_of(generation) {
                        worker.probe().await?;
                    }
                    Ok(())
                }
            },
        ));
        monitor.spawn(
            std::time::Duration::from_millis(config.rollover.health_check_interval_ms),
            cancel.clone(),
        );
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    // Shutdown order: stop sweepers and guards, drain sessions and
    // upstreams, flush state last.
    cancel.cancel();
    controller.shutdown().await;

    let snapshot = mcphub_server::RegistrySnapshot {
        servers: config.servers.clone(),
    };
    if let Err(e) = snapshot.save(&cli.work_dir.join("registry.json")) {
        error!("failed to flush registry snapshot: {e}");
    }
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt =
            signal(SignalKind::interrupt()).expect("SIGINT handler installation");
        let mut terminate =
            signal(SignalKind::terminate()).expect("SIGTERM handler installation");
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Execute a secrets command against the store in the working directory
pub fn run_secrets(cli: &Cli, command: &SecretsCommand) -> Result<()> {
    let store = SecretsStore::open(cli.work_dir.join("secrets"), StorePolicy::default())
        .context("cannot open secrets store")?;

    match command {
        SecretsCommand::Set { key, value } => {
            let value = match value {
                Some(value) => value.clone(),
                None => {
                    use std::io::Read as _;
                    let mut buffer = String::new();
                    std::io::stdin().read_to_string(&mut buffer)?;
                    buffer.trim_end_matches('\n').to_string()
                }
            };
            store.set(key, &value)?;
            eprintln!("stored '{key}'");
        }
        SecretsCommand::Get { key } => {
            println!("{}", store.get(key)?);
        }
        SecretsCommand::List => {
            for info in store.list()? {
                let kind = if info.encrypted { "encrypted" } else { "plain" };
                println!("{}\t{kind}\t{}", info.key, info.updated_at.to_rfc3339());
            }
        }
        SecretsCommand::Rm { key } => {
            if store.remove(key)? {
                eprintln!("removed '{key}'");
            } else {
                eprintln!("'{key}' was not stored");
            }
        }
        SecretsCommand::Rotate => {
            let count = store.rotate()?;
            eprintln!("re-encrypted {count} secrets under a fresh master key");
        }
        SecretsCommand::Export { format } => {
            let format = match format.as_str() {
                "json" => ExportFormat::Json,
                "env" => ExportFormat::Env,
                other => anyhow::bail!("unknown export format '{other}' (json|env)"),
            };
            print!("{}", store.export(format)?);
        }
        SecretsCommand::Import => {
            use std::io::Read as _;
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            let count = store.import(&buffer)?;
            eprintln!("imported {count} secrets");
        }
    }
    Ok(())
}

/// Entry point shared by the binary; returns the process exit code
pub async fn execute(cli: Cli) -> i32 {
    match &cli.command {
        Command::Run => match run(&cli).await {
            Ok(()) => 0,
            Err(e) => {
                error!("fatal: {e:#}");
                1
            }
        },
        Command::CheckConfig => match load_config(&cli.config) {
            Ok(config) => {
                eprintln!(
                    "configuration ok: {} servers, naming strategy {:?}",
                    config.servers.len(),
                    config.tool_naming.strategy
                );
                0
            }
            Err(e) => {
                eprintln!("configuration invalid: {e:#}");
                1
            }
        },
        Command::Secrets { command } => match run_secrets(&cli, command) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("error: {e:#}");
                1
            }
        },
    }
}
