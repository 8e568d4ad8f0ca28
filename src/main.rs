use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use muninn::engine::Scheduler;
use muninn::notify::{spawn_notification_worker, LogNotifier, NotificationQueue, Notifier, WebhookNotifier};
use muninn::registry::{AgentRegistry, KindFilter};
use muninn::seed::{load_seeds, seed_storage, validate_seeds};
use muninn::storage::{InMemoryStore, PostgresStorage, Storage};
use muninn::Config;

#[derive(Parser)]
#[command(name = "muninn")]
#[command(about = "Scheduled agents passing events along a dataflow graph", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tick driver until interrupted
    Run {
        #[arg(long, help = "TOML config file (defaults to MUNINN_* environment variables)")]
        config: Option<PathBuf>,
        #[arg(long, help = "YAML agent seed file for the in-memory store")]
        agents: Option<PathBuf>,
        #[arg(long, value_delimiter = ',', conflicts_with = "except", help = "Only run these agent kinds")]
        only: Vec<String>,
        #[arg(long, value_delimiter = ',', help = "Run every agent kind except these")]
        except: Vec<String>,
    },
    /// Check a seed file for configuration errors
    Validate {
        #[arg(long)]
        agents: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            agents,
            only,
            except,
        } => {
            let mut config = match config {
                Some(path) => Config::from_file(&path)?,
                None => Config::from_env(),
            };
            if agents.is_some() {
                config.agents_file = agents;
            }
            init_logging(&config.log_level);

            let filter = if !only.is_empty() {
                KindFilter::only(only)
            } else if !except.is_empty() {
                KindFilter::except(except)
            } else {
                KindFilter::All
            };
            run(config, filter).await?
        }
        Commands::Validate { agents } => {
            init_logging("warn");
            validate(&agents)?
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).compact().init();
}

async fn run(config: Config, filter: KindFilter) -> Result<()> {
    let registry = Arc::new(AgentRegistry::with_builtins());
    let unknown = filter.unknown_kinds(&registry);
    if !unknown.is_empty() {
        log::warn!("Kind filter names unregistered kinds: {}", unknown.join(", "));
    }

    let storage: Arc<dyn Storage> = match &config.database_url {
        Some(url) => {
            let postgres = PostgresStorage::new(url)
                .await
                .context("Failed to connect to Postgres")?;
            postgres.run_migrations().await.context("Failed to apply migrations")?;
            if config.agents_file.is_some() {
                log::warn!("Ignoring agents file: seeding only applies to the in-memory store");
            }
            Arc::new(postgres)
        }
        None => {
            let store = InMemoryStore::new();
            if let Some(path) = &config.agents_file {
                seed_storage(&store, &registry, path).await?;
            }
            Arc::new(store)
        }
    };

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    };
    let (queue, rx) = NotificationQueue::new();
    let worker = spawn_notification_worker(rx, notifier);

    let scheduler = Scheduler::new(
        storage,
        registry,
        Some(queue),
        filter,
        config.scheduler_config(),
    );
    log::info!("muninn {} starting", env!("CARGO_PKG_VERSION"));
    scheduler.run(shutdown_signal()).await?;

    // Dropping the scheduler closes the queue; let pending notices drain.
    drop(scheduler);
    if let Err(e) = worker.await {
        log::error!("Notification worker ended abnormally: {}", e);
    }
    log::info!("muninn shutdown complete");
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    let registry = AgentRegistry::with_builtins();
    let seeds = load_seeds(path)?;
    let problems = validate_seeds(&seeds, &registry);

    if problems.is_empty() {
        println!("{} agents OK", seeds.len());
        return Ok(());
    }
    for problem in &problems {
        println!("{}:", problem.name);
        for error in &problem.errors {
            println!("  - {}", error);
        }
    }
    Err(anyhow!(
        "{} of {} agents have configuration errors",
        problems.len(),
        seeds.len()
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Could not listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
