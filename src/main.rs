use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use banwatch::captcha::{ProviderKind, SolverRegistry};
use banwatch::config::{Config, LoggingConfig};
use banwatch::proxy::{source_for, ProxyPool};
use banwatch::scheduler::Worker;
use banwatch::server::{self, AppState};
use banwatch::shard::shard_of;

#[derive(Parser)]
#[command(
    name = "banwatch",
    version,
    about = "Distributed ban-status checker",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML). Without it, BANWATCH_* variables are read.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides `logging.format`
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the check worker until Ctrl+C
    Run,

    /// Validate a captcha vendor key and print its balance
    CheckKey {
        /// Vendor (anti_captcha, capsolver)
        #[arg(short, long)]
        provider: String,

        /// API key to validate
        #[arg(short, long)]
        key: String,
    },

    /// Print the configured proxy routes (masked)
    Routes,

    /// Print the shard a user key maps to
    ShardOf {
        /// User key
        #[arg(short, long)]
        user: String,

        /// Shard count
        #[arg(short, long)]
        total: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    setup_tracing(&config.logging, cli.log_format.as_deref(), cli.verbose)?;

    match cli.command {
        Commands::Run => {
            tracing::info!(config = ?cli.config, "Starting run command");
            run(config).await?;
        }

        Commands::CheckKey { provider, key } => {
            tracing::info!(provider = %provider, "Starting check-key command");
            check_key(&config, &provider, &key).await?;
        }

        Commands::Routes => routes(&config).await?,

        Commands::ShardOf { user, total } => {
            anyhow::ensure!(total > 0, "--total must be at least 1");
            println!("{}", shard_of(&user, total));
        }
    }

    Ok(())
}

fn setup_tracing(logging: &LoggingConfig, format: Option<&str>, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("banwatch=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!("banwatch={},warn", logging.level))
        })
    };

    match format.unwrap_or(logging.format.as_str()) {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()?;
        }
    }

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    if let Err(e) = banwatch::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    let bind_address = config.server.bind_address.clone();
    let worker = Worker::build(config).await?;
    let state = AppState::from_worker(&worker);
    let handle = worker.start();

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let server_task = bind_address.map(|address| {
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = server::serve(&address, state, shutdown).await {
                tracing::error!(error = %e, "HTTP server stopped");
            }
        })
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!("Failed to wait for Ctrl+C: {}", e),
    }

    stop_tx.send_replace(true);
    if let Some(task) = server_task {
        let _ = task.await;
    }
    handle.shutdown().await?;
    Ok(())
}

async fn check_key(config: &Config, provider: &str, key: &str) -> Result<()> {
    let kind: ProviderKind = provider.parse().map_err(anyhow::Error::msg)?;
    let registry = SolverRegistry::from_config(&config.captcha)?;

    let validation = registry
        .check_key(kind, key)
        .await
        .with_context(|| format!("Balance check against {kind} failed"))?;

    println!("Provider: {kind}");
    println!("  Valid:   {}", validation.valid);
    println!("  Balance: {:.2}", validation.balance);
    Ok(())
}

async fn routes(config: &Config) -> Result<()> {
    let pool = ProxyPool::new(&config.proxy, source_for(&config.proxy))?;

    let routes = pool.routes().await;
    if routes.is_empty() {
        println!("No proxy routes configured; requests go direct.");
        return Ok(());
    }

    println!("Strategy: {}", config.proxy.strategy.as_str());
    for route in routes {
        println!("  {}  [{}]", route.id(), route.health.as_str());
    }
    Ok(())
}
