//! Subgate server
//!
//! Serves the payment API: crypto intents, walk-up wallet activation, hosted
//! checkout and processor webhooks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use subgate_api::{router, AppState};
use subgate_payment::config::StorageBackend;
use subgate_payment::{
    Engine, MemoryStore, SolanaRpc, SqliteStore, Store, StripeClient, SubgateConfig,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Subgate - payment verification and subscription activation
#[derive(Parser)]
#[command(name = "subgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "subgate.toml")]
    config: PathBuf,

    /// Log level (overrides the config file)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Write a default config file
    GenConfig {
        /// Output path
        #[arg(short, long, default_value = "subgate.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Expire stale payment intents once and exit
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::GenConfig { output, force } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), false)?;
            cmd_gen_config(output, force).await
        }
        Commands::Serve { listen } => {
            let config = load_config(&cli.config).await?;
            init_logging(
                cli.log_level.as_deref().unwrap_or(&config.logging.level),
                config.logging.json,
            )?;
            cmd_serve(config, listen).await
        }
        Commands::Sweep => {
            let config = load_config(&cli.config).await?;
            init_logging(
                cli.log_level.as_deref().unwrap_or(&config.logging.level),
                config.logging.json,
            )?;
            cmd_sweep(config).await
        }
    }
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())
            .context("Failed to set tracing subscriber")?;
    } else {
        tracing::subscriber::set_global_default(builder.compact().finish())
            .context("Failed to set tracing subscriber")?;
    }

    Ok(())
}

async fn load_config(path: &Path) -> Result<SubgateConfig> {
    let mut config = SubgateConfig::load(path)
        .await
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_env_overrides();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_engine<S: Store + 'static>(store: Arc<S>, config: &SubgateConfig) -> Result<Engine> {
    let chain = SolanaRpc::from_config(&config.solana).context("Failed to create Solana RPC client")?;
    let checkout = StripeClient::from_config(&config.stripe).context("Failed to create Stripe client")?;

    Engine::new(store, Arc::new(chain), Arc::new(checkout), config)
        .context("Failed to build payment engine")
}

fn open_engine(config: &SubgateConfig) -> Result<Engine> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; state is lost on restart");
            build_engine(Arc::new(MemoryStore::new()), config)
        }
        StorageBackend::Sqlite => {
            let store = SqliteStore::open(Path::new(&config.storage.path))
                .with_context(|| format!("Failed to open database {}", config.storage.path))?;
            build_engine(Arc::new(store), config)
        }
    }
}

async fn cmd_serve(config: SubgateConfig, listen: Option<String>) -> Result<()> {
    info!("Starting subgate...");

    let engine = open_engine(&config)?;

    let rpc = SolanaRpc::from_config(&config.solana)?;
    match rpc.get_slot().await {
        Ok(slot) => info!("Solana RPC {} reachable at slot {}", config.solana.rpc_url, slot),
        Err(e) => warn!("Solana RPC {} not reachable yet: {}", config.solana.rpc_url, e),
    }

    if config.stripe.webhook_secret.is_empty() {
        warn!("No Stripe webhook secret configured; webhooks will be rejected");
    }

    let app = router(
        AppState::new(engine),
        Duration::from_secs(config.server.request_timeout_secs),
    );

    let addr = listen.unwrap_or(config.server.listen);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

async fn cmd_sweep(config: SubgateConfig) -> Result<()> {
    let engine = open_engine(&config)?;
    let expired = engine.intents.sweep_expired().await?;
    println!("Expired {} payment intents", expired);
    Ok(())
}

async fn cmd_gen_config(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Config already exists at {:?}. Use --force to overwrite.",
            output
        );
    }

    SubgateConfig::default().save(&output).await?;

    println!("Config written to {}", output.display());
    println!("Set solana.treasury_address and the stripe section before running: subgate serve");
    Ok(())
}
