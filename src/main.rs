use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "redis")]
use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{StoreBackend, TollgateConfig};
use tollgate::{Clock, MemoryStore, QuotaError, QuotaStore, SystemClock, TierRegistry};

/// Operator tool for Tollgate quotas.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Configuration file (YAML, JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run admission checks for a subject and print each decision
    Check {
        #[arg(long)]
        tier: String,
        #[arg(long)]
        subject: String,
        /// Number of checks to run
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Pause between checks in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Show a subject's remaining quota without consuming any
    Peek {
        #[arg(long)]
        tier: String,
        #[arg(long)]
        subject: String,
    },
    /// List configured tiers
    Tiers,
    /// Validate the configuration and exit
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = TollgateConfig::load(cli.config.as_ref())?;
    config.validate()?;
    let tiers = config.tier_registry()?;
    info!(tiers = tiers.len(), backend = ?config.store.backend, "Configuration loaded");

    match cli.command {
        Command::Validate => {
            println!("configuration ok: {} tier(s)", tiers.len());
        }
        Command::Tiers => print_tiers(&tiers),
        Command::Peek { tier, subject } => {
            let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
            let store = open_store(&config, Arc::clone(&clock)).await?;
            let limiter = tiers.limiter(&tier, store, clock, &config.limiter_options())?;

            let snapshot = limiter.peek(&subject).await?;
            println!(
                "{} {}: {} remaining, resets at {}",
                tier, subject, snapshot.remaining, snapshot.resets_at
            );
        }
        Command::Check {
            tier,
            subject,
            count,
            interval_ms,
        } => {
            let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
            let store = open_store(&config, Arc::clone(&clock)).await?;
            let limiter = tiers.limiter(&tier, store, clock, &config.limiter_options())?;

            let checks = async {
                for i in 1..=count {
                    match limiter.try_acquire(&subject).await {
                        Ok(()) => println!("{:>4} admit", i),
                        Err(QuotaError::LimitExceeded { .. }) => println!("{:>4} deny (limit exceeded)", i),
                        Err(e) => println!("{:>4} deny ({})", i, e),
                    }
                    if interval_ms > 0 && i < count {
                        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                    }
                }
            };

            tokio::select! {
                _ = checks => {}
                _ = shutdown_signal() => {
                    warn!("Interrupted, stopping checks");
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

async fn open_store(
    config: &TollgateConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn QuotaStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; quotas are not shared between instances");
            Ok(Arc::new(MemoryStore::new(clock)))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let store = tokio::time::timeout(
                config.store_timeout(),
                tollgate::store::RedisStore::connect(&config.store.redis_url),
            )
            .await
            .context("timed out connecting to Redis")??;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => anyhow::bail!("tollgate was built without the redis feature"),
    }
}

fn print_tiers(tiers: &TierRegistry) {
    for name in tiers.names() {
        if let Some(tier) = tiers.get(name) {
            println!(
                "{:<16} {:<12} period={}s capacity={}",
                name,
                tier.algo,
                tier.period(),
                tier.capacity()
            );
        }
    }
}

/// Wait for Ctrl+C.
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
