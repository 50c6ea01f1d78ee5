use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::{LimiterManager, PolicyCatalog, RateLimitResult};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Inspect and exercise rate limit policies")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective policy catalog
    Policies {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Issue a series of checks against one limiter and print each decision
    Simulate {
        /// Limiter to check, e.g. `login`
        #[arg(short, long)]
        limiter: String,

        /// Caller identity
        #[arg(short, long, default_value = "demo-user")]
        identity: String,

        /// Number of checks to issue
        #[arg(short = 'n', long, default_value_t = 10)]
        requests: u32,

        /// Delay between checks in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Print one JSON object per check
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Configuration loaded");

    let catalog = config.catalog()?;

    match cli.command {
        Command::Policies { json } => print_policies(&catalog, json)?,
        Command::Simulate {
            limiter,
            identity,
            requests,
            interval_ms,
            json,
        } => {
            let manager = Arc::new(
                LimiterManager::new().with_sweep_interval(config.sweep_interval()),
            );
            manager.initialize_with(&catalog)?;
            if !manager.contains(&limiter) {
                bail!(
                    "unknown limiter '{}' (known: {})",
                    limiter,
                    manager.limiter_names().join(", ")
                );
            }

            let interval = Duration::from_millis(interval_ms);
            tokio::select! {
                result = simulate(&manager, &limiter, &identity, requests, interval, json) => result?,
                _ = shutdown_signal() => {}
            }

            manager.destroy();
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_policies(catalog: &PolicyCatalog, json: bool) -> anyhow::Result<()> {
    if json {
        let rules: Vec<_> = catalog
            .rules()
            .into_iter()
            .map(|(name, rule)| serde_json::json!({ "name": name, "rule": rule }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rules)?);
        return Ok(());
    }

    println!(
        "{:<16} {:<15} {:>6} {:>10}  {}",
        "NAME", "ALGORITHM", "LIMIT", "WINDOW", "KEY"
    );
    for (name, config) in catalog.iter() {
        let key = config
            .key_generator
            .as_ref()
            .map(|generator| generator.label().to_string())
            .unwrap_or_else(|| "identity".to_string());
        println!(
            "{:<16} {:<15} {:>6} {:>10}  {}",
            name,
            config.algorithm,
            config.max_requests,
            format_window(config.window_ms),
            key
        );
    }
    Ok(())
}

fn format_window(window_ms: u64) -> String {
    match window_ms {
        ms if ms % 3_600_000 == 0 => format!("{}h", ms / 3_600_000),
        ms if ms % 60_000 == 0 => format!("{}m", ms / 60_000),
        ms if ms % 1_000 == 0 => format!("{}s", ms / 1_000),
        ms => format!("{}ms", ms),
    }
}

async fn simulate(
    manager: &LimiterManager,
    limiter: &str,
    identity: &str,
    requests: u32,
    interval: Duration,
    json: bool,
) -> anyhow::Result<()> {
    let mut admitted = 0u32;

    for attempt in 1..=requests {
        let result = manager.check(limiter, identity)?;
        if result.allowed {
            admitted += 1;
        }

        if json {
            println!("{}", serde_json::to_string(&result)?);
        } else {
            println!("#{:<4} {}", attempt, describe(&result));
        }

        if attempt < requests && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    info!(
        limiter = %limiter,
        identity = %identity,
        admitted,
        denied = requests - admitted,
        "Simulation finished"
    );
    Ok(())
}

fn describe(result: &RateLimitResult) -> String {
    let reset = i64::try_from(result.reset_time)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| result.reset_time.to_string());

    match result.retry_after {
        Some(secs) if !result.allowed => format!(
            "denied   remaining={} reset={} retry_after={}s",
            result.remaining, reset, secs
        ),
        _ => format!("allowed  remaining={} reset={}", result.remaining, reset),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
