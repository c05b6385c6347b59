use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::admission::{AdmissionController, AdmissionStatus, Rejection};
use floodgate::config::{FloodgateConfig, LoggingConfig};

#[derive(Parser, Debug)]
#[command(name = "floodgate", version, about = "Admission control load harness")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive synthetic operations through the admission layer
    Simulate {
        /// Total operations to issue
        #[arg(long, default_value_t = 1000)]
        requests: u64,

        /// Concurrent clients issuing operations
        #[arg(long, default_value_t = 50)]
        workers: u64,

        /// Distinct caller identities to spread operations over
        #[arg(long, default_value_t = 20)]
        keys: u32,

        /// Mean simulated work per operation, in milliseconds
        #[arg(long, default_value_t = 25)]
        work_ms: u64,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[derive(Default)]
struct Tally {
    admitted: AtomicU64,
    rate_limited: AtomicU64,
    overloaded: AtomicU64,
    invalid: AtomicU64,
}

#[derive(Serialize)]
struct Summary {
    admitted: u64,
    rate_limited: u64,
    overloaded: u64,
    invalid: u64,
    elapsed_ms: u64,
    status: AdmissionStatus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = FloodgateConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Simulate {
            requests,
            workers,
            keys,
            work_ms,
        } => {
            let controller = Arc::new(AdmissionController::from_config(&config)?);
            let tally = Arc::new(Tally::default());
            let started = tokio::time::Instant::now();

            info!(
                requests = requests,
                workers = workers,
                keys = keys,
                "Starting simulation"
            );

            tokio::select! {
                _ = simulate(controller.clone(), tally.clone(), requests, workers, keys, work_ms) => {
                    info!("Simulation finished");
                }
                _ = shutdown_signal() => {
                    warn!("Simulation interrupted");
                }
            }

            // Shutdown clears every key log, so snapshot first
            let status = controller.status();
            controller.shutdown();

            let summary = Summary {
                admitted: tally.admitted.load(Ordering::Relaxed),
                rate_limited: tally.rate_limited.load(Ordering::Relaxed),
                overloaded: tally.overloaded.load(Ordering::Relaxed),
                invalid: tally.invalid.load(Ordering::Relaxed),
                elapsed_ms: started.elapsed().as_millis() as u64,
                status,
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

async fn simulate(
    controller: Arc<AdmissionController>,
    tally: Arc<Tally>,
    requests: u64,
    workers: u64,
    keys: u32,
    work_ms: u64,
) {
    let workers = workers.max(1);
    let keys = keys.max(1);

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let controller = controller.clone();
            let tally = tally.clone();
            // Spread the remainder over the first workers
            let share = requests / workers + u64::from(worker < requests % workers);

            tokio::spawn(async move {
                for _ in 0..share {
                    let (ip, user, work) = {
                        let mut rng = rand::thread_rng();
                        (
                            format!("10.0.0.{}", rng.gen_range(0..keys)),
                            format!("user-{}", rng.gen_range(0..keys)),
                            Duration::from_millis(rng.gen_range(0..=work_ms * 2)),
                        )
                    };

                    let outcome = controller
                        .run(&[("ip", ip.as_str()), ("user", user.as_str())], tokio::time::sleep(work))
                        .await;

                    let counter = match outcome {
                        Ok(()) => &tally.admitted,
                        Err(Rejection::RateLimited { .. }) => &tally.rate_limited,
                        Err(Rejection::Overloaded { .. }) => &tally.overloaded,
                        Err(Rejection::InvalidKey { .. }) => &tally.invalid,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            warn!(error = %e, "Simulation worker failed");
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
