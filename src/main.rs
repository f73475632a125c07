use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kubeguard::config::{self, Config};
use kubeguard::simulate::SimulatedSessions;
use kubeguard::{Core, CoreStats, OperationContext};

/// Operation names cycled through by the soak workers
const SOAK_OPERATIONS: [&str; 3] = ["list-pods", "get-deployment", "patch-configmap"];

#[derive(Parser)]
#[command(name = "kubeguard")]
#[command(version, about = "Pooled sessions and resilient calls for Kubernetes clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as YAML
    Config,

    /// Drive a simulated API server through the pool and report statistics
    Soak {
        /// Number of concurrent workers
        #[arg(long, default_value = "8")]
        workers: usize,

        /// Requests issued by each worker
        #[arg(long, default_value = "50")]
        requests: usize,

        /// Fraction of simulated calls that fail transiently (0.0 - 1.0)
        #[arg(long, default_value = "0.05")]
        failure_rate: f64,

        /// Simulated latency per call in milliseconds
        #[arg(long, default_value = "5")]
        latency_ms: u64,
    },
}

#[derive(Serialize)]
struct SoakReport {
    requests: usize,
    succeeded: usize,
    failed: usize,
    elapsed_ms: u64,
    sessions_created: u64,
    stats: CoreStats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Load configuration
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
            print!("{}", yaml);
        }
        Commands::Soak {
            workers,
            requests,
            failure_rate,
            latency_ms,
        } => {
            anyhow::ensure!(
                (0.0..=1.0).contains(&failure_rate),
                "--failure-rate must be between 0.0 and 1.0"
            );
            cmd_soak(config, workers, requests, failure_rate, Duration::from_millis(latency_ms)).await?;
        }
    }

    Ok(())
}

async fn cmd_soak(
    config: Config,
    workers: usize,
    requests: usize,
    failure_rate: f64,
    latency: Duration,
) -> Result<()> {
    let sessions = SimulatedSessions::new();
    sessions.set_failure_rate(failure_rate);
    sessions.set_call_latency(latency);

    let core = Arc::new(Core::new(config, sessions.clone()).await?);
    info!(workers, requests, failure_rate, "Starting soak run");

    let started = Instant::now();
    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                let mut succeeded = 0usize;
                let mut failed = 0usize;

                for i in 0..requests {
                    let operation = SOAK_OPERATIONS[(worker + i) % SOAK_OPERATIONS.len()];
                    let ctx = OperationContext::resource("Pod", format!("soak-{}-{}", worker, i))
                        .in_namespace("default")
                        .labelled(operation);

                    let result = core
                        .execute(operation, &ctx, |session| async move { session.call(operation).await })
                        .await;

                    match result {
                        Ok(_) => succeeded += 1,
                        Err(e) => {
                            debug!(worker, operation, error = %e, "Soak request failed");
                            failed += 1;
                        }
                    }
                }

                (succeeded, failed)
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut failed = 0;
    for result in futures::future::join_all(handles).await {
        let (ok, err) = result.context("Soak worker panicked")?;
        succeeded += ok;
        failed += err;
    }

    let report = SoakReport {
        requests: workers * requests,
        succeeded,
        failed,
        elapsed_ms: started.elapsed().as_millis() as u64,
        sessions_created: sessions.sessions_created(),
        stats: core.stats(),
    };
    core.dispose();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
