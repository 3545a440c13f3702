use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bucketgate::config::BucketgateConfig;
use bucketgate::gate::{BucketResolver, Gate, GateServer};
use bucketgate::ratelimit::{AdmissionEvaluator, LimiterRegistry, Strategy};
use bucketgate::store::{BucketStore, RedisBucketStore};

/// Shared token-bucket admission gate.
#[derive(Debug, Parser)]
#[command(name = "bucketgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the concurrency strategy (atomic or locked)
    #[arg(long)]
    strategy: Option<Strategy>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting Bucketgate admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = BucketgateConfig::load(args.config.as_deref())?;
    if let Some(strategy) = args.strategy {
        config.rate_limiting.strategy = strategy;
    }
    config.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        strategy = %config.rate_limiting.strategy,
        buckets = config.rate_limiting.buckets().count(),
        "Configuration loaded"
    );

    let store: Arc<dyn BucketStore> = Arc::new(RedisBucketStore::connect(&config.store).await?);

    // Initial bucket state is written before any traffic is accepted.
    let registry = LimiterRegistry::new(store.clone());
    let registered = registry
        .register_all(config.rate_limiting.buckets(), Utc::now())
        .await?;
    info!(count = registered, "Buckets initialized");

    let evaluator = AdmissionEvaluator::from_config(
        store,
        config.rate_limiting.strategy,
        &config.store,
    );
    info!(strategy = %evaluator.strategy(), "Admission evaluator ready");

    let gate = Arc::new(Gate::new(
        Arc::new(evaluator),
        BucketResolver::from_config(&config.rate_limiting),
    ));

    GateServer::new(config.server.listen_addr, gate)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Bucketgate admission service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
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
