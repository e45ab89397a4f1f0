//! Experiment Service: A/B tests, multivariate tests, rollouts and feature
//! flags behind a REST API.
//!
//! Main entry point that wires the engine, starts the status scheduler and
//! serves HTTP.

use clap::Parser;
use experiment_api::ApiServer;
use experiment_core::config::AppConfig;
use experiment_engine::{EngineContext, ExperimentEngine, InMemoryExperimentStore, InMemoryUserDirectory};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "experiment-service")]
#[command(about = "Experiment engine for A/B tests and feature flags")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "EXPERIMENT_SERVICE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "EXPERIMENT_SERVICE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Status scheduler interval in seconds (overrides config)
    #[arg(long, env = "EXPERIMENT_SERVICE__SCHEDULER__INTERVAL_SECS")]
    scheduler_interval: Option<u64>,

    /// Disable schedule-driven status transitions
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "experiment_service=info,experiment_engine=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Experiment Service starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(secs) = cli.scheduler_interval {
        config.scheduler.interval_secs = secs;
    }
    if cli.no_scheduler {
        config.scheduler.enabled = false;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        scheduler = config.scheduler.enabled,
        alpha = config.engine.alpha,
        "Configuration loaded"
    );

    let store = Arc::new(InMemoryExperimentStore::new());
    let users = Arc::new(InMemoryUserDirectory::new());
    let engine = Arc::new(ExperimentEngine::new(
        store,
        users.clone(),
        EngineContext::from_config(&config.engine),
    ));

    let api_server = ApiServer::new(config.clone(), engine.clone(), users);

    if config.metrics.enabled {
        if let Err(e) = api_server.start_metrics() {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    if config.scheduler.enabled {
        let engine = engine.clone();
        let period = Duration::from_secs(config.scheduler.interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let engine = engine.clone();
                match tokio::task::spawn_blocking(move || engine.run_status_transitions()).await {
                    Ok(Ok(changes)) if !changes.is_empty() => {
                        info!(count = changes.len(), "Applied scheduled status transitions");
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, retryable = e.is_retryable(), "Status scheduler pass failed"),
                    Err(e) => error!(error = %e, "Status scheduler task panicked"),
                }
            }
        });
        info!(interval_secs = period.as_secs(), "Status scheduler started");
    }

    info!("Experiment Service is ready to serve traffic");

    api_server.start_http().await?;

    Ok(())
}
