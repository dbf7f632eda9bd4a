//! SendFlow — headless timing intelligence layer for outbound messaging.
//!
//! Main entry point that initializes gateways, spawns the ingestion
//! workers, and serves the decision API.

use clap::Parser;
use sendflow_api::{ApiServer, AppState};
use sendflow_cache::FeatureCache;
use sendflow_core::config::AppConfig;
use sendflow_decision::TimingDecisionEngine;
use sendflow_event_store::{ClickHouseEventStore, EventStore};
use sendflow_features::FeatureEngine;
use sendflow_identity::IdentityResolver;
use sendflow_identity_store::{ClickHouseIdentityStore, IdentityStore};
use sendflow_ingestion::{IngestManager, IngestProcessor};
use sendflow_predictors::{HeuristicLatencyPredictor, HeuristicSignalWeightPredictor};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sendflow")]
#[command(about = "Headless timing intelligence layer for outbound messaging")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "SENDFLOW__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "SENDFLOW__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Skip NATS ingestion workers (decision-API-only mode)
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sendflow=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("SendFlow starting up");

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

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        partitions = config.nats.partitions,
        "Configuration loaded"
    );

    // Gateways, each with startup retry.
    let event_store: Arc<dyn EventStore> = Arc::new(
        connect_with_retry("ClickHouse events", || {
            ClickHouseEventStore::new(&config.clickhouse)
        })
        .await?,
    );
    let identity_store: Arc<dyn IdentityStore> = Arc::new(
        connect_with_retry("ClickHouse identity", || {
            ClickHouseIdentityStore::new(&config.clickhouse)
        })
        .await?,
    );
    let cache = Arc::new(connect_with_retry("Redis", || FeatureCache::new(&config.redis)).await?);

    // Core engines.
    let resolver = Arc::new(IdentityResolver::new(
        identity_store,
        config.identity.clone(),
    ));
    let latency_predictor = Arc::new(HeuristicLatencyPredictor::new(
        config.decision.default_latency_seconds,
    ));
    let features = Arc::new(FeatureEngine::new(
        event_store.clone(),
        cache.clone(),
        config.features.clone(),
    ));
    let engine = Arc::new(TimingDecisionEngine::new(
        features,
        event_store.clone(),
        latency_predictor.clone(),
        Arc::new(HeuristicSignalWeightPredictor::new()),
        config.decision.clone(),
    ));

    // Ingestion workers (unless API-only mode).
    if !cli.api_only {
        let processor = Arc::new(
            IngestProcessor::new(resolver.clone(), event_store.clone())
                .with_latency_observer(latency_predictor.clone()),
        );
        let mut manager = IngestManager::new(
            config.nats.clone(),
            config.ingestion.clone(),
            config.node_id.clone(),
            processor,
        );
        match manager.start().await {
            Ok(()) => info!(
                workers = config.nats.partitions,
                "ingestion pipeline started"
            ),
            Err(e) => {
                error!(error = %e, "Failed to start ingestion, running in API-only mode");
            }
        }
    } else {
        info!("Running in API-only mode (no ingestion workers)");
    }

    // Cache maintenance task.
    let cache_for_maintenance = cache.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            cache_for_maintenance.maintenance().await;
        }
    });

    // API server and metrics exporter.
    let state = AppState {
        resolver,
        engine,
        node_id: config.node_id.clone(),
        start_time: Instant::now(),
    };
    let api_server = ApiServer::new(config.clone(), state);
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("SendFlow is ready to serve traffic");

    // Graceful shutdown: SIGTERM/SIGINT.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT, shutting down");
        }
    };

    let addr = std::net::SocketAddr::new(config.api.host.parse()?, config.api.http_port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Starting HTTP server");
    axum::serve(listener, api_server.into_router())
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("SendFlow shut down cleanly");
    Ok(())
}

/// Connect to an external service with exponential backoff (3 attempts).
async fn connect_with_retry<T, F, Fut>(service_name: &str, connect_fn: F) -> anyhow::Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let delays = [
        std::time::Duration::from_secs(0),
        std::time::Duration::from_secs(2),
        std::time::Duration::from_secs(4),
    ];
    let mut last_err = None;
    for (attempt, delay) in delays.iter().enumerate() {
        if attempt > 0 {
            warn!(service = service_name, attempt, "Retrying connection after {}s", delay.as_secs());
            tokio::time::sleep(*delay).await;
        }
        match connect_fn().await {
            Ok(conn) => {
                info!(service = service_name, "Connected successfully");
                return Ok(conn);
            }
            Err(e) => {
                error!(service = service_name, attempt, error = %e, "Connection failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} connection failed", service_name)))
}
