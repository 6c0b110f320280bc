#![forbid(unsafe_code)]

mod config;
mod engine;
mod metrics;
mod session;
mod signaling;

use anyhow::Result;
use config::GatewayConfig;
use engine::{LoopbackEngine, MediaEngine};
use metrics::ServerMetrics;
use session::SessionRegistry;
use signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stream_bench=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("stream-bench - Starting gateway");

    let config = GatewayConfig::from_env();

    // The loopback engine stands in for a remote media engine cluster; the
    // orchestration paths are identical either way.
    let engine: Arc<dyn MediaEngine> =
        Arc::new(LoopbackEngine::with_capacity(config.engine_capacity_points));
    let metrics = ServerMetrics::new();
    let registry = Arc::new(SessionRegistry::new(engine, config.bandwidth));

    info!("Session registry and loopback engine initialized");

    let signaling_server = SignalingServer::new(registry.clone(), metrics, &config);
    let port = config.port;

    info!("Starting signaling server on port {}", port);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    info!("Gateway shutdown complete");
    Ok(())
}
