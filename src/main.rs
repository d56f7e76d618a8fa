//! # Discovery Gateway - Main Entry Point
//!
//! Loads configuration, installs logging, connects to the registry and runs the
//! gateway until SIGINT or SIGTERM.
//!
//! Configuration is read from `GATEWAY_CONFIG_PATH` (default `config/gateway.yaml`);
//! a missing file means defaults plus `GATEWAY_*` environment overrides.

use tokio::signal;
use tracing::{error, info};

use discovery_gateway::core::error::GatewayError;
use discovery_gateway::observability::init_tracing;
use discovery_gateway::{create_registry, GatewayConfig, GatewayResult, GatewayServer};

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let config_path = std::env::var("GATEWAY_CONFIG_PATH")
        .unwrap_or_else(|_| "config/gateway.yaml".to_string());

    let config = GatewayConfig::load_or_default(&config_path).await?;
    init_tracing(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %config_path,
        registry = ?config.registry.kind,
        "Starting discovery gateway"
    );

    let registry = create_registry(&config.registry).map_err(|e| {
        error!(error = %e, "Failed to create registry backend");
        e
    })?;

    let server = GatewayServer::new(config, registry)?;
    let shutdown = server.shutdown_token();

    let mut server_handle = tokio::spawn(server.start());

    tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            info!("Shutdown signal received, draining in-flight requests");
            shutdown.cancel();
            match server_handle.await {
                Ok(result) => result?,
                Err(e) => return Err(GatewayError::internal(format!("Server task failed: {}", e))),
            }
        }
        result = &mut server_handle => {
            match result {
                Ok(result) => result?,
                Err(e) => return Err(GatewayError::internal(format!("Server task failed: {}", e))),
            }
        }
    }

    info!("Discovery gateway shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() -> GatewayResult<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| GatewayError::internal(format!("Failed to install SIGTERM handler: {}", e)))?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .map_err(|e| GatewayError::internal(format!("Failed to install SIGINT handler: {}", e)))?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}
