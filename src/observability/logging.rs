//! # Structured Logging
//!
//! Sets up the global `tracing` subscriber: an `EnvFilter` that honours `RUST_LOG`
//! (falling back to the configured level) and a `fmt` layer emitting either JSON
//! lines or human-readable output.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::core::config::LoggingConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Build the filter used by the subscriber
///
/// `RUST_LOG` wins when set. Otherwise the gateway's own crate logs at the
/// configured level and `tower_http` request traces at the same level.
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config.level.to_lowercase();
        EnvFilter::new(format!("discovery_gateway={level},tower_http={level},warn"))
    })
}

/// Install the global tracing subscriber
///
/// Fails if a global subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> GatewayResult<()> {
    let filter = build_filter(config);

    let fmt_layer = match config.format.to_lowercase().as_str() {
        "pretty" => fmt::layer().with_target(true).pretty().boxed(),
        _ => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .map_err(|e| GatewayError::internal(format!("Failed to initialize logging: {}", e)))
}
