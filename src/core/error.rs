//! # Error Handling Module
//!
//! This module provides error handling for the gateway using the `thiserror` crate.
//! It defines every failure the routing engine can hit, from registry outages to
//! downstream connection problems, and maps each one to the HTTP status a client sees.
//!
//! ## Error Taxonomy
//!
//! - `RegistryUnavailable`: transient, logged by the background refresh, never seen by clients
//! - `NoInstances` / `NoHealthyInstances`: service-unavailable, never retried
//! - `DownstreamTimeout` / `DownstreamConnectionRefused`: retried on another instance,
//!   then surfaced as service-unavailable
//! - `MalformedPath`: bad-request, never retried
//! - `PartialResponseFailure`: the client connection is torn down, no synthetic response
//!
//! ## Rust Concepts Used
//!
//! - `Result<T, E>` with the `?` operator for explicit error propagation
//! - `thiserror` derives `Display` and `std::error::Error` from the `#[error]` attributes
//! - `From` implementations let `?` convert library errors automatically
//! - `IntoResponse` lets axum turn an error straight into an HTTP response

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;

/// Main result type used throughout the gateway
///
/// Instead of writing `Result<T, GatewayError>` everywhere, we use `GatewayResult<T>`.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error types for the gateway
///
/// Each variant represents a different category of failure. The `#[error("...")]`
/// attribute from `thiserror` implements `Display` with the specified message.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// The external service registry could not be queried
    #[error("Service registry unavailable: {reason}")]
    RegistryUnavailable { reason: String },

    /// The service is unknown to the gateway or has no instances at all
    #[error("No instances registered for service: {service}")]
    NoInstances { service: String },

    /// The service has instances, but none of them may receive traffic
    #[error("No healthy instances available for service: {service}")]
    NoHealthyInstances { service: String },

    /// The downstream instance did not answer in time
    #[error("Downstream instance {instance} timed out after {timeout_ms}ms")]
    DownstreamTimeout { instance: String, timeout_ms: u64 },

    /// The downstream instance refused or dropped the connection before responding
    #[error("Connection to downstream instance {instance} failed: {reason}")]
    DownstreamConnectionRefused { instance: String, reason: String },

    /// The request path does not name a target service
    #[error("Malformed request path '{path}': {reason}")]
    MalformedPath { path: String, reason: String },

    /// The downstream response failed after bytes were already relayed to the client
    #[error("Response from downstream instance {instance} failed mid-stream: {reason}")]
    PartialResponseFailure { instance: String, reason: String },

    /// Configuration-related errors (invalid config, unreadable files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (socket binding, file operations, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON configuration parsing errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a registry-unavailable error
    pub fn registry_unavailable<S: Into<String>>(reason: S) -> Self {
        Self::RegistryUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a malformed-path error
    pub fn malformed_path<P: Into<String>, R: Into<String>>(path: P, reason: R) -> Self {
        Self::MalformedPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection-refused error for a downstream instance
    pub fn connection_refused<I: Into<String>, R: Into<String>>(instance: I, reason: R) -> Self {
        Self::DownstreamConnectionRefused {
            instance: instance.into(),
            reason: reason.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    ///
    /// Exhausted downstream failures are service-unavailable rather than bad-gateway:
    /// from the client's point of view the service had no instance able to answer.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoInstances { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::NoHealthyInstances { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DownstreamTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DownstreamConnectionRefused { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::RegistryUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::MalformedPath { .. } => StatusCode::BAD_REQUEST,
            Self::PartialResponseFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if the request may be retried on a different instance
    ///
    /// Only failures that happened before any response byte reached the client
    /// qualify. Resolution failures are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DownstreamTimeout { .. } | Self::DownstreamConnectionRefused { .. }
        )
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::RegistryUnavailable { .. } => "registry_unavailable",
            Self::NoInstances { .. } => "no_instances",
            Self::NoHealthyInstances { .. } => "no_healthy_instances",
            Self::DownstreamTimeout { .. } => "downstream_timeout",
            Self::DownstreamConnectionRefused { .. } => "downstream_connection_refused",
            Self::MalformedPath { .. } => "malformed_path",
            Self::PartialResponseFailure { .. } => "partial_response_failure",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

/// Implement conversion from Infallible for handler compatibility
impl From<Infallible> for GatewayError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

/// Implement conversion from std::io::Error
impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_json::Error
impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_yaml::Error
impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Convert `GatewayError` into an HTTP response
///
/// Only failures detected before any downstream bytes were relayed reach this
/// point, so a well-formed JSON body can always be produced.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
