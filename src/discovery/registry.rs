//! # Service Registry Backends
//!
//! The gateway consumes an external service registry through the narrow `Registry`
//! trait: register itself, send heartbeats, list services and list the instances of
//! one service. Two backends implement it.
//!
//! - `EurekaRegistry` speaks the Eureka REST dialect over HTTP with `reqwest`
//! - `StaticRegistry` serves instances listed in configuration, and doubles as an
//!   in-memory registry for tests
//!
//! ## Rust Concepts Used
//!
//! - `async_trait` for async methods in a trait object (`Arc<dyn Registry>`)
//! - `#[serde(untagged)]` to accept a JSON field that is either one object or an array
//! - `DashMap` for interior mutability of the static backend

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::{parse_host_port, RegistryConfig, RegistryKind};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{InstanceEndpoint, InstanceStatus, RegistrationInfo, ServiceName};

/// Outcome of a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The registry renewed the lease
    Renewed,
    /// The registry does not know this instance; it must register again
    UnknownInstance,
}

/// Interface to the external service registry
///
/// Every call may fail with `RegistryUnavailable`; callers treat that as degraded,
/// never fatal.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Register the gateway itself
    async fn register(&self, instance: &RegistrationInfo) -> GatewayResult<()>;

    /// Renew the gateway's registration
    async fn heartbeat(&self, instance: &RegistrationInfo) -> GatewayResult<HeartbeatOutcome>;

    /// Instances currently registered for one service
    async fn list_instances(&self, service: &ServiceName) -> GatewayResult<Vec<InstanceEndpoint>>;

    /// Every service the registry knows
    async fn list_all_services(&self) -> GatewayResult<Vec<ServiceName>>;

    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;
}

/// Create a registry backend from configuration
pub fn create_registry(config: &RegistryConfig) -> GatewayResult<Arc<dyn Registry>> {
    match config.kind {
        RegistryKind::Eureka => {
            let registry =
                EurekaRegistry::new(&config.url, config.request_timeout, config.prefer_ip_address)?;
            Ok(Arc::new(registry))
        }
        RegistryKind::Static => Ok(Arc::new(StaticRegistry::from_config(&config.static_services)?)),
    }
}

// ---------------------------------------------------------------------------
// Eureka
// ---------------------------------------------------------------------------

/// A JSON value that Eureka sends either as a single object or as an array
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EurekaApplicationsResponse {
    applications: EurekaApplications,
}

#[derive(Debug, Deserialize)]
struct EurekaApplications {
    #[serde(default)]
    application: OneOrMany<EurekaApplication>,
}

#[derive(Debug, Deserialize)]
struct EurekaApplicationResponse {
    application: EurekaApplication,
}

#[derive(Debug, Deserialize)]
struct EurekaApplication {
    name: String,
    #[serde(default)]
    instance: OneOrMany<EurekaInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EurekaInstance {
    #[serde(default)]
    instance_id: Option<String>,
    host_name: String,
    #[serde(default)]
    ip_addr: Option<String>,
    #[serde(default)]
    status: Option<String>,
    port: EurekaPort,
}

#[derive(Debug, Deserialize)]
struct EurekaPort {
    #[serde(rename = "$")]
    number: u16,
    #[serde(rename = "@enabled", default)]
    enabled: Option<String>,
}

impl EurekaInstance {
    fn into_endpoint(self, prefer_ip_address: bool) -> Option<InstanceEndpoint> {
        if self.port.enabled.as_deref() == Some("false") {
            return None;
        }

        let host = match self.ip_addr {
            Some(ip) if prefer_ip_address && !ip.is_empty() => ip,
            _ => self.host_name,
        };
        if host.is_empty() {
            return None;
        }

        let instance_id = self
            .instance_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{}:{}", host, self.port.number));
        let status = self
            .status
            .as_deref()
            .map(InstanceStatus::from_registry)
            .unwrap_or(InstanceStatus::Unknown);

        Some(InstanceEndpoint::new(instance_id, host, self.port.number, status))
    }
}

/// Eureka-compatible REST registry client
pub struct EurekaRegistry {
    client: reqwest::Client,
    base_url: String,
    prefer_ip_address: bool,
}

impl EurekaRegistry {
    /// Create a client for the registry rooted at `base_url` (e.g. `http://localhost:8761/eureka`)
    pub fn new(base_url: &str, request_timeout: Duration, prefer_ip_address: bool) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to build registry client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            prefer_ip_address,
        })
    }

    fn app_url(&self, app: &ServiceName) -> String {
        format!("{}/apps/{}", self.base_url, app.as_str().to_ascii_uppercase())
    }

    fn unavailable(context: &str, err: impl std::fmt::Display) -> GatewayError {
        GatewayError::registry_unavailable(format!("{}: {}", context, err))
    }
}

#[async_trait]
impl Registry for EurekaRegistry {
    async fn register(&self, instance: &RegistrationInfo) -> GatewayResult<()> {
        let app = instance.app_name.as_str().to_ascii_uppercase();
        let body = json!({
            "instance": {
                "instanceId": instance.instance_id,
                "hostName": instance.host,
                "app": app,
                "ipAddr": instance.host,
                "vipAddress": instance.app_name.as_str(),
                "status": "UP",
                "port": { "$": instance.port, "@enabled": "true" },
                "dataCenterInfo": {
                    "@class": "com.netflix.appinfo.InstanceInfo$DefaultDataCenterInfo",
                    "name": "MyOwn"
                }
            }
        });

        let response = self
            .client
            .post(self.app_url(&instance.app_name))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::unavailable("register request failed", e))?;

        if !response.status().is_success() {
            return Err(Self::unavailable("register rejected", response.status()));
        }

        debug!(app = %instance.app_name, instance_id = %instance.instance_id, "Registered with Eureka");
        Ok(())
    }

    async fn heartbeat(&self, instance: &RegistrationInfo) -> GatewayResult<HeartbeatOutcome> {
        let url = format!("{}/{}", self.app_url(&instance.app_name), instance.instance_id);
        let response = self
            .client
            .put(url)
            .send()
            .await
            .map_err(|e| Self::unavailable("heartbeat request failed", e))?;

        match response.status() {
            status if status.is_success() => Ok(HeartbeatOutcome::Renewed),
            StatusCode::NOT_FOUND => Ok(HeartbeatOutcome::UnknownInstance),
            status => Err(Self::unavailable("heartbeat rejected", status)),
        }
    }

    async fn list_instances(&self, service: &ServiceName) -> GatewayResult<Vec<InstanceEndpoint>> {
        let response = self
            .client
            .get(self.app_url(service))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| Self::unavailable("instance query failed", e))?;

        // Eureka answers 404 for an application with no registered instances
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Self::unavailable("instance query rejected", response.status()));
        }

        let body: EurekaApplicationResponse = response
            .json()
            .await
            .map_err(|e| Self::unavailable("invalid instance list", e))?;

        Ok(body
            .application
            .instance
            .into_vec()
            .into_iter()
            .filter_map(|instance| instance.into_endpoint(self.prefer_ip_address))
            .collect())
    }

    async fn list_all_services(&self) -> GatewayResult<Vec<ServiceName>> {
        let response = self
            .client
            .get(format!("{}/apps", self.base_url))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| Self::unavailable("service query failed", e))?;

        if !response.status().is_success() {
            return Err(Self::unavailable("service query rejected", response.status()));
        }

        let body: EurekaApplicationsResponse = response
            .json()
            .await
            .map_err(|e| Self::unavailable("invalid service list", e))?;

        let mut names = Vec::new();
        for application in body.applications.application.into_vec() {
            match ServiceName::parse(&application.name) {
                Some(name) if !names.contains(&name) => names.push(name),
                Some(_) => {}
                None => warn!(name = %application.name, "Skipping registry application with invalid name"),
            }
        }
        Ok(names)
    }

    fn backend_name(&self) -> &'static str {
        "eureka"
    }
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

/// In-memory registry with a fixed (but replaceable) instance list
///
/// Used for fixed deployments and as a controllable registry in tests.
#[derive(Default)]
pub struct StaticRegistry {
    services: DashMap<ServiceName, Vec<InstanceEndpoint>>,
    registrations: DashMap<String, RegistrationInfo>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `service -> ["host:port", ...]`
    pub fn from_config(services: &BTreeMap<String, Vec<String>>) -> GatewayResult<Self> {
        let registry = Self::new();
        for (raw_name, endpoints) in services {
            let name = ServiceName::parse(raw_name)
                .ok_or_else(|| GatewayError::config(format!("invalid service name '{}'", raw_name)))?;

            let mut instances = Vec::with_capacity(endpoints.len());
            for endpoint in endpoints {
                let (host, port) = parse_host_port(endpoint).ok_or_else(|| {
                    GatewayError::config(format!("endpoint '{}' of '{}' is not host:port", endpoint, raw_name))
                })?;
                instances.push(InstanceEndpoint::new(
                    format!("{}:{}", host, port),
                    host,
                    port,
                    InstanceStatus::Up,
                ));
            }
            registry.services.insert(name, instances);
        }
        Ok(registry)
    }

    /// Replace the instance list of one service
    pub fn set_instances(&self, service: ServiceName, instances: Vec<InstanceEndpoint>) {
        self.services.insert(service, instances);
    }

    /// Forget a service entirely
    pub fn remove_service(&self, service: &ServiceName) {
        self.services.remove(service);
    }

    /// Whether an instance id is currently registered
    pub fn is_registered(&self, instance_id: &str) -> bool {
        self.registrations.contains_key(instance_id)
    }

    /// Drop a registration, as if its lease had expired
    pub fn expire_registration(&self, instance_id: &str) {
        self.registrations.remove(instance_id);
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn register(&self, instance: &RegistrationInfo) -> GatewayResult<()> {
        self.registrations
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn heartbeat(&self, instance: &RegistrationInfo) -> GatewayResult<HeartbeatOutcome> {
        if self.registrations.contains_key(&instance.instance_id) {
            Ok(HeartbeatOutcome::Renewed)
        } else {
            Ok(HeartbeatOutcome::UnknownInstance)
        }
    }

    async fn list_instances(&self, service: &ServiceName) -> GatewayResult<Vec<InstanceEndpoint>> {
        Ok(self
            .services
            .get(service)
            .map(|instances| instances.clone())
            .unwrap_or_default())
    }

    async fn list_all_services(&self) -> GatewayResult<Vec<ServiceName>> {
        let mut names: Vec<ServiceName> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn backend_name(&self) -> &'static str {
        "static"
    }
}
