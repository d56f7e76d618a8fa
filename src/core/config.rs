//! # Configuration Module
//!
//! This module holds the configuration surface of the gateway: listen address,
//! registry endpoint, refresh and probe cadence, retry count and downstream timeouts.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Human-readable durations (`"30s"`, `"2s"`) through `humantime-serde`
//! - Environment variable overrides (`GATEWAY_<SECTION>_<FIELD>`)
//! - Validation that reports every problem at once
//!
//! Every section and field has a default, so an empty file (or no file at all)
//! yields a working configuration pointing at a local Eureka server.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{RegistrationInfo, ServiceName};

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP ingress settings
    pub server: ServerConfig,

    /// Service registry settings
    pub registry: RegistryConfig,

    /// Active liveness probing of cached instances
    pub health_probe: HealthProbeConfig,

    /// Downstream forwarding timeouts and retries
    pub proxy: ProxyConfig,

    /// Log level and output format
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML or JSON file
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as YAML.
    /// Environment overrides are applied before validation.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let mut config: GatewayConfig = if is_json {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, falling back to defaults if it does not exist
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Self::load_from_file(path).await;
        }

        let mut config = GatewayConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    /// For example: GATEWAY_SERVER_PORT=8080
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    ///
    /// `apply_env_overrides` is this function reading the process environment.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Server configuration overrides
        if let Some(addr) = lookup("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        if let Some(port) = parse_var(&lookup, "GATEWAY_SERVER_PORT")? {
            self.server.port = port;
        }

        // Registry configuration overrides
        if let Some(kind) = parse_var(&lookup, "GATEWAY_REGISTRY_KIND")? {
            self.registry.kind = kind;
        }
        if let Some(url) = lookup("GATEWAY_REGISTRY_URL") {
            self.registry.url = url;
        }
        if let Some(interval) = duration_var(&lookup, "GATEWAY_REGISTRY_REFRESH_INTERVAL")? {
            self.registry.refresh_interval = interval;
        }
        if let Some(timeout) = duration_var(&lookup, "GATEWAY_REGISTRY_REQUEST_TIMEOUT")? {
            self.registry.request_timeout = timeout;
        }
        if let Some(cycles) = parse_var(&lookup, "GATEWAY_REGISTRY_EVICTION_CYCLES")? {
            self.registry.eviction_cycles = cycles;
        }
        if let Some(prefer_ip) = parse_var(&lookup, "GATEWAY_REGISTRY_PREFER_IP_ADDRESS")? {
            self.registry.prefer_ip_address = prefer_ip;
        }

        // Health probe overrides
        if let Some(enabled) = parse_var(&lookup, "GATEWAY_HEALTH_PROBE_ENABLED")? {
            self.health_probe.enabled = enabled;
        }
        if let Some(kind) = parse_var(&lookup, "GATEWAY_HEALTH_PROBE_KIND")? {
            self.health_probe.kind = kind;
        }
        if let Some(path) = lookup("GATEWAY_HEALTH_PROBE_PATH") {
            self.health_probe.path = path;
        }
        if let Some(interval) = duration_var(&lookup, "GATEWAY_HEALTH_PROBE_INTERVAL")? {
            self.health_probe.interval = interval;
        }
        if let Some(timeout) = duration_var(&lookup, "GATEWAY_HEALTH_PROBE_TIMEOUT")? {
            self.health_probe.timeout = timeout;
        }
        if let Some(threshold) = parse_var(&lookup, "GATEWAY_HEALTH_PROBE_FAILURE_THRESHOLD")? {
            self.health_probe.failure_threshold = threshold;
        }

        // Proxy overrides
        if let Some(timeout) = duration_var(&lookup, "GATEWAY_PROXY_CONNECT_TIMEOUT")? {
            self.proxy.connect_timeout = timeout;
        }
        if let Some(timeout) = duration_var(&lookup, "GATEWAY_PROXY_OVERALL_TIMEOUT")? {
            self.proxy.overall_timeout = timeout;
        }
        if let Some(retries) = parse_var(&lookup, "GATEWAY_PROXY_MAX_RETRIES")? {
            self.proxy.max_retries = retries;
        }

        // Logging configuration overrides
        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("server.bind_address cannot be empty".to_string());
        }

        // Registry
        match self.registry.kind {
            RegistryKind::Eureka => {
                if let Err(e) = Url::parse(&self.registry.url) {
                    errors.push(format!("registry.url '{}' is invalid: {}", self.registry.url, e));
                }
            }
            RegistryKind::Static => {}
        }
        if self.registry.refresh_interval.is_zero() {
            errors.push("registry.refresh_interval must be greater than 0".to_string());
        }
        if self.registry.request_timeout.is_zero() {
            errors.push("registry.request_timeout must be greater than 0".to_string());
        }
        if self.registry.eviction_cycles == 0 {
            errors.push("registry.eviction_cycles must be greater than 0".to_string());
        }
        for (name, endpoints) in &self.registry.static_services {
            if ServiceName::parse(name).is_none() {
                errors.push(format!("registry.static_services: invalid service name '{}'", name));
            }
            for endpoint in endpoints {
                if parse_host_port(endpoint).is_none() {
                    errors.push(format!(
                        "registry.static_services: endpoint '{}' of '{}' is not host:port",
                        endpoint, name
                    ));
                }
            }
        }
        if let Some(ref registration) = self.registry.self_registration {
            if ServiceName::parse(&registration.app_name).is_none() {
                errors.push(format!(
                    "registry.self_registration.app_name '{}' is not a valid service name",
                    registration.app_name
                ));
            }
            if registration.host.is_empty() {
                errors.push("registry.self_registration.host cannot be empty".to_string());
            }
            if registration.heartbeat_interval.is_zero() {
                errors.push("registry.self_registration.heartbeat_interval must be greater than 0".to_string());
            }
        }

        // Health probe
        if self.health_probe.interval.is_zero() {
            errors.push("health_probe.interval must be greater than 0".to_string());
        }
        if self.health_probe.timeout.is_zero() {
            errors.push("health_probe.timeout must be greater than 0".to_string());
        }
        if self.health_probe.failure_threshold == 0 {
            errors.push("health_probe.failure_threshold must be greater than 0".to_string());
        }
        if self.health_probe.kind == ProbeKind::Http && !self.health_probe.path.starts_with('/') {
            errors.push(format!("health_probe.path '{}' must start with '/'", self.health_probe.path));
        }

        // Proxy
        if self.proxy.connect_timeout.is_zero() {
            errors.push("proxy.connect_timeout must be greater than 0".to_string());
        }
        if self.proxy.overall_timeout.is_zero() {
            errors.push("proxy.overall_timeout must be greater than 0".to_string());
        }

        // Logging
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!("Invalid log level: {}", self.logging.level)),
        }
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => errors.push(format!("Invalid log format: {}", self.logging.format)),
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,

    /// HTTP port
    pub port: u16,
}

impl ServerConfig {
    /// `bind_address:port` string handed to the listener
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Which registry backend to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// Eureka-compatible REST registry
    Eureka,
    /// Instances listed in `static_services`
    Static,
}

impl FromStr for RegistryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eureka" => Ok(Self::Eureka),
            "static" => Ok(Self::Static),
            other => Err(format!("unknown registry kind '{}'", other)),
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry backend
    pub kind: RegistryKind,

    /// Base URL of the registry REST API
    pub url: String,

    /// How often the instance table is refreshed
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Timeout for a single registry call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Consecutive refreshes a service may be missing and still be kept (marked down)
    pub eviction_cycles: u32,

    /// Dial instances by IP address instead of host name
    pub prefer_ip_address: bool,

    /// Fixed instances per service, as `host:port` strings
    pub static_services: BTreeMap<String, Vec<String>>,

    /// Register the gateway itself with the registry
    pub self_registration: Option<SelfRegistrationConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::Eureka,
            url: "http://localhost:8761/eureka".to_string(),
            refresh_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            eviction_cycles: 3,
            prefer_ip_address: false,
            static_services: BTreeMap::new(),
            self_registration: None,
        }
    }
}

/// Self-registration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfRegistrationConfig {
    /// Service name the gateway registers under
    pub app_name: String,

    /// Instance id; derived from host, app name and port when absent
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Host advertised to other services
    #[serde(default = "default_registration_host")]
    pub host: String,

    /// Advertised port; the listen port when absent
    #[serde(default)]
    pub port: Option<u16>,

    /// Heartbeat cadence
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
}

impl SelfRegistrationConfig {
    /// Build the registration record for the gateway listening on `listen_port`
    pub fn registration_info(&self, listen_port: u16) -> GatewayResult<RegistrationInfo> {
        let app_name = ServiceName::parse(&self.app_name).ok_or_else(|| {
            GatewayError::config(format!("invalid self-registration app_name '{}'", self.app_name))
        })?;
        let port = self.port.unwrap_or(listen_port);
        let instance_id = self
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}:{}", self.host, app_name, port));

        Ok(RegistrationInfo {
            app_name,
            instance_id,
            host: self.host.clone(),
            port,
        })
    }
}

fn default_registration_host() -> String {
    "localhost".to_string()
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

/// Liveness probe flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// HTTP GET against the probe path
    Http,
    /// Plain TCP connect
    Tcp,
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "tcp" => Ok(Self::Tcp),
            other => Err(format!("unknown probe kind '{}'", other)),
        }
    }
}

/// Health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthProbeConfig {
    /// Whether the prober runs at all
    pub enabled: bool,

    /// Probe flavour
    pub kind: ProbeKind,

    /// Path requested by HTTP probes
    pub path: String,

    /// Time between probe rounds
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout of a single probe
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive failures before an instance is demoted
    pub failure_threshold: u32,
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ProbeKind::Http,
            path: "/health".to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

/// Proxy forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// TCP connect timeout per attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Deadline for the whole exchange, response body included
    #[serde(with = "humantime_serde")]
    pub overall_timeout: Duration,

    /// Additional attempts on a different instance
    pub max_retries: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            overall_timeout: Duration::from_secs(30),
            max_retries: 1,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Split a `host:port` string
///
/// Returns `None` when the host is empty or the port is not a valid `u16`.
pub fn parse_host_port(raw: &str) -> Option<(String, u16)> {
    let (host, port) = raw.trim().rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

fn parse_var<T, F>(lookup: &F, key: &str) -> GatewayResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| GatewayError::config(format!("Invalid {}: {}", key, e))),
        None => Ok(None),
    }
}

fn duration_var<F>(lookup: &F, key: &str) -> GatewayResult<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| GatewayError::config(format!("Invalid {}: {}", key, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config_validation() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.registry.refresh_interval, Duration::from_secs(30));
        assert_eq!(config.registry.eviction_cycles, 3);
        assert_eq!(config.health_probe.interval, Duration::from_secs(10));
        assert_eq!(config.health_probe.timeout, Duration::from_secs(2));
        assert_eq!(config.health_probe.failure_threshold, 3);
        assert_eq!(config.proxy.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.proxy.overall_timeout, Duration::from_secs(30));
        assert_eq!(config.proxy.max_retries, 1);
    }

    #[test]
    fn test_config_serialization_yaml() {
        let config = GatewayConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: GatewayConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.server.port, deserialized.server.port);
        assert_eq!(config.registry.url, deserialized.registry.url);
        assert_eq!(config.proxy.overall_timeout, deserialized.proxy.overall_timeout);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
server:
  port: 9000
proxy:
  max_retries: 2
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.proxy.max_retries, 2);
        assert_eq!(config.proxy.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.registry.kind, RegistryKind::Eureka);
    }

    #[tokio::test]
    async fn test_load_config_from_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.yaml");

        let config_content = r#"
server:
  bind_address: "127.0.0.1"
  port: 9080
registry:
  kind: static
  refresh_interval: "15s"
  eviction_cycles: 5
  static_services:
    inventory-service: ["host1:8081", "host2:8081"]
  self_registration:
    app_name: api-gateway
    host: gateway.local
health_probe:
  kind: tcp
  interval: "5s"
  timeout: "500ms"
proxy:
  connect_timeout: "1s"
  overall_timeout: "10s"
logging:
  level: debug
  format: pretty
"#;
        tokio::fs::write(&config_path, config_content).await.unwrap();

        let config = GatewayConfig::load_from_file(&config_path).await.unwrap();
        assert_eq!(config.server.listen_address(), "127.0.0.1:9080");
        assert_eq!(config.registry.kind, RegistryKind::Static);
        assert_eq!(config.registry.refresh_interval, Duration::from_secs(15));
        assert_eq!(config.registry.eviction_cycles, 5);
        assert_eq!(config.registry.static_services["inventory-service"].len(), 2);
        assert_eq!(config.health_probe.kind, ProbeKind::Tcp);
        assert_eq!(config.health_probe.timeout, Duration::from_millis(500));
        assert_eq!(config.proxy.overall_timeout, Duration::from_secs(10));
        assert_eq!(config.logging.format, "pretty");

        let registration = config.registry.self_registration.as_ref().unwrap();
        assert_eq!(registration.heartbeat_interval, Duration::from_secs(30));
        let info = registration.registration_info(config.server.port).unwrap();
        assert_eq!(info.app_name.as_str(), "api-gateway");
        assert_eq!(info.port, 9080);
        assert_eq!(info.instance_id, "gateway.local:api-gateway:9080");
    }

    #[tokio::test]
    async fn test_load_config_from_json_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.json");
        tokio::fs::write(&config_path, r#"{"server": {"port": 7070}}"#)
            .await
            .unwrap();

        let config = GatewayConfig::load_from_file(&config_path).await.unwrap();
        assert_eq!(config.server.port, 7070);
    }

    #[tokio::test]
    async fn test_load_or_default_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = GatewayConfig::load_or_default(temp_dir.path().join("absent.yaml"))
            .await
            .unwrap();
        assert_eq!(config.registry.url, "http://localhost:8761/eureka");
    }

    #[tokio::test]
    async fn test_load_reports_parse_errors_by_format() {
        let temp_dir = TempDir::new().unwrap();

        let yaml_path = temp_dir.path().join("gateway.yaml");
        tokio::fs::write(&yaml_path, "server:\n  port: [not, a, port]\n")
            .await
            .unwrap();
        let err = GatewayConfig::load_from_file(&yaml_path).await.unwrap_err();
        assert!(matches!(err, GatewayError::Yaml { .. }));
        assert_eq!(err.error_type(), "yaml_error");

        let json_path = temp_dir.path().join("gateway.json");
        tokio::fs::write(&json_path, r#"{"server": {"port": "#)
            .await
            .unwrap();
        let err = GatewayConfig::load_from_file(&json_path).await.unwrap_err();
        assert!(matches!(err, GatewayError::Json { .. }));
        assert_eq!(err.error_type(), "json_error");
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.yaml");
        tokio::fs::write(&config_path, "health_probe:\n  failure_threshold: 0\n")
            .await
            .unwrap();

        let err = GatewayConfig::load_from_file(&config_path).await.unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));
    }

    #[test]
    fn test_overrides() {
        let mut config = GatewayConfig::default();
        config
            .apply_overrides_from(lookup_from(&[
                ("GATEWAY_SERVER_PORT", "9999"),
                ("GATEWAY_REGISTRY_URL", "http://registry:8761/eureka"),
                ("GATEWAY_REGISTRY_REFRESH_INTERVAL", "1m"),
                ("GATEWAY_REGISTRY_KIND", "static"),
                ("GATEWAY_HEALTH_PROBE_ENABLED", "false"),
                ("GATEWAY_PROXY_MAX_RETRIES", "3"),
                ("GATEWAY_PROXY_CONNECT_TIMEOUT", "250ms"),
                ("GATEWAY_LOG_LEVEL", "debug"),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 9999);
        assert_eq!(config.registry.url, "http://registry:8761/eureka");
        assert_eq!(config.registry.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.registry.kind, RegistryKind::Static);
        assert!(!config.health_probe.enabled);
        assert_eq!(config.proxy.max_retries, 3);
        assert_eq!(config.proxy.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_overrides() {
        let mut config = GatewayConfig::default();
        let result = config.apply_overrides_from(lookup_from(&[("GATEWAY_SERVER_PORT", "invalid_port")]));
        assert!(result.unwrap_err().to_string().contains("Invalid GATEWAY_SERVER_PORT"));

        let result =
            config.apply_overrides_from(lookup_from(&[("GATEWAY_PROXY_OVERALL_TIMEOUT", "soon")]));
        assert!(result.unwrap_err().to_string().contains("GATEWAY_PROXY_OVERALL_TIMEOUT"));
    }

    #[test]
    fn test_config_validation_errors() {
        let mut config = GatewayConfig::default();
        config.registry.url = "not a url".to_string();
        config.registry.refresh_interval = Duration::ZERO;
        config.health_probe.failure_threshold = 0;
        config.proxy.overall_timeout = Duration::ZERO;
        config.logging.format = "xml".to_string();
        config
            .registry
            .static_services
            .insert("Bad_Name".to_string(), vec!["host1".to_string()]);

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("registry.url"));
        assert!(message.contains("refresh_interval"));
        assert!(message.contains("failure_threshold"));
        assert!(message.contains("overall_timeout"));
        assert!(message.contains("Invalid log format"));
        assert!(message.contains("invalid service name 'Bad_Name'"));
        assert!(message.contains("not host:port"));
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("host1:8081"), Some(("host1".to_string(), 8081)));
        assert_eq!(parse_host_port("10.0.0.5:80"), Some(("10.0.0.5".to_string(), 80)));
        assert!(parse_host_port("host1").is_none());
        assert!(parse_host_port(":8081").is_none());
        assert!(parse_host_port("host1:99999").is_none());
    }
}
