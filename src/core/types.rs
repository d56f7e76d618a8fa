//! # Core Types Module
//!
//! This module defines the data structures shared by every component of the routing
//! engine: service names, instance endpoints, versioned snapshots and per-request
//! routing decisions.
//!
//! ## Rust Ownership Concepts in This Module
//!
//! - `ServiceSnapshot` is immutable once built and shared as `Arc<ServiceSnapshot>`,
//!   so readers never see a collection that is changing underneath them
//! - `ServiceName` is a newtype: the only way to obtain one is through `parse`,
//!   which means every value in circulation is already normalized
//! - `Clone` on `InstanceEndpoint` copies a few small strings, cheap enough to hand
//!   a chosen instance to the forwarder by value

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized service identifier
///
/// Always lower-case, non-empty and made of `[a-z0-9-]` only. Registries treat
/// service identity case-insensitively, so `INVENTORY-SERVICE` and
/// `inventory-service` parse to the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    /// Normalize and validate a raw service name
    ///
    /// Returns `None` when the lower-cased input is empty or contains characters
    /// outside `[a-z0-9-]`.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return None;
        }
        if !normalized
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return None;
        }
        Some(Self(normalized))
    }

    /// Get the name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ServiceName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid service name '{}'", value))
    }
}

impl From<ServiceName> for String {
    fn from(name: ServiceName) -> Self {
        name.0
    }
}

/// Liveness status of a single instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    /// Instance is known to be serving
    Up,
    /// Instance must not receive traffic
    Down,
    /// Nothing has confirmed or refuted liveness yet
    Unknown,
}

impl InstanceStatus {
    /// Map a registry status string onto an instance status
    ///
    /// `STARTING` and `OUT_OF_SERVICE` instances must not take traffic either,
    /// so they count as down.
    pub fn from_registry(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "UP" => Self::Up,
            "DOWN" | "OUT_OF_SERVICE" | "STARTING" => Self::Down,
            _ => Self::Unknown,
        }
    }

    /// Whether an instance in this status may be selected by the load balancer
    pub fn is_routable(self) -> bool {
        !matches!(self, Self::Down)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Up => write!(f, "UP"),
            InstanceStatus::Down => write!(f, "DOWN"),
            InstanceStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One addressable copy of a backend service
///
/// Owned by the instance table. Other components hold clones and submit
/// updates; they never mutate the table's copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEndpoint {
    /// Registry-assigned instance identifier, unique within a service
    pub instance_id: String,

    /// Host name or IP address
    pub host: String,

    /// TCP port
    pub port: u16,

    /// Current liveness status
    pub status: InstanceStatus,

    /// When the registry last reported this instance
    pub last_seen: DateTime<Utc>,
}

impl InstanceEndpoint {
    /// Create a new endpoint observed now
    pub fn new<I: Into<String>, H: Into<String>>(
        instance_id: I,
        host: H,
        port: u16,
        status: InstanceStatus,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            status,
            last_seen: Utc::now(),
        }
    }

    /// `host:port` authority used for dialing and the `Host` header
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether this endpoint may be selected by the load balancer
    pub fn is_routable(&self) -> bool {
        self.status.is_routable()
    }

    /// Compare everything except the observation timestamp
    pub fn same_state(&self, other: &InstanceEndpoint) -> bool {
        self.instance_id == other.instance_id
            && self.host == other.host
            && self.port == other.port
            && self.status == other.status
    }
}

/// Immutable, versioned view of one service's instances
///
/// Carries every instance the table still retains, including demoted ones;
/// `routable()` is the subset the load balancer may choose from.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    /// Service this snapshot belongs to
    pub service: ServiceName,

    /// Monotonically increasing version, bumped on every material change
    pub version: u64,

    /// Instances in stable first-seen order
    pub instances: Vec<InstanceEndpoint>,

    /// When this snapshot was committed
    pub committed_at: DateTime<Utc>,
}

impl ServiceSnapshot {
    /// Create a new snapshot
    pub fn new(service: ServiceName, version: u64, instances: Vec<InstanceEndpoint>) -> Self {
        Self {
            service,
            version,
            instances,
            committed_at: Utc::now(),
        }
    }

    /// Instances that may receive traffic, in table order
    pub fn routable(&self) -> impl Iterator<Item = &InstanceEndpoint> {
        self.instances.iter().filter(|instance| instance.is_routable())
    }

    /// Number of instances that may receive traffic
    pub fn routable_count(&self) -> usize {
        self.routable().count()
    }

    /// Find an instance by id
    pub fn instance(&self, instance_id: &str) -> Option<&InstanceEndpoint> {
        self.instances.iter().find(|i| i.instance_id == instance_id)
    }

    /// Whether the snapshot holds no instances at all
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Total number of retained instances
    pub fn len(&self) -> usize {
        self.instances.len()
    }
}

/// Per-request routing decision
///
/// Created when an instance is chosen for an attempt and dropped when that
/// attempt completes or is abandoned.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Target service
    pub service: ServiceName,

    /// Instance chosen for this attempt
    pub instance: InstanceEndpoint,

    /// Zero-based attempt number (0 = first try)
    pub attempt: u32,
}

impl RouteDecision {
    /// Create a new routing decision
    pub fn new(service: ServiceName, instance: InstanceEndpoint, attempt: u32) -> Self {
        Self {
            service,
            instance,
            attempt,
        }
    }

    /// Whether this decision is a retry of an earlier attempt
    pub fn is_retry(&self) -> bool {
        self.attempt > 0
    }
}

/// How the gateway describes itself when registering with the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    /// Service name the gateway registers under
    pub app_name: ServiceName,

    /// Unique id of this gateway process
    pub instance_id: String,

    /// Host other services should use to reach the gateway
    pub host: String,

    /// Port the gateway listens on
    pub port: u16,
}
