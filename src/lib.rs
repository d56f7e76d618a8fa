//! # Discovery Gateway Library - Core Library Crate
//!
//! A reverse-proxy gateway that routes requests to service instances discovered at
//! runtime from a service registry.
//!
//! ## Request Path
//!
//! 1. The **router** takes the first path segment as the service name and strips it
//! 2. The **load balancer** picks a routable instance round-robin from the current snapshot
//! 3. The **proxy forwarder** streams the request to it, retrying once on a different
//!    instance when the connection fails before a response arrives
//!
//! ## Background Tasks
//!
//! - The **registry client** polls the registry and merges results into the instance table
//! - The **health prober** probes instances and feeds verdicts back into the table
//!
//! The instance table is the only shared mutable structure; readers always see
//! immutable `Arc` snapshots.

/// Core functionality including error types, configuration, and basic data structures
pub mod core;

/// Registry backends, registry client and the instance table
pub mod discovery;

/// Main gateway server implementation and HTTP handling
pub mod gateway;

/// Instance selection over healthy snapshots
pub mod load_balancing;

/// Health probing and structured logging
pub mod observability;

/// Forwarding to downstream instances
pub mod proxy;

/// Service name extraction, path rewriting and forwarding headers
pub mod routing;

pub use core::config::GatewayConfig;
pub use core::error::{GatewayError, GatewayResult};
pub use core::types::{InstanceEndpoint, InstanceStatus, ServiceName, ServiceSnapshot};
pub use discovery::{create_registry, InstanceTable, Registry, RegistryClient};
pub use gateway::GatewayServer;
pub use load_balancing::LoadBalancer;
pub use proxy::ProxyForwarder;
pub use routing::Router;
