//! # Router Module
//!
//! Maps an inbound request path onto a target service and the path the service
//! should see, then prepares the outbound request head.
//!
//! The first path segment names the service and is matched case-insensitively;
//! it is stripped before forwarding:
//!
//! | Inbound                          | Service             | Downstream path |
//! |----------------------------------|---------------------|-----------------|
//! | `/inventory-service/products`    | `inventory-service` | `/products`     |
//! | `/Inventory-Service/a/b/`        | `inventory-service` | `/a/b/`         |
//! | `/inventory-service`             | `inventory-service` | `/`             |
//! | `/`, `//x`, `/bad_name/x`        | `MalformedPath`     |                 |
//!
//! ## Rust Concepts Used
//!
//! - `split_once` and string slices to parse the path without allocating
//! - `HeaderMap::append` to add forwarding headers without touching existing ones

use axum::http::header::{HeaderName, HeaderValue, HOST};
use axum::http::{HeaderMap, Uri};
use std::net::IpAddr;
use uuid::Uuid;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{InstanceEndpoint, ServiceName};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PREFIX: HeaderName = HeaderName::from_static("x-forwarded-prefix");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Service named by the first path segment
    pub service: ServiceName,

    /// Path with the service segment stripped, always starting with `/`
    pub downstream_path: String,
}

impl RouteTarget {
    /// Origin-form URI for the downstream request, carrying the original query
    pub fn downstream_uri(&self, query: Option<&str>) -> GatewayResult<Uri> {
        let path_and_query = match query {
            Some(query) => format!("{}?{}", self.downstream_path, query),
            None => self.downstream_path.clone(),
        };
        path_and_query
            .parse::<Uri>()
            .map_err(|e| GatewayError::malformed_path(path_and_query.clone(), e.to_string()))
    }
}

/// Request router with a fixed one-segment prefix strip
#[derive(Debug, Clone, Default)]
pub struct Router;

impl Router {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a path to its target service and downstream path
    ///
    /// Never consults the registry; a path without a usable first segment fails
    /// with `MalformedPath` right here.
    pub fn route(&self, path: &str) -> GatewayResult<RouteTarget> {
        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| GatewayError::malformed_path(path, "path must start with '/'"))?;

        let (segment, remainder) = match rest.split_once('/') {
            Some((segment, remainder)) => (segment, Some(remainder)),
            None => (rest, None),
        };

        if segment.is_empty() {
            return Err(GatewayError::malformed_path(path, "missing service segment"));
        }

        let service = ServiceName::parse(segment).ok_or_else(|| {
            GatewayError::malformed_path(path, format!("'{}' is not a valid service name", segment))
        })?;

        let downstream_path = match remainder {
            Some(remainder) => format!("/{}", remainder),
            None => "/".to_string(),
        };

        Ok(RouteTarget {
            service,
            downstream_path,
        })
    }
}

/// Per-request values used to build forwarding headers
#[derive(Debug, Clone)]
pub struct ForwardingContext<'a> {
    pub service: &'a ServiceName,
    pub client_ip: Option<IpAddr>,
    pub request_id: &'a str,
}

/// Request id from the inbound headers, or a fresh one
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(&X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Add the standard proxy headers to an outbound request
///
/// Purely additive: existing client headers are never removed or rewritten,
/// except that the client address is appended to an existing `x-forwarded-for`.
pub fn apply_forwarding_headers(
    headers: &mut HeaderMap,
    instance: &InstanceEndpoint,
    context: &ForwardingContext<'_>,
) {
    if let Some(ip) = context.client_ip {
        if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
            headers.append(X_FORWARDED_FOR, value);
        }
    }

    if !headers.contains_key(&X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    if !headers.contains_key(&X_FORWARDED_HOST) {
        if let Some(host) = headers.get(HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }

    if !headers.contains_key(&X_FORWARDED_PREFIX) {
        if let Ok(prefix) = HeaderValue::from_str(&format!("/{}", context.service)) {
            headers.insert(X_FORWARDED_PREFIX, prefix);
        }
    }

    if !headers.contains_key(&X_REQUEST_ID) {
        if let Ok(id) = HeaderValue::from_str(context.request_id) {
            headers.insert(X_REQUEST_ID, id);
        }
    }

    if !headers.contains_key(HOST) {
        if let Ok(authority) = HeaderValue::from_str(&instance.authority()) {
            headers.insert(HOST, authority);
        }
    }
}
