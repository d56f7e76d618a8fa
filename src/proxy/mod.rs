//! # Proxy Module
//!
//! Outbound side of the gateway: per-request forwarding with bounded retries on
//! a different instance, and the streaming response body relayed to the client.

pub mod body;
pub mod forwarder;

pub use body::DeadlineBody;
pub use forwarder::ProxyForwarder;
