//! # Gateway Module
//!
//! HTTP ingress and the lifecycle of the gateway's background tasks.

pub mod server;

pub use server::GatewayServer;
