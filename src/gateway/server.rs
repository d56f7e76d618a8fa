//! # HTTP Server Module
//!
//! Ingress side of the gateway. Owns the instance table and the background tasks
//! that keep it current, and serves three kinds of requests:
//!
//! - `GET /health`: liveness of the gateway process itself
//! - `GET /_gateway/services`: read-only dump of the instance table
//! - everything else: routed by first path segment and forwarded downstream
//!
//! ## Rust Concepts Used
//!
//! - `Arc<T>` for sharing server state across async tasks
//! - `CancellationToken` to stop background loops and drain the listener together
//! - Axum's handler system and `fallback` for the catch-all proxy route
//! - Tower middleware (`TraceLayer`) for per-request spans

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router as AxumRouter,
};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::discovery::{InstanceTable, Registry, RegistryClient};
use crate::load_balancing::LoadBalancer;
use crate::observability::HealthProber;
use crate::proxy::ProxyForwarder;
use crate::routing::Router;

/// State shared by all handlers
#[derive(Clone)]
struct ServerState {
    table: Arc<InstanceTable>,
    forwarder: Arc<ProxyForwarder>,
    started_at: DateTime<Utc>,
}

/// Gateway server with its background tasks
pub struct GatewayServer {
    config: GatewayConfig,
    table: Arc<InstanceTable>,
    registry_client: Arc<RegistryClient>,
    prober: Option<Arc<HealthProber>>,
    forwarder: Arc<ProxyForwarder>,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl GatewayServer {
    /// Wire up the table, registry client, prober and forwarder
    ///
    /// Nothing is spawned and nothing touches the network until [`serve`](Self::serve).
    pub fn new(config: GatewayConfig, registry: Arc<dyn Registry>) -> GatewayResult<Self> {
        let table = Arc::new(InstanceTable::new());

        let registry_client = Arc::new(RegistryClient::new(
            registry,
            table.clone(),
            config.registry.refresh_interval,
            config.registry.eviction_cycles,
        ));

        let prober = if config.health_probe.enabled {
            Some(Arc::new(HealthProber::from_config(
                table.clone(),
                &config.health_probe,
            )?))
        } else {
            None
        };

        let balancer = Arc::new(LoadBalancer::round_robin(table.clone()));
        let forwarder = Arc::new(ProxyForwarder::new(balancer, Router::new(), &config.proxy));

        Ok(Self {
            config,
            table,
            registry_client,
            prober,
            forwarder,
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
        })
    }

    pub fn table(&self) -> &Arc<InstanceTable> {
        &self.table
    }

    pub fn registry_client(&self) -> &Arc<RegistryClient> {
        &self.registry_client
    }

    /// Token that stops the server and its background tasks when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Build the axum application
    pub fn router(&self) -> AxumRouter {
        let state = ServerState {
            table: self.table.clone(),
            forwarder: self.forwarder.clone(),
            started_at: self.started_at,
        };

        AxumRouter::new()
            // Only GET is reserved; other methods reach a service named "health".
            .route("/health", get(health_check).fallback(proxy_request))
            .route("/_gateway/services", get(list_services))
            .fallback(proxy_request)
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown
    #[instrument(skip(self))]
    pub async fn start(self) -> GatewayResult<()> {
        let address = self.config.server.listen_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| GatewayError::internal(format!("Failed to bind gateway server to {}: {}", address, e)))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until the shutdown token fires
    pub async fn serve(self, listener: TcpListener) -> GatewayResult<()> {
        let local_addr = listener.local_addr()?;

        if let Err(e) = self.registry_client.sync().await {
            warn!(error = %e, "Initial registry sync failed, starting with an empty instance table");
        }

        let tasks = self.spawn_background_tasks(local_addr.port()).await?;

        info!(
            address = %local_addr,
            services = self.table.len(),
            probing = self.prober.is_some(),
            "Gateway HTTP server listening"
        );

        let app = self.router();
        let shutdown = self.shutdown.clone();
        let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)));

        self.shutdown.cancel();
        for task in tasks {
            let _ = task.await;
        }
        info!("Gateway HTTP server stopped");

        result
    }

    async fn spawn_background_tasks(&self, listen_port: u16) -> GatewayResult<Vec<JoinHandle<()>>> {
        let mut tasks = vec![self
            .registry_client
            .clone()
            .spawn_refresh_loop(self.shutdown.clone())];

        if let Some(prober) = &self.prober {
            tasks.push(prober.clone().spawn(self.shutdown.clone()));
        }

        if let Some(registration) = &self.config.registry.self_registration {
            let info = registration.registration_info(listen_port)?;
            // Failure is logged by the client; heartbeats re-register later.
            let _ = self.registry_client.register_self(&info).await;
            tasks.push(self.registry_client.clone().spawn_heartbeat_loop(
                info,
                registration.heartbeat_interval,
                self.shutdown.clone(),
            ));
        }

        Ok(tasks)
    }
}

/// Gateway liveness; independent of downstream health
async fn health_check(State(state): State<ServerState>) -> impl IntoResponse {
    let health_info = serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "services": state.table.len(),
        "table_version": state.table.current_version(),
    });

    (StatusCode::OK, Json(health_info))
}

/// Instance table dump
async fn list_services(State(state): State<ServerState>) -> impl IntoResponse {
    let snapshots: Vec<_> = state
        .table
        .snapshots()
        .iter()
        .map(|snapshot| {
            serde_json::json!({
                "service": snapshot.service,
                "version": snapshot.version,
                "committed_at": snapshot.committed_at.to_rfc3339(),
                "routable": snapshot.routable_count(),
                "instances": snapshot.instances,
            })
        })
        .collect();

    Json(serde_json::json!({
        "table_version": state.table.current_version(),
        "services": snapshots,
        "load_balancer": state.forwarder.balancer().stats(),
    }))
}

/// Catch-all handler: route by first path segment and forward
async fn proxy_request(State(state): State<ServerState>, request: Request<Body>) -> Response {
    let start_time = std::time::Instant::now();
    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let response = match state.forwarder.forward(request, client_addr).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };

    counter!("gateway_requests_total", "status" => response.status().as_u16().to_string())
        .increment(1);
    histogram!("gateway_request_duration_seconds").record(start_time.elapsed().as_secs_f64());
    response
}
