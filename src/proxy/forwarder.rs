//! # Proxy Forwarder
//!
//! Relays one inbound request to a service instance and streams the answer back.
//!
//! Each request walks a small state machine:
//!
//! ```text
//! RESOLVING -> FORWARDING -> COMPLETED
//! RESOLVING -> FORWARDING -> RETRYING -> RESOLVING -> FORWARDING -> COMPLETED | FAILED
//! ```
//!
//! - Resolution failures (`NoInstances`, `NoHealthyInstances`) fail at once.
//! - Connect-phase failures never touch the request body and are always retried
//!   on a different instance while attempts remain.
//! - Failures after the body was handed over are retried only for empty bodies.
//! - Once response headers are returned the exchange is committed; later failures
//!   surface through [`DeadlineBody`] as `PartialResponseFailure`.
//!
//! ## Rust Concepts Used
//!
//! - `hyper::client::conn::http1` for a dedicated connection per attempt
//! - `tokio::time::timeout_at` so every await point is bounded by the attempt deadline
//! - `CancellationToken` drop guards to tie the connection task to the request lifetime

use axum::body::Body;
use axum::http::{request::Parts, HeaderValue, Request, Response, Version};
use hyper::body::Body as _;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use metrics::counter;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};

use crate::core::config::ProxyConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RouteDecision;
use crate::load_balancing::LoadBalancer;
use crate::routing::{
    apply_forwarding_headers, request_id, ForwardingContext, RouteTarget, Router, X_REQUEST_ID,
};

use super::body::DeadlineBody;

/// Failure of a single attempt
struct AttemptError {
    error: GatewayError,
    body_consumed: bool,
}

impl AttemptError {
    fn before_send(error: GatewayError) -> Self {
        Self {
            error,
            body_consumed: false,
        }
    }

    fn after_send(error: GatewayError) -> Self {
        Self {
            error,
            body_consumed: true,
        }
    }
}

/// Forwards requests to instances chosen by the load balancer
pub struct ProxyForwarder {
    router: Router,
    balancer: Arc<LoadBalancer>,
    connect_timeout: Duration,
    overall_timeout: Duration,
    max_retries: u32,
}

impl ProxyForwarder {
    pub fn new(balancer: Arc<LoadBalancer>, router: Router, config: &ProxyConfig) -> Self {
        Self {
            router,
            balancer,
            connect_timeout: config.connect_timeout,
            overall_timeout: config.overall_timeout,
            max_retries: config.max_retries,
        }
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Forward a request and return the downstream response
    ///
    /// An `Err` means no downstream response was obtained; the caller turns it into
    /// an error response. Errors after headers travel inside the response body.
    #[instrument(
        skip_all,
        fields(
            method = %request.method(),
            path = %request.uri().path(),
            service = tracing::field::Empty,
            request_id = tracing::field::Empty,
        )
    )]
    pub async fn forward(
        &self,
        request: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> GatewayResult<Response<Body>> {
        let (parts, body) = request.into_parts();
        let target = self.router.route(parts.uri.path())?;
        let request_id = request_id(&parts.headers);

        let span = Span::current();
        span.record("service", target.service.as_str());
        span.record("request_id", request_id.as_str());

        let replayable = body.is_end_stream() || body.size_hint().exact() == Some(0);
        let mut body = Some(body);
        let mut excluded = HashSet::new();
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..=self.max_retries {
            let instance = match self.balancer.select(&target.service, &excluded) {
                Ok(instance) => instance,
                Err(e) => return Err(last_error.unwrap_or(e)),
            };
            let decision = RouteDecision::new(target.service.clone(), instance, attempt);

            if decision.is_retry() {
                counter!("gateway_retries_total").increment(1);
                info!(
                    instance_id = %decision.instance.instance_id,
                    attempt = decision.attempt,
                    "Retrying request on a different instance"
                );
            }

            let context = ForwardingContext {
                service: &target.service,
                client_ip: client_addr.map(|addr| addr.ip()),
                request_id: &request_id,
            };

            match self.attempt(&decision, &parts, &target, &context, &mut body).await {
                Ok(mut response) => {
                    if let Ok(value) = HeaderValue::from_str(&request_id) {
                        response.headers_mut().entry(X_REQUEST_ID).or_insert(value);
                    }
                    debug!(
                        instance_id = %decision.instance.instance_id,
                        status = response.status().as_u16(),
                        attempt = decision.attempt,
                        "Downstream responded"
                    );
                    return Ok(response);
                }
                Err(AttemptError { error, body_consumed }) => {
                    warn!(
                        instance_id = %decision.instance.instance_id,
                        attempt = decision.attempt,
                        error = %error,
                        "Forwarding attempt failed"
                    );

                    if !error.is_retryable() || (body_consumed && !replayable) {
                        return Err(error);
                    }
                    excluded.insert(decision.instance.instance_id.clone());
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::internal("no forwarding attempt was made")))
    }

    /// One FORWARDING pass against a single instance
    async fn attempt(
        &self,
        decision: &RouteDecision,
        parts: &Parts,
        target: &RouteTarget,
        context: &ForwardingContext<'_>,
        body: &mut Option<Body>,
    ) -> Result<Response<Body>, AttemptError> {
        let instance = &decision.instance;
        let authority = instance.authority();
        let deadline = Instant::now() + self.overall_timeout;

        let stream = match timeout(self.connect_timeout, TcpStream::connect(authority.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(AttemptError::before_send(GatewayError::connection_refused(
                    &authority,
                    e.to_string(),
                )))
            }
            Err(_) => {
                return Err(AttemptError::before_send(GatewayError::DownstreamTimeout {
                    instance: authority,
                    timeout_ms: self.connect_timeout.as_millis() as u64,
                }))
            }
        };
        let _ = stream.set_nodelay(true);

        let (mut sender, connection) =
            match timeout_at(deadline, http1::handshake::<_, Body>(TokioIo::new(stream))).await {
                Ok(Ok(handshake)) => handshake,
                Ok(Err(e)) => {
                    return Err(AttemptError::before_send(GatewayError::connection_refused(
                        &authority,
                        format!("handshake failed: {}", e),
                    )))
                }
                Err(_) => return Err(AttemptError::before_send(self.overall_timeout_error(&authority))),
            };

        let cancel = CancellationToken::new();
        let connection_cancel = cancel.clone();
        let connection_authority = authority.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = connection_cancel.cancelled() => {
                    debug!(instance = %connection_authority, "Downstream connection cancelled");
                }
                result = connection => {
                    if let Err(e) = result {
                        debug!(instance = %connection_authority, error = %e, "Downstream connection closed with error");
                    }
                }
            }
        });
        // Dropped with this future on client disconnect, or handed to the response body.
        let guard = cancel.drop_guard();

        match timeout_at(deadline, sender.ready()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(AttemptError::before_send(GatewayError::connection_refused(
                    &authority,
                    e.to_string(),
                )))
            }
            Err(_) => return Err(AttemptError::before_send(self.overall_timeout_error(&authority))),
        }

        let outbound = self
            .build_request(parts, target, context, decision, body.take().unwrap_or_else(Body::empty))
            .map_err(AttemptError::after_send)?;

        let response = match timeout_at(deadline, sender.send_request(outbound)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(AttemptError::after_send(GatewayError::connection_refused(
                    &authority,
                    e.to_string(),
                )))
            }
            Err(_) => return Err(AttemptError::after_send(self.overall_timeout_error(&authority))),
        };

        let overall_timeout = self.overall_timeout;
        Ok(response.map(|incoming| {
            Body::new(DeadlineBody::new(
                incoming,
                deadline,
                overall_timeout,
                authority,
                Some(guard),
            ))
        }))
    }

    fn build_request(
        &self,
        parts: &Parts,
        target: &RouteTarget,
        context: &ForwardingContext<'_>,
        decision: &RouteDecision,
        body: Body,
    ) -> GatewayResult<Request<Body>> {
        let uri = target.downstream_uri(parts.uri.query())?;

        let mut request = Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .version(Version::HTTP_11)
            .body(body)
            .map_err(|e| GatewayError::internal(format!("Failed to build downstream request: {}", e)))?;

        let mut headers = parts.headers.clone();
        apply_forwarding_headers(&mut headers, &decision.instance, context);
        *request.headers_mut() = headers;

        Ok(request)
    }

    fn overall_timeout_error(&self, authority: &str) -> GatewayError {
        GatewayError::DownstreamTimeout {
            instance: authority.to_string(),
            timeout_ms: self.overall_timeout.as_millis() as u64,
        }
    }
}
