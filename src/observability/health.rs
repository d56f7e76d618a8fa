//! # Health Prober
//!
//! Active liveness checking of cached service instances.
//!
//! Every `interval` the prober checks each instance the registry still lists and
//! does not itself report as down. Consecutive failures are counted per instance;
//! reaching `failure_threshold` submits a `ProbeVerdict` demoting the instance, and
//! a single success on a demoted instance submits a verdict restoring it. Demotion
//! is slow to trigger and recovery is immediate.
//!
//! Probe failures never propagate to callers: they are counted, logged and folded
//! into the instance table.
//!
//! ## Key Features
//! - HTTP probes (`GET host:port/path`, any non-5xx answer counts as alive)
//! - TCP connect probes
//! - Concurrent probing within a round, each probe bounded by `timeout`
//!
//! ## Rust Concepts Used
//! - `async_trait` for the `LivenessProbe` trait object
//! - `DashMap` for failure counters shared with the background task
//! - `tokio::time::interval` for scheduled probe rounds

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use reqwest::Client as HttpClient;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::config::{HealthProbeConfig, ProbeKind};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{InstanceEndpoint, InstanceStatus};
use crate::discovery::instance_table::{InstanceTable, InstanceUpdate, ProbeTarget};

/// Result of a single liveness probe
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    /// Whether the instance answered
    pub alive: bool,
    /// Failure details
    pub message: Option<String>,
    /// How long the probe took
    pub duration: Duration,
}

impl ProbeResult {
    pub fn success(duration: Duration) -> Self {
        Self {
            alive: true,
            message: None,
            duration,
        }
    }

    pub fn failure(message: String, duration: Duration) -> Self {
        Self {
            alive: false,
            message: Some(message),
            duration,
        }
    }
}

/// Liveness probe trait for different kinds of checks
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Check whether an instance is alive
    async fn check(&self, instance: &InstanceEndpoint) -> ProbeResult;

    /// Probe type name for logging
    fn probe_type(&self) -> &'static str;
}

/// HTTP liveness probe
pub struct HttpLivenessProbe {
    client: HttpClient,
    path: String,
    timeout: Duration,
}

impl HttpLivenessProbe {
    pub fn new(path: &str, probe_timeout: Duration) -> GatewayResult<Self> {
        let client = HttpClient::builder()
            .timeout(probe_timeout)
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to create probe HTTP client: {}", e)))?;

        Ok(Self {
            client,
            path: path.to_string(),
            timeout: probe_timeout,
        })
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn check(&self, instance: &InstanceEndpoint) -> ProbeResult {
        let start_time = Instant::now();
        let url = format!("http://{}{}", instance.authority(), self.path);

        let result = timeout(self.timeout, self.client.get(&url).send()).await;
        let duration = start_time.elapsed();

        match result {
            Ok(Ok(response)) if response.status().is_server_error() => ProbeResult::failure(
                format!("Unexpected status code: {}", response.status().as_u16()),
                duration,
            ),
            Ok(Ok(_)) => ProbeResult::success(duration),
            Ok(Err(e)) => ProbeResult::failure(format!("HTTP request failed: {}", e), duration),
            Err(_) => ProbeResult::failure(
                format!("Probe timed out after {:?}", self.timeout),
                duration,
            ),
        }
    }

    fn probe_type(&self) -> &'static str {
        "http"
    }
}

/// TCP connect liveness probe
pub struct TcpLivenessProbe {
    timeout: Duration,
}

impl TcpLivenessProbe {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            timeout: probe_timeout,
        }
    }
}

#[async_trait]
impl LivenessProbe for TcpLivenessProbe {
    async fn check(&self, instance: &InstanceEndpoint) -> ProbeResult {
        let start_time = Instant::now();
        let result = timeout(self.timeout, TcpStream::connect(instance.authority())).await;
        let duration = start_time.elapsed();

        match result {
            Ok(Ok(_)) => ProbeResult::success(duration),
            Ok(Err(e)) => ProbeResult::failure(format!("TCP connect failed: {}", e), duration),
            Err(_) => ProbeResult::failure(
                format!("Probe timed out after {:?}", self.timeout),
                duration,
            ),
        }
    }

    fn probe_type(&self) -> &'static str {
        "tcp"
    }
}

/// What one probe round did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeRoundSummary {
    pub probed: usize,
    pub failures: usize,
    pub demoted: usize,
    pub recovered: usize,
}

/// Periodic liveness checker feeding verdicts into the instance table
pub struct HealthProber {
    table: Arc<InstanceTable>,
    probe: Arc<dyn LivenessProbe>,
    failures: DashMap<String, u32>,
    interval: Duration,
    failure_threshold: u32,
}

impl HealthProber {
    pub fn new(
        table: Arc<InstanceTable>,
        probe: Arc<dyn LivenessProbe>,
        interval: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            table,
            probe,
            failures: DashMap::new(),
            interval,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Build a prober with the probe kind selected by configuration
    pub fn from_config(table: Arc<InstanceTable>, config: &HealthProbeConfig) -> GatewayResult<Self> {
        let probe: Arc<dyn LivenessProbe> = match config.kind {
            ProbeKind::Http => Arc::new(HttpLivenessProbe::new(&config.path, config.timeout)?),
            ProbeKind::Tcp => Arc::new(TcpLivenessProbe::new(config.timeout)),
        };
        Ok(Self::new(table, probe, config.interval, config.failure_threshold))
    }

    /// Consecutive failures currently recorded for an instance
    pub fn consecutive_failures(&self, service: &str, instance_id: &str) -> u32 {
        self.failures
            .get(&failure_key(service, instance_id))
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Probe every eligible instance once, concurrently
    pub async fn probe_round(&self) -> ProbeRoundSummary {
        let targets = self.table.probe_targets();
        let results = join_all(targets.iter().map(|target| self.probe.check(&target.instance))).await;

        let mut summary = ProbeRoundSummary {
            probed: targets.len(),
            ..ProbeRoundSummary::default()
        };

        for (target, result) in targets.iter().zip(results) {
            if result.alive {
                self.record_success(target, &mut summary);
            } else {
                self.record_failure(target, &result, &mut summary);
            }
        }

        let live_keys: HashSet<String> = targets
            .iter()
            .map(|t| failure_key(t.service.as_str(), &t.instance.instance_id))
            .collect();
        self.failures.retain(|key, _| live_keys.contains(key));

        debug!(
            probe = self.probe.probe_type(),
            probed = summary.probed,
            failures = summary.failures,
            demoted = summary.demoted,
            recovered = summary.recovered,
            "Probe round complete"
        );
        summary
    }

    fn record_success(&self, target: &ProbeTarget, summary: &mut ProbeRoundSummary) {
        self.failures
            .remove(&failure_key(target.service.as_str(), &target.instance.instance_id));

        if target.instance.status == InstanceStatus::Up {
            return;
        }

        let outcome = self.table.apply(
            &target.service,
            InstanceUpdate::ProbeVerdict {
                instance_id: target.instance.instance_id.clone(),
                status: InstanceStatus::Up,
            },
        );
        if outcome.changed && target.instance.status == InstanceStatus::Down {
            summary.recovered += 1;
            info!(
                service = %target.service,
                instance_id = %target.instance.instance_id,
                "Instance passed liveness probe, restoring"
            );
        }
    }

    fn record_failure(&self, target: &ProbeTarget, result: &ProbeResult, summary: &mut ProbeRoundSummary) {
        summary.failures += 1;
        counter!("health_probe_failures_total").increment(1);

        let key = failure_key(target.service.as_str(), &target.instance.instance_id);
        let failures = {
            let mut count = self.failures.entry(key).or_insert(0);
            *count += 1;
            *count
        };

        debug!(
            service = %target.service,
            instance_id = %target.instance.instance_id,
            consecutive_failures = failures,
            error = result.message.as_deref().unwrap_or("unknown"),
            "Liveness probe failed"
        );

        if failures < self.failure_threshold || target.instance.status == InstanceStatus::Down {
            return;
        }

        let outcome = self.table.apply(
            &target.service,
            InstanceUpdate::ProbeVerdict {
                instance_id: target.instance.instance_id.clone(),
                status: InstanceStatus::Down,
            },
        );
        if outcome.changed {
            summary.demoted += 1;
            info!(
                service = %target.service,
                instance_id = %target.instance.instance_id,
                consecutive_failures = failures,
                "Instance failed liveness probes, demoting"
            );
        }
    }

    /// Spawn the periodic probe task
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Health prober stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.probe_round().await;
                    }
                }
            }
        })
    }
}

fn failure_key(service: &str, instance_id: &str) -> String {
    format!("{}/{}", service, instance_id)
}
