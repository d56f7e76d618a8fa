//! # Registry Client
//!
//! Polls the external registry and folds the result into the instance table.
//!
//! A refresh lists every service, then queries the instances of each service
//! concurrently. The outcome is pushed into the table as one `RegistrySync` update
//! per service:
//!
//! - if the service listing itself fails, the whole cycle is skipped and the table
//!   keeps its (stale) contents
//! - if one service's instance query fails, the last successful result for that
//!   service is reused
//! - services that disappear from the registry are marked down and evicted once
//!   they have been absent for more than `eviction_cycles` consecutive refreshes
//!
//! The client also registers the gateway itself and keeps the registration alive
//! with heartbeats, when self-registration is configured.

use futures::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::GatewayResult;
use crate::core::types::{InstanceEndpoint, RegistrationInfo, ServiceName};
use crate::discovery::instance_table::{InstanceTable, InstanceUpdate};
use crate::discovery::registry::{HeartbeatOutcome, Registry};

/// Instances per service as last seen by the registry client
pub type RegistryView = BTreeMap<ServiceName, Vec<InstanceEndpoint>>;

/// Summary of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Services the registry reported
    pub services: usize,
    /// Services whose snapshot changed
    pub changed: usize,
    /// Services whose instance query failed and fell back to the previous result
    pub stale: usize,
    /// Services removed from the table
    pub evicted: usize,
}

struct Fetched {
    listed: Vec<ServiceName>,
    view: RegistryView,
    stale: usize,
}

/// Keeps the instance table in step with the registry
pub struct RegistryClient {
    registry: Arc<dyn Registry>,
    table: Arc<InstanceTable>,
    refresh_interval: Duration,
    eviction_cycles: u32,
    last_good: Mutex<RegistryView>,
    absences: Mutex<HashMap<ServiceName, u32>>,
}

impl RegistryClient {
    pub fn new(
        registry: Arc<dyn Registry>,
        table: Arc<InstanceTable>,
        refresh_interval: Duration,
        eviction_cycles: u32,
    ) -> Self {
        Self {
            registry,
            table,
            refresh_interval,
            eviction_cycles: eviction_cycles.max(1),
            last_good: Mutex::new(BTreeMap::new()),
            absences: Mutex::new(HashMap::new()),
        }
    }

    /// Query the registry for every service and its instances
    ///
    /// Fails with `RegistryUnavailable` only when the service listing fails.
    /// Individual instance queries that fail reuse the last successful result.
    pub async fn refresh(&self) -> GatewayResult<RegistryView> {
        Ok(self.fetch().await?.view)
    }

    async fn fetch(&self) -> GatewayResult<Fetched> {
        let listed = self.registry.list_all_services().await?;
        let results = join_all(listed.iter().map(|service| self.registry.list_instances(service))).await;

        let mut view = BTreeMap::new();
        let mut stale = 0;
        let mut last_good = self.last_good.lock();
        for (service, result) in listed.iter().zip(results) {
            match result {
                Ok(instances) => {
                    last_good.insert(service.clone(), instances.clone());
                    view.insert(service.clone(), instances);
                }
                Err(e) => {
                    counter!("registry_refresh_failures_total").increment(1);
                    match last_good.get(service) {
                        Some(previous) => {
                            warn!(service = %service, error = %e, "Instance query failed, keeping previous result");
                            stale += 1;
                            view.insert(service.clone(), previous.clone());
                        }
                        None => {
                            warn!(service = %service, error = %e, "Instance query failed, no previous result");
                        }
                    }
                }
            }
        }
        last_good.retain(|service, _| listed.contains(service));

        Ok(Fetched { listed, view, stale })
    }

    /// Run one refresh and publish the result into the instance table
    ///
    /// On `RegistryUnavailable` the table is left untouched.
    pub async fn sync(&self) -> GatewayResult<SyncSummary> {
        let fetched = match self.fetch().await {
            Ok(fetched) => fetched,
            Err(e) => {
                counter!("registry_refresh_failures_total").increment(1);
                warn!(
                    backend = self.registry.backend_name(),
                    error = %e,
                    "Registry refresh failed, serving stale instance table"
                );
                return Err(e);
            }
        };

        let mut summary = SyncSummary {
            services: fetched.listed.len(),
            stale: fetched.stale,
            ..SyncSummary::default()
        };

        for (service, instances) in fetched.view {
            if self
                .table
                .apply(&service, InstanceUpdate::RegistrySync(instances))
                .changed
            {
                summary.changed += 1;
            }
        }

        let listed: HashSet<&ServiceName> = fetched.listed.iter().collect();
        let mut absences = self.absences.lock();
        absences.retain(|service, _| !listed.contains(service));

        for service in self.table.service_names() {
            if listed.contains(&service) {
                continue;
            }
            let missed = absences.entry(service.clone()).or_insert(0);
            *missed += 1;
            if *missed > self.eviction_cycles {
                absences.remove(&service);
                if self.table.evict(&service) {
                    summary.evicted += 1;
                }
            } else {
                debug!(service = %service, missed = *missed, "Service absent from registry");
                if self
                    .table
                    .apply(&service, InstanceUpdate::RegistrySync(Vec::new()))
                    .changed
                {
                    summary.changed += 1;
                }
            }
        }

        debug!(
            services = summary.services,
            changed = summary.changed,
            stale = summary.stale,
            evicted = summary.evicted,
            "Registry sync complete"
        );
        Ok(summary)
    }

    /// Spawn the periodic refresh task
    ///
    /// The first tick fires one interval from now; the initial sync is the
    /// caller's job.
    pub fn spawn_refresh_loop(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Registry refresh loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        // Failures are logged inside sync
                        let _ = self.sync().await;
                    }
                }
            }
        })
    }

    /// Register the gateway with the registry
    ///
    /// Failures are logged and returned; the caller decides whether to care.
    pub async fn register_self(&self, info: &RegistrationInfo) -> GatewayResult<()> {
        match self.registry.register(info).await {
            Ok(()) => {
                info!(
                    app = %info.app_name,
                    instance_id = %info.instance_id,
                    backend = self.registry.backend_name(),
                    "Registered gateway with service registry"
                );
                Ok(())
            }
            Err(e) => {
                warn!(app = %info.app_name, error = %e, "Self-registration failed");
                Err(e)
            }
        }
    }

    /// Send one heartbeat, re-registering if the registry forgot us
    pub async fn heartbeat_once(&self, info: &RegistrationInfo) -> GatewayResult<HeartbeatOutcome> {
        let outcome = self.registry.heartbeat(info).await.map_err(|e| {
            warn!(instance_id = %info.instance_id, error = %e, "Heartbeat failed");
            e
        })?;

        if outcome == HeartbeatOutcome::UnknownInstance {
            info!(instance_id = %info.instance_id, "Registry does not know this gateway, re-registering");
            self.register_self(info).await?;
        }
        Ok(outcome)
    }

    /// Spawn the heartbeat task
    pub fn spawn_heartbeat_loop(
        self: Arc<Self>,
        info: RegistrationInfo,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Heartbeat loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let _ = self.heartbeat_once(&info).await;
                    }
                }
            }
        })
    }
}
