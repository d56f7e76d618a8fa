//! # Load Balancer Module
//!
//! Picks one instance per request attempt from the instance table.
//!
//! Selection always works on a single immutable snapshot: the balancer loads the
//! current `ServiceSnapshot`, filters it down to routable instances that are not
//! excluded for this request, and lets the strategy pick from that list. A snapshot
//! published mid-decision is only seen by the next selection.
//!
//! ## Rust Concepts Explained
//!
//! - `AtomicUsize` gives each service a lock-free round-robin cursor
//! - `DashMap` holds one cursor per service, created on first use
//! - `Arc<dyn BalancingStrategy>` keeps the policy swappable behind a trait
//!
//! Selection statistics are kept per service and follow the table: instances that
//! left a service's snapshot, and services that left the table, drop out of them.
//!
//! ## Failure Modes
//!
//! - Service unknown, or known with no instances at all: `NoInstances`
//! - Instances exist but none is routable once demoted and excluded ones are
//!   filtered out: `NoHealthyInstances`
//!
//! Both fail immediately; selection never waits for instances to appear.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{InstanceEndpoint, ServiceName, ServiceSnapshot};
use crate::discovery::instance_table::InstanceTable;

/// Selection policy over an already-filtered candidate list
pub trait BalancingStrategy: Send + Sync {
    /// Pick one candidate, or `None` if the list is empty
    fn pick<'a>(
        &self,
        service: &ServiceName,
        candidates: &[&'a InstanceEndpoint],
    ) -> Option<&'a InstanceEndpoint>;

    /// Algorithm name for metrics and logging
    fn algorithm_name(&self) -> &'static str;
}

/// Round-robin over the candidates, one cursor per service
///
/// The cursor is a plain counter; the index is taken modulo the candidate count at
/// selection time, so a snapshot change simply reinterprets it. A new service starts
/// at index 0.
#[derive(Default)]
pub struct RoundRobin {
    cursors: DashMap<ServiceName, Arc<AtomicUsize>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn cursor(&self, service: &ServiceName) -> Arc<AtomicUsize> {
        if let Some(cursor) = self.cursors.get(service) {
            return Arc::clone(cursor.value());
        }
        Arc::clone(
            self.cursors
                .entry(service.clone())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .value(),
        )
    }
}

impl BalancingStrategy for RoundRobin {
    fn pick<'a>(
        &self,
        service: &ServiceName,
        candidates: &[&'a InstanceEndpoint],
    ) -> Option<&'a InstanceEndpoint> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.cursor(service).fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index])
    }

    fn algorithm_name(&self) -> &'static str {
        "round_robin"
    }
}

/// Load balancer statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub algorithm: String,
    pub total_requests: u64,
    pub total_selections: u64,
    pub failed_selections: u64,
    /// Keyed by `{service}/{instance_id}`
    pub instance_stats: HashMap<String, InstanceStats>,
}

/// Per-instance statistics
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub service: String,
    pub instance_id: String,
    pub selections: u64,
    pub last_selected: Option<DateTime<Utc>>,
}

/// Selection statistics of one service, pruned against a snapshot version
#[derive(Debug, Default)]
struct ServiceStats {
    version: u64,
    instances: HashMap<String, InstanceStats>,
}

/// Instance selection on top of the instance table
pub struct LoadBalancer {
    table: Arc<InstanceTable>,
    strategy: Arc<dyn BalancingStrategy>,
    stats: DashMap<ServiceName, ServiceStats>,
    total_requests: AtomicU64,
    failed_selections: AtomicU64,
}

impl LoadBalancer {
    /// Create a balancer with the given strategy
    pub fn new(table: Arc<InstanceTable>, strategy: Arc<dyn BalancingStrategy>) -> Self {
        Self {
            table,
            strategy,
            stats: DashMap::new(),
            total_requests: AtomicU64::new(0),
            failed_selections: AtomicU64::new(0),
        }
    }

    /// Create a round-robin balancer
    pub fn round_robin(table: Arc<InstanceTable>) -> Self {
        Self::new(table, Arc::new(RoundRobin::new()))
    }

    /// Select an instance for one attempt
    ///
    /// `excluded` holds instance ids that already failed for this request; they are
    /// skipped for this call only.
    pub fn select(
        &self,
        service: &ServiceName,
        excluded: &HashSet<String>,
    ) -> GatewayResult<InstanceEndpoint> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let snapshot = match self.table.get(service) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.stats.remove(service);
                self.record_failure(service);
                return Err(e);
            }
        };

        let candidates: Vec<&InstanceEndpoint> = snapshot
            .routable()
            .filter(|instance| !excluded.contains(&instance.instance_id))
            .collect();

        let Some(selected) = self.strategy.pick(service, &candidates) else {
            self.record_failure(service);
            return Err(GatewayError::NoHealthyInstances {
                service: service.to_string(),
            });
        };

        self.update_stats(service, &snapshot, &selected.instance_id);
        counter!("load_balancer_selections").increment(1);

        debug!(
            service = %service,
            instance_id = %selected.instance_id,
            instance_address = %selected.authority(),
            snapshot_version = snapshot.version,
            candidates = candidates.len(),
            algorithm = self.strategy.algorithm_name(),
            "Selected instance for load balancing"
        );

        Ok(selected.clone())
    }

    /// Get current statistics for this load balancer
    ///
    /// Services no longer in the instance table are dropped first.
    pub fn stats(&self) -> LoadBalancerStats {
        self.stats
            .retain(|service, _| self.table.snapshot(service).is_some());

        let instance_stats = self
            .stats
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .instances
                    .values()
                    .map(|stats| (format!("{}/{}", stats.service, stats.instance_id), stats.clone()))
                    .collect::<Vec<_>>()
            })
            .collect::<HashMap<_, _>>();
        let total_selections = instance_stats.values().map(|s| s.selections).sum();

        LoadBalancerStats {
            algorithm: self.strategy.algorithm_name().to_string(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_selections,
            failed_selections: self.failed_selections.load(Ordering::Relaxed),
            instance_stats,
        }
    }

    fn record_failure(&self, service: &ServiceName) {
        self.failed_selections.fetch_add(1, Ordering::Relaxed);
        counter!("load_balancer_failed_selections").increment(1);
        debug!(service = %service, "No instance available for selection");
    }

    fn update_stats(&self, service: &ServiceName, snapshot: &ServiceSnapshot, instance_id: &str) {
        let mut entry = self.stats.entry(service.clone()).or_default();
        let service_stats = entry.value_mut();

        if service_stats.version != snapshot.version {
            service_stats
                .instances
                .retain(|id, _| snapshot.instance(id).is_some());
            service_stats.version = snapshot.version;
        }

        let stats = service_stats
            .instances
            .entry(instance_id.to_string())
            .or_insert_with(|| InstanceStats {
                service: service.to_string(),
                instance_id: instance_id.to_string(),
                selections: 0,
                last_selected: None,
            });
        stats.selections += 1;
        stats.last_selected = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::InstanceStatus;
    use crate::discovery::instance_table::InstanceUpdate;

    fn service(name: &str) -> ServiceName {
        ServiceName::parse(name).unwrap()
    }

    fn up(id: &str) -> InstanceEndpoint {
        InstanceEndpoint::new(id, id, 8081, InstanceStatus::Up)
    }

    fn balancer_with(svc: &ServiceName, instances: Vec<InstanceEndpoint>) -> (LoadBalancer, Arc<InstanceTable>) {
        let table = Arc::new(InstanceTable::new());
        table.apply(svc, InstanceUpdate::RegistrySync(instances));
        (LoadBalancer::round_robin(Arc::clone(&table)), table)
    }

    fn pick_ids(balancer: &LoadBalancer, svc: &ServiceName, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| balancer.select(svc, &HashSet::new()).unwrap().instance_id)
            .collect()
    }

    #[test]
    fn test_round_robin_order() {
        let svc = service("inventory-service");
        let (balancer, _) = balancer_with(&svc, vec![up("host1"), up("host2")]);
        assert_eq!(pick_ids(&balancer, &svc, 4), vec!["host1", "host2", "host1", "host2"]);
    }

    #[test]
    fn test_round_robin_visits_each_instance_equally() {
        let svc = service("inventory-service");
        let (balancer, _) = balancer_with(&svc, vec![up("a"), up("b"), up("c")]);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for id in pick_ids(&balancer, &svc, 3 * 7) {
            *counts.entry(id).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&count| count == 7));
    }

    #[test]
    fn test_cursors_are_per_service() {
        let a = service("service-a");
        let b = service("service-b");
        let table = Arc::new(InstanceTable::new());
        table.apply(&a, InstanceUpdate::RegistrySync(vec![up("a1"), up("a2")]));
        table.apply(&b, InstanceUpdate::RegistrySync(vec![up("b1"), up("b2")]));
        let balancer = LoadBalancer::round_robin(table);

        assert_eq!(balancer.select(&a, &HashSet::new()).unwrap().instance_id, "a1");
        assert_eq!(balancer.select(&b, &HashSet::new()).unwrap().instance_id, "b1");
        assert_eq!(balancer.select(&a, &HashSet::new()).unwrap().instance_id, "a2");
    }

    #[test]
    fn test_demoted_instance_skipped_without_reordering() {
        let svc = service("inventory-service");
        let (balancer, table) = balancer_with(&svc, vec![up("a"), up("b"), up("c")]);
        table.apply(
            &svc,
            InstanceUpdate::ProbeVerdict {
                instance_id: "b".to_string(),
                status: InstanceStatus::Down,
            },
        );
        assert_eq!(pick_ids(&balancer, &svc, 4), vec!["a", "c", "a", "c"]);
    }

    #[test]
    fn test_unknown_service_is_no_instances() {
        let table = Arc::new(InstanceTable::new());
        let balancer = LoadBalancer::round_robin(table);
        let err = balancer.select(&service("ghost"), &HashSet::new()).unwrap_err();
        assert!(matches!(err, GatewayError::NoInstances { .. }));
    }

    #[test]
    fn test_all_down_is_no_healthy_instances() {
        let svc = service("inventory-service");
        let (balancer, _) = balancer_with(
            &svc,
            vec![InstanceEndpoint::new("a", "host1", 8081, InstanceStatus::Down)],
        );
        let err = balancer.select(&svc, &HashSet::new()).unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyInstances { .. }));
    }

    #[test]
    fn test_exclusion_is_per_call() {
        let svc = service("inventory-service");
        let (balancer, _) = balancer_with(&svc, vec![up("a"), up("b")]);
        let excluded: HashSet<String> = ["a".to_string()].into_iter().collect();

        for _ in 0..3 {
            assert_eq!(balancer.select(&svc, &excluded).unwrap().instance_id, "b");
        }
        let ids: HashSet<String> = pick_ids(&balancer, &svc, 2).into_iter().collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_excluding_only_instance_is_no_healthy_instances() {
        let svc = service("inventory-service");
        let (balancer, _) = balancer_with(&svc, vec![up("a")]);
        let excluded: HashSet<String> = ["a".to_string()].into_iter().collect();
        let err = balancer.select(&svc, &excluded).unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyInstances { .. }));
    }

    #[test]
    fn test_stats() {
        let svc = service("inventory-service");
        let (balancer, _) = balancer_with(&svc, vec![up("a"), up("b")]);
        pick_ids(&balancer, &svc, 3);
        let _ = balancer.select(&service("ghost"), &HashSet::new());

        let stats = balancer.stats();
        assert_eq!(stats.algorithm, "round_robin");
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.total_selections, 3);
        assert_eq!(stats.failed_selections, 1);
        assert_eq!(stats.instance_stats["inventory-service/a"].selections, 2);
        assert_eq!(stats.instance_stats["inventory-service/b"].service, "inventory-service");
        assert_eq!(stats.instance_stats["inventory-service/b"].instance_id, "b");
    }

    #[test]
    fn test_stats_separate_services_sharing_an_instance_id() {
        let a = service("service-a");
        let b = service("service-b");
        let table = Arc::new(InstanceTable::new());
        table.apply(&a, InstanceUpdate::RegistrySync(vec![up("10.0.0.1:8081")]));
        table.apply(&b, InstanceUpdate::RegistrySync(vec![up("10.0.0.1:8081")]));
        let balancer = LoadBalancer::round_robin(table);

        pick_ids(&balancer, &a, 2);
        pick_ids(&balancer, &b, 3);

        let stats = balancer.stats();
        assert_eq!(stats.instance_stats.len(), 2);
        assert_eq!(stats.instance_stats["service-a/10.0.0.1:8081"].selections, 2);
        assert_eq!(stats.instance_stats["service-b/10.0.0.1:8081"].selections, 3);
        assert_eq!(stats.total_selections, 5);
    }

    #[test]
    fn test_stats_follow_table_membership() {
        let svc = service("inventory-service");
        let other = service("order-service");
        let (balancer, table) = balancer_with(&svc, vec![up("a"), up("b")]);
        table.apply(&other, InstanceUpdate::RegistrySync(vec![up("c")]));
        pick_ids(&balancer, &svc, 2);
        pick_ids(&balancer, &other, 1);

        table.evict(&svc);
        table.apply(&svc, InstanceUpdate::RegistrySync(vec![up("d")]));
        pick_ids(&balancer, &svc, 1);

        let stats = balancer.stats();
        let mut keys: Vec<_> = stats.instance_stats.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["inventory-service/d", "order-service/c"]);

        table.evict(&other);
        let stats = balancer.stats();
        assert!(!stats.instance_stats.contains_key("order-service/c"));
        assert_eq!(stats.instance_stats.len(), 1);
    }

    #[test]
    fn test_concurrent_selection_is_balanced() {
        let svc = service("inventory-service");
        let (balancer, _) = balancer_with(&svc, vec![up("a"), up("b")]);
        let balancer = Arc::new(balancer);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let balancer = Arc::clone(&balancer);
                let svc = svc.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        balancer.select(&svc, &HashSet::new()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = balancer.stats();
        assert_eq!(stats.instance_stats["inventory-service/a"].selections, 500);
        assert_eq!(stats.instance_stats["inventory-service/b"].selections, 500);
    }
}
