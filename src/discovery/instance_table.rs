//! # Instance Table
//!
//! The process-wide cache of which instances exist for each service. It is the only
//! mutable structure shared between the registry client, the health prober and
//! request handling.
//!
//! ## How it works
//!
//! Each service owns an `ArcSwap<ServiceSnapshot>`. Readers `load_full()` the current
//! snapshot without taking any lock and keep using that `Arc` for the whole decision,
//! even if a writer publishes a newer one in the meantime.
//!
//! Writers go through `apply`, which takes a per-service mutex, merges the update into
//! the writer-side records, derives the new instance list and swaps in a fresh
//! snapshot. Different services never contend with each other.
//!
//! ## Rust Concepts Used
//!
//! - `DashMap` for the sharded service map
//! - `ArcSwap` for copy-on-write snapshot publication
//! - `parking_lot::Mutex` to serialize writers per service
//! - `AtomicU64` for a table-wide version counter, so versions never go backwards
//!   even across eviction and rediscovery

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{InstanceEndpoint, InstanceStatus, ServiceName, ServiceSnapshot};

/// An update submitted to the table for one service
#[derive(Debug, Clone)]
pub enum InstanceUpdate {
    /// The complete instance list the registry currently reports
    ///
    /// Merged, not replaced: listed instances are added or refreshed, unlisted ones
    /// are marked down and kept until the whole service is evicted.
    RegistrySync(Vec<InstanceEndpoint>),

    /// A liveness verdict from the health prober
    ProbeVerdict {
        instance_id: String,
        status: InstanceStatus,
    },
}

/// Result of applying an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Version of the snapshot current after the update
    pub version: u64,

    /// Whether a new snapshot was published
    pub changed: bool,
}

/// Instance eligible for active probing
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub service: ServiceName,
    pub instance: InstanceEndpoint,
}

/// Writer-side view of one instance
///
/// Keeps the inputs the effective status is derived from, which the published
/// snapshot deliberately does not expose.
#[derive(Debug, Clone)]
struct InstanceRecord {
    instance_id: String,
    host: String,
    port: u16,
    registry_status: InstanceStatus,
    probe_status: Option<InstanceStatus>,
    vanished: bool,
    last_seen: DateTime<Utc>,
}

impl InstanceRecord {
    fn from_endpoint(endpoint: &InstanceEndpoint) -> Self {
        Self {
            instance_id: endpoint.instance_id.clone(),
            host: endpoint.host.clone(),
            port: endpoint.port,
            registry_status: endpoint.status,
            probe_status: None,
            vanished: false,
            last_seen: endpoint.last_seen,
        }
    }

    fn effective_status(&self) -> InstanceStatus {
        if self.vanished || self.registry_status == InstanceStatus::Down {
            return InstanceStatus::Down;
        }
        self.probe_status.unwrap_or(self.registry_status)
    }

    fn probe_eligible(&self) -> bool {
        !self.vanished && self.registry_status != InstanceStatus::Down
    }

    fn endpoint(&self) -> InstanceEndpoint {
        InstanceEndpoint {
            instance_id: self.instance_id.clone(),
            host: self.host.clone(),
            port: self.port,
            status: self.effective_status(),
            last_seen: self.last_seen,
        }
    }
}

struct ServiceEntry {
    snapshot: ArcSwap<ServiceSnapshot>,
    records: Mutex<Vec<InstanceRecord>>,
}

/// Concurrent, versioned cache of service instances
pub struct InstanceTable {
    services: DashMap<ServiceName, Arc<ServiceEntry>>,
    version: AtomicU64,
}

impl InstanceTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    /// Latest committed snapshot for a service
    ///
    /// Never blocks on writers. Unknown services and services with no instances
    /// yield `NoInstances`.
    pub fn get(&self, service: &ServiceName) -> GatewayResult<Arc<ServiceSnapshot>> {
        match self.snapshot(service) {
            Some(snapshot) if !snapshot.is_empty() => Ok(snapshot),
            _ => Err(GatewayError::NoInstances {
                service: service.to_string(),
            }),
        }
    }

    /// Latest snapshot for a service, even an empty one
    pub fn snapshot(&self, service: &ServiceName) -> Option<Arc<ServiceSnapshot>> {
        self.services
            .get(service)
            .map(|entry| entry.snapshot.load_full())
    }

    /// Apply an update to one service
    ///
    /// Linearizable per service. The version only moves when the derived instance
    /// list actually changes, so re-applying the same registry result is a no-op.
    /// Probe verdicts for services or instances the table does not know are ignored.
    pub fn apply(&self, service: &ServiceName, update: InstanceUpdate) -> ApplyOutcome {
        let entry = match &update {
            InstanceUpdate::RegistrySync(_) => Some(self.entry_or_insert(service)),
            InstanceUpdate::ProbeVerdict { .. } => {
                self.services.get(service).map(|entry| Arc::clone(entry.value()))
            }
        };
        let Some(entry) = entry else {
            return ApplyOutcome {
                version: 0,
                changed: false,
            };
        };

        let mut records = entry.records.lock();
        match update {
            InstanceUpdate::RegistrySync(instances) => merge_registry(service, &mut records, instances),
            InstanceUpdate::ProbeVerdict { instance_id, status } => {
                if let Some(record) = records.iter_mut().find(|r| r.instance_id == instance_id) {
                    record.probe_status = Some(status);
                }
            }
        }

        let current = entry.snapshot.load();
        let derived: Vec<InstanceEndpoint> = records.iter().map(InstanceRecord::endpoint).collect();
        let unchanged = current.instances.len() == derived.len()
            && current
                .instances
                .iter()
                .zip(derived.iter())
                .all(|(old, new)| old.same_state(new));

        if unchanged {
            return ApplyOutcome {
                version: current.version,
                changed: false,
            };
        }

        let version = self.next_version();
        debug!(
            service = %service,
            version = version,
            instances = derived.len(),
            routable = derived.iter().filter(|i| i.is_routable()).count(),
            "Published new service snapshot"
        );
        entry
            .snapshot
            .store(Arc::new(ServiceSnapshot::new(service.clone(), version, derived)));

        ApplyOutcome {
            version,
            changed: true,
        }
    }

    /// Remove a service entirely
    ///
    /// Returns `true` if the service was present.
    pub fn evict(&self, service: &ServiceName) -> bool {
        let removed = self.services.remove(service).is_some();
        if removed {
            info!(service = %service, "Evicted service from instance table");
        }
        removed
    }

    /// Names of every service the table holds, sorted
    pub fn service_names(&self) -> Vec<ServiceName> {
        let mut names: Vec<ServiceName> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Current snapshot of every service, sorted by service name
    pub fn snapshots(&self) -> Vec<Arc<ServiceSnapshot>> {
        let mut snapshots: Vec<Arc<ServiceSnapshot>> = self
            .services
            .iter()
            .map(|entry| entry.snapshot.load_full())
            .collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }

    /// Instances the health prober should check
    ///
    /// Everything the registry still lists and does not itself report as down,
    /// including instances a previous probe demoted.
    pub fn probe_targets(&self) -> Vec<ProbeTarget> {
        let entries: Vec<(ServiceName, Arc<ServiceEntry>)> = self
            .services
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut targets = Vec::new();
        for (service, entry) in entries {
            let records = entry.records.lock();
            targets.extend(records.iter().filter(|r| r.probe_eligible()).map(|r| ProbeTarget {
                service: service.clone(),
                instance: r.endpoint(),
            }));
        }
        targets
    }

    /// Last version handed out by the table
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Number of services held
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the table holds no services
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn entry_or_insert(&self, service: &ServiceName) -> Arc<ServiceEntry> {
        if let Some(entry) = self.services.get(service) {
            return Arc::clone(entry.value());
        }
        let entry = self.services.entry(service.clone()).or_insert_with(|| {
            Arc::new(ServiceEntry {
                snapshot: ArcSwap::from_pointee(ServiceSnapshot::new(
                    service.clone(),
                    self.next_version(),
                    Vec::new(),
                )),
                records: Mutex::new(Vec::new()),
            })
        });
        Arc::clone(entry.value())
    }
}

impl Default for InstanceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge a registry listing into the writer-side records
///
/// Unlisted instances are marked down but kept; only evicting the whole service
/// removes them.
fn merge_registry(
    service: &ServiceName,
    records: &mut Vec<InstanceRecord>,
    instances: Vec<InstanceEndpoint>,
) {
    for record in records.iter_mut() {
        let listed = instances.iter().any(|i| i.instance_id == record.instance_id);
        if !listed && !record.vanished {
            record.vanished = true;
            info!(
                service = %service,
                instance_id = %record.instance_id,
                "Instance vanished from registry, marking down"
            );
        }
    }

    for instance in instances {
        match records.iter_mut().find(|r| r.instance_id == instance.instance_id) {
            Some(record) => {
                record.host = instance.host;
                record.port = instance.port;
                record.registry_status = instance.status;
                record.vanished = false;
                record.last_seen = instance.last_seen;
            }
            None => records.push(InstanceRecord::from_endpoint(&instance)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> ServiceName {
        ServiceName::parse(name).unwrap()
    }

    fn up(id: &str, host: &str) -> InstanceEndpoint {
        InstanceEndpoint::new(id, host, 8081, InstanceStatus::Up)
    }

    fn ids(snapshot: &ServiceSnapshot) -> Vec<String> {
        snapshot.instances.iter().map(|i| i.instance_id.clone()).collect()
    }

    #[test]
    fn test_unknown_service_yields_no_instances() {
        let table = InstanceTable::new();
        let err = table.get(&service("order-service")).unwrap_err();
        assert!(matches!(err, GatewayError::NoInstances { .. }));
    }

    #[test]
    fn test_empty_service_yields_no_instances() {
        let table = InstanceTable::new();
        let svc = service("order-service");
        table.apply(&svc, InstanceUpdate::RegistrySync(Vec::new()));
        assert!(matches!(table.get(&svc), Err(GatewayError::NoInstances { .. })));
        assert!(table.snapshot(&svc).is_some());
    }

    #[test]
    fn test_registry_sync_publishes_snapshot() {
        let table = InstanceTable::new();
        let svc = service("inventory-service");
        let outcome = table.apply(
            &svc,
            InstanceUpdate::RegistrySync(vec![up("a", "host1"), up("b", "host2")]),
        );
        assert!(outcome.changed);

        let snapshot = table.get(&svc).unwrap();
        assert_eq!(snapshot.version, outcome.version);
        assert_eq!(ids(&snapshot), vec!["a", "b"]);
    }

    #[test]
    fn test_identical_sync_is_idempotent() {
        let table = InstanceTable::new();
        let svc = service("inventory-service");
        let first = table.apply(&svc, InstanceUpdate::RegistrySync(vec![up("a", "host1")]));
        let second = table.apply(&svc, InstanceUpdate::RegistrySync(vec![up("a", "host1")]));

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(first.version, second.version);
        assert_eq!(table.get(&svc).unwrap().version, first.version);
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let table = InstanceTable::new();
        let svc = service("inventory-service");
        table.apply(&svc, InstanceUpdate::RegistrySync(vec![up("a", "host1")]));

        let held = table.get(&svc).unwrap();
        table.apply(
            &svc,
            InstanceUpdate::RegistrySync(vec![up("a", "host1"), up("b", "host2")]),
        );

        assert_eq!(held.len(), 1);
        assert_eq!(table.get(&svc).unwrap().len(), 2);
        assert!(table.get(&svc).unwrap().version > held.version);
    }

    #[test]
    fn test_new_instances_are_appended_in_first_seen_order() {
        let table = InstanceTable::new();
        let svc = service("inventory-service");
        table.apply(&svc, InstanceUpdate::RegistrySync(vec![up("b", "host2")]));
        table.apply(
            &svc,
            InstanceUpdate::RegistrySync(vec![up("a", "host1"), up("b", "host2")]),
        );
        assert_eq!(ids(&table.get(&svc).unwrap()), vec!["b", "a"]);
    }

    #[test]
    fn test_vanished_instance_kept_down_while_service_listed() {
        let table = InstanceTable::new();
        let svc = service("inventory-service");
        table.apply(
            &svc,
            InstanceUpdate::RegistrySync(vec![up("a", "host1"), up("b", "host2")]),
        );

        let marked = table.apply(&svc, InstanceUpdate::RegistrySync(vec![up("a", "host1")]));
        assert!(marked.changed);

        for cycle in 2..=10 {
            let outcome = table.apply(&svc, InstanceUpdate::RegistrySync(vec![up("a", "host1")]));
            assert!(!outcome.changed, "cycle {}", cycle);
        }

        let snapshot = table.get(&svc).unwrap();
        assert_eq!(ids(&snapshot), vec!["a", "b"]);
        assert_eq!(snapshot.instance("b").unwrap().status, InstanceStatus::Down);
        assert_eq!(snapshot.routable_count(), 1);
        assert_eq!(table.probe_targets().len(), 1);

        assert!(table.evict(&svc));
        assert!(table.snapshot(&svc).is_none());
    }

    #[test]
    fn test_vanished_instance_recovers_when_relisted() {
        let table = InstanceTable::new();
        let svc = service("inventory-service");
        table.apply(
            &svc,
            InstanceUpdate::RegistrySync(vec![up("a", "host1"), up("b", "host2")]),
        );
        table.apply(&svc, InstanceUpdate::RegistrySync(vec![up("a", "host1")]));
        table.apply(
            &svc,
            InstanceUpdate::RegistrySync(vec![up("a", "host1"), up("b", "host2")]),
        );

        let snapshot = table.get(&svc).unwrap();
        assert_eq!(snapshot.instance("b").unwrap().status, InstanceStatus::Up);
        assert_eq!(ids(&snapshot), vec!["a", "b"]);
    }

    #[test]
    fn test_probe_verdict_demotes_and_recovers() {
        let table = InstanceTable::new();
        let svc = service("inventory-service");
        table.apply(
            &svc,
            InstanceUpdate::RegistrySync(vec![up("a", "host1"), up("b", "host2")]),
        );

        let demoted = table.apply(
            &svc,
            InstanceUpdate::ProbeVerdict {
                instance_id: "a".to_string(),
                status: InstanceStatus::Down,
            },
        );
        assert!(demoted.changed);
        let snapshot = table.get(&svc).unwrap();
        assert_eq!(snapshot.len(), 2);
        let routable: Vec<_> = snapshot.routable().map(|i| i.instance_id.clone()).collect();
        assert_eq!(routable, vec!["b"]);

        // A registry refresh that still says UP does not override the probe
        table.apply(
            &svc,
            InstanceUpdate::RegistrySync(vec![up("a", "host1"), up("b", "host2")]),
        );
        assert_eq!(table.get(&svc).unwrap().routable_count(), 1);

        table.apply(
            &svc,
            InstanceUpdate::ProbeVerdict {
                instance_id: "a".to_string(),
                status: InstanceStatus::Up,
            },
        );
        assert_eq!(table.get(&svc).unwrap().routable_count(), 2);
    }

    #[test]
    fn test_registry_down_wins_over_probe_up() {
        let table = InstanceTable::new();
        let svc = service("inventory-service");
        table.apply(&svc, InstanceUpdate::RegistrySync(vec![up("a", "host1")]));
        table.apply(
            &svc,
            InstanceUpdate::ProbeVerdict {
                instance_id: "a".to_string(),
                status: InstanceStatus::Up,
            },
        );
        table.apply(
            &svc,
            InstanceUpdate::RegistrySync(vec![InstanceEndpoint::new(
                "a",
                "host1",
                8081,
                InstanceStatus::Down,
            )]),
        );
        assert_eq!(table.get(&svc).unwrap().routable_count(), 0);
        assert!(table.probe_targets().is_empty());
    }

    #[test]
    fn test_probe_verdict_for_unknown_service_is_ignored() {
        let table = InstanceTable::new();
        let outcome = table.apply(
            &service("ghost"),
            InstanceUpdate::ProbeVerdict {
                instance_id: "a".to_string(),
                status: InstanceStatus::Down,
            },
        );
        assert!(!outcome.changed);
        assert!(table.is_empty());
    }

    #[test]
    fn test_versions_never_go_backwards_across_eviction() {
        let table = InstanceTable::new();
        let svc = service("inventory-service");
        let before = table.apply(&svc, InstanceUpdate::RegistrySync(vec![up("a", "host1")]));
        assert!(table.evict(&svc));
        assert!(!table.evict(&svc));

        let after = table.apply(&svc, InstanceUpdate::RegistrySync(vec![up("a", "host1")]));
        assert!(after.version > before.version);
    }

    #[test]
    fn test_services_are_listed_sorted() {
        let table = InstanceTable::new();
        table.apply(&service("zeta"), InstanceUpdate::RegistrySync(vec![up("z", "h")]));
        table.apply(&service("alpha"), InstanceUpdate::RegistrySync(vec![up("a", "h")]));

        let names: Vec<String> = table.service_names().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(table.snapshots()[0].service.as_str(), "alpha");
        assert_eq!(table.probe_targets().len(), 2);
    }

    #[test]
    fn test_concurrent_writers_on_different_services() {
        let table = Arc::new(InstanceTable::new());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let svc = service(&format!("svc-{}", n));
                    for i in 0..50 {
                        table.apply(
                            &svc,
                            InstanceUpdate::RegistrySync(vec![up(&format!("i{}", i), "host")]),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(table.len(), 8);
        for snapshot in table.snapshots() {
            assert!(!snapshot.is_empty());
        }
    }
}
