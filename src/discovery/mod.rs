pub mod instance_table;
pub mod registry;
pub mod registry_client;

pub use instance_table::{ApplyOutcome, InstanceTable, InstanceUpdate, ProbeTarget};
pub use registry::{create_registry, EurekaRegistry, HeartbeatOutcome, Registry, StaticRegistry};
pub use registry_client::{RegistryClient, RegistryView, SyncSummary};
