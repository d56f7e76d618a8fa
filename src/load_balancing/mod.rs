pub mod balancer;

pub use balancer::{BalancingStrategy, InstanceStats, LoadBalancer, LoadBalancerStats, RoundRobin};
