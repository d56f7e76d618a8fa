// Active liveness probing of cached instances
pub mod health;

// Structured logging
pub mod logging;

pub use health::{HealthProber, HttpLivenessProbe, LivenessProbe, ProbeResult, TcpLivenessProbe};
pub use logging::init_tracing;
