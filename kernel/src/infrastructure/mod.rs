/// Audit logging of lifecycle events.
pub mod audit;
/// Configuration management.
pub mod config;
/// HTTP control plane.
pub mod server;
/// Telemetry setup for logging, tracing, and metrics.
pub mod telemetry;
