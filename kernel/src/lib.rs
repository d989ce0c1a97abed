//! dBranch kernel: copy-on-write database branching.
//!
//! A project is one CoW volume holding a tree of branches. Each branch is a
//! snapshot with its own database process and port; a per-project proxy
//! forwards new client connections to whichever branch is active.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// REST API mounted on the control plane.
pub mod api;
/// Project and branch lifecycle orchestration.
pub mod branch_manager;
/// Command line interface.
pub mod cli;
/// Core domain types.
pub mod domain;
/// Lifecycle event bus.
pub mod events;
/// Host state and the long-running daemon.
pub mod host;
/// Infrastructure components (config, server, telemetry).
pub mod infrastructure;
/// Connection proxy and route table.
pub mod proxy;
/// Durable branch registry.
pub mod store;
/// Database process supervision.
pub mod supervisor;
/// Copy-on-write volume driver.
pub mod volume;
