//! Host state and the long-running daemon.
//!
//! [`HostState`] wires the store, volume driver, process runtime and branch
//! manager together. [`run_daemon`] keeps one proxy listener per project,
//! syncs routes from the store and serves the control plane.

pub mod daemon;
pub mod proxies;
pub mod state;

pub use daemon::run_daemon;
pub use proxies::ProxyFleet;
pub use state::HostState;
