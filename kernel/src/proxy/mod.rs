//! Transparent TCP proxy routing each project's fixed port to its active branch.

mod relay;
mod router;
mod routes;

pub use relay::RelayStats;
pub use router::{ProxyError, ProxyRouter};
pub use routes::{Route, RouteTable};
