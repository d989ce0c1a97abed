//! Branch manager.
//!
//! Owns the project/branch lifecycle: exactly one active branch per project,
//! routes published only for running branches, and every structural change
//! serialized per project.

pub mod core;
mod error;
mod ports;
mod status;

pub use self::core::{BranchManager, ManagerOptions};
pub use error::{BranchError, ErrorKind};
pub use ports::{PortAllocator, PortReservation};
pub use status::{BranchReport, ProjectStatus, ProjectSummary};
