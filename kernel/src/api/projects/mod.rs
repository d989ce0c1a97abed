//! REST API endpoints for project and branch management.
//!
//! Each endpoint maps onto one branch manager operation; errors are mapped
//! to HTTP status codes by their [`ErrorKind`](crate::branch_manager::ErrorKind).

pub mod handlers;
pub mod routes;
pub mod types;

pub use handlers::ApiError;
pub use routes::routes;
pub use types::{BranchResponse, CreateBranchRequest, InitProjectRequest};

#[cfg(test)]
mod tests;
