//! Durable branch registry backed by `SQLite`.

mod error;
mod locks;
mod schema;
mod sqlite;

pub use error::StoreError;
pub use locks::ProjectGuard;
pub use sqlite::BranchStore;

#[cfg(test)]
mod tests;
