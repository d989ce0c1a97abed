//! Branch store configuration.

use secrecy::SecretString;
use serde::Deserialize;

/// Connection settings for the durable branch store.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    /// `SQLite` connection URL, e.g. `sqlite://.dbranch/state.db`.
    pub url: SecretString,
}
