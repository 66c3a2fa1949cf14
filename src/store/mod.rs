pub mod cache;
pub mod cases;
pub mod log;
pub mod sqlite;

pub use sqlite::{open_database, open_memory_database};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid JSON in {column} for {key}: {source}")]
    InvalidJson {
        column: String,
        key: String,
        source: serde_json::Error,
    },

    #[error("invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("invalid timestamp in {column} for {key}: {value}")]
    InvalidTimestamp {
        column: String,
        key: String,
        value: String,
    },

    #[error("migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },
}
