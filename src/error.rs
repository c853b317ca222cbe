//! Typed errors for the ledger and configuration layers.
//!
//! Workflow code above these layers uses `anyhow` and attaches context; these
//! types exist so callers can tell a corrupted store from a bad config file.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the persistent ledger.
///
/// Every variant is fatal for the current run. The ledger never retries.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("failed to create ledger directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown sync status '{0}' in ledger")]
    InvalidStatus(String),

    #[error("ledger schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: i64, supported: i64 },
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors raised while loading or validating the project configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("{0} not set")]
    MissingApiKey(&'static str),
}
