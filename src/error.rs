//! Façade-level error type.
//!
//! Store adapters speak [`StorageError`]; everything above the store
//! boundary speaks [`MemoryError`], which names the store involved and
//! carries a stable machine-readable [`code`](MemoryError::code).

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Store '{store}' failed: {source}")]
    Store {
        store: String,
        #[source]
        source: StorageError,
    },

    /// Absent everywhere. Not a failure of any store.
    #[error("Key '{key}' not found")]
    NotFound { key: String },

    #[error("Circuit '{resource}' open, retry in {retry_after:?}")]
    CircuitOpen { resource: String, retry_after: Duration },

    /// A restore itself failed; store states may be inconsistent.
    #[error("Rollback failed on {} store(s) after: {trigger}", .failures.len())]
    RollbackFailed {
        trigger: Box<MemoryError>,
        failures: Vec<(String, StorageError)>,
    },

    #[error("Transaction {0} is no longer open")]
    TransactionClosed(Uuid),

    #[error("Unknown store '{0}'")]
    UnknownStore(String),

    #[error("No stores registered")]
    NoStores,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl MemoryError {
    /// Lift a store-local error, attributing it to `store` and `key`.
    pub fn from_storage(store: &str, key: &str, err: StorageError) -> Self {
        match err {
            StorageError::NotFound => Self::NotFound { key: key.to_string() },
            StorageError::CircuitOpen { circuit, retry_after } => Self::CircuitOpen {
                resource: circuit,
                retry_after,
            },
            source => Self::Store {
                store: store.to_string(),
                source,
            },
        }
    }

    /// Stable code for callers at a process boundary.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store { .. } => "STORE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::RollbackFailed { .. } => "ROLLBACK_FAILED",
            Self::TransactionClosed(_) => "TRANSACTION_CLOSED",
            Self::UnknownStore(_) => "UNKNOWN_STORE",
            Self::NoStores => "NO_STORES",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when store state may no longer satisfy all-or-nothing.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }
}
