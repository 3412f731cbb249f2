//! storage
//!
//! The storage capability contract and the router that dispatches a
//! request's storage type to an implementation.
//!
//! # Design
//!
//! [`StateStorage`] is the closed seam between the facade and concrete
//! backends: five operations addressed by a [`StateAddress`]. The only
//! implementation today is [`GitStorage`]; the router keeps the set
//! explicit instead of switching on stringly-typed metadata at call sites.
//!
//! # Error Handling
//!
//! Two [`StorageError`] variants are load-bearing for callers:
//!
//! - [`StorageError::LockMissing`] - no lock exists where one was expected;
//!   callers distinguish "nobody holds a lock" from real failures
//! - [`StorageError::LockConflict`] - a concurrent writer won the race to
//!   create the lock branch; the facade reinterprets this as "already
//!   locked"

mod git;

pub use git::GitStorage;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::core::types::{LockInfo, StateAddress};
use crate::git::GitError;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No lock exists for the addressed state path.
    #[error("state was not locked")]
    LockMissing,

    /// Another writer created the lock branch between inspection and push.
    #[error("lock branch for {state_path} was taken by a concurrent writer")]
    LockConflict {
        /// The contended state path
        state_path: String,
    },

    /// The state document does not exist.
    #[error("state not found: {state_path}")]
    StateNotFound {
        /// The state path that was absent
        state_path: String,
    },

    /// The lock record on the lock branch could not be decoded.
    #[error("corrupt lock record for {state_path}: {message}")]
    CorruptLockRecord {
        /// The state path whose record is corrupt
        state_path: String,
        /// Decode failure detail
        message: String,
    },

    /// No storage implementation is registered under this name.
    #[error("unknown storage type {0}")]
    UnknownStorageType(String),

    /// A required request parameter was absent or empty.
    #[error("missing request parameter {name}")]
    MissingParameter {
        /// The parameter name
        name: String,
    },

    /// Underlying git operation failed.
    #[error(transparent)]
    Git(#[from] GitError),
}

/// The storage capability: everything a state backend must provide.
///
/// Implementations are shared across request workers; all methods take
/// `&self` and serialize internally.
pub trait StateStorage: Send + Sync {
    /// Build this backend's state address from raw request parameters.
    ///
    /// The request-parsing adapter supplies parameters as strings; each
    /// backend knows which ones it needs and how to validate them.
    fn parse_params(&self, params: &HashMap<String, String>)
        -> Result<StateAddress, StorageError>;

    /// Read the current lock record for a state path.
    ///
    /// Returns [`StorageError::LockMissing`] when no lock exists - callers
    /// rely on that being distinguishable from I/O failures.
    fn get_lock_data(&self, address: &StateAddress) -> Result<LockInfo, StorageError>;

    /// Publish a lock record for a state path.
    ///
    /// The caller is expected to have inspected the lock first; a lost
    /// creation race surfaces as [`StorageError::LockConflict`].
    fn lock_state(&self, address: &StateAddress, raw_lock: &[u8]) -> Result<(), StorageError>;

    /// Remove the lock for a state path. Idempotent.
    fn unlock_state(&self, address: &StateAddress) -> Result<(), StorageError>;

    /// Read the state document.
    fn get_state(&self, address: &StateAddress) -> Result<Vec<u8>, StorageError>;

    /// Write the state document and publish it.
    fn update_state(&self, address: &StateAddress, state: &[u8]) -> Result<(), StorageError>;
}

/// Maps storage-type names to implementations.
///
/// The set is assembled once at startup; lookups are read-only afterwards.
pub struct StorageRouter {
    backends: HashMap<String, Arc<dyn StateStorage>>,
}

impl StorageRouter {
    /// An empty router. Most embedders want [`StorageRouter::with_backend`]
    /// or the facade's constructor, which registers "git".
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Register `backend` under `name`, replacing any previous registration.
    pub fn register(mut self, name: impl Into<String>, backend: Arc<dyn StateStorage>) -> Self {
        self.backends.insert(name.into(), backend);
        self
    }

    /// Convenience for a single-backend router.
    pub fn with_backend(name: impl Into<String>, backend: Arc<dyn StateStorage>) -> Self {
        Self::new().register(name, backend)
    }

    /// Look up the backend for a storage type.
    pub fn get(&self, storage_type: &str) -> Result<&Arc<dyn StateStorage>, StorageError> {
        self.backends
            .get(storage_type)
            .ok_or_else(|| StorageError::UnknownStorageType(storage_type.to_string()))
    }
}

impl Default for StorageRouter {
    fn default() -> Self {
        Self::new()
    }
}
