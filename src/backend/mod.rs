//! backend
//!
//! The state storage facade: the public contract the request-handling
//! layer consumes. Dispatches to a [`StateStorage`] implementation through
//! the router, interposes the ownership check on every mutating path, and
//! applies the configured content cipher at the read/write boundary.
//!
//! # Outcomes, not failures
//!
//! "Already locked" is a normal, expected outcome - it carries the holder's
//! lock record so the caller can display who owns the lock - and adapters
//! map it to a distinct status (Terraform expects HTTP 423). Transport and
//! I/O failures stay generic server errors.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::core::types::{LockInfo, RequestContext, StateAddress};
use crate::core::Settings;
use crate::encryption::{CipherError, CipherRegistry, StateCipher};
use crate::git::{EnvCredentials, SessionRegistry};
use crate::storage::{GitStorage, StateStorage, StorageError, StorageRouter};

/// Errors from facade operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The state is already locked; carries the holder's record.
    #[error("state is locked by {}", .info.id)]
    StateLocked {
        /// The existing lock record
        info: LockInfo,
    },

    /// A concurrent writer won the lock race and its record is not yet
    /// readable from this working copy.
    #[error("state lock contended by a concurrent writer")]
    LockContended,

    /// A mutation was attempted on a path nobody has locked.
    #[error("state was not locked")]
    LockMissing,

    /// The caller's lock ID does not match the held lock.
    #[error("state is not locked by me")]
    NotLockedByMe,

    /// The lock record in the request body could not be decoded.
    #[error("invalid lock record: {0}")]
    InvalidLockRecord(String),

    /// Deletion semantics are deliberately undefined.
    #[error("state deletion is not implemented")]
    NotImplemented,

    /// The content cipher failed.
    #[error("content transform failed: {0}")]
    Cipher(#[source] anyhow::Error),

    /// Cipher selection failed at construction.
    #[error(transparent)]
    Config(#[from] CipherError),

    /// The state document does not exist. Adapters map this to an empty
    /// response rather than a failure.
    #[error("state not found")]
    StateNotFound,

    /// Storage-layer failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The public get/update/lock/unlock contract.
pub struct Backend {
    router: StorageRouter,
    cipher: Option<Arc<dyn StateCipher>>,
}

impl Backend {
    /// Build a backend from settings: a git storage backend over an
    /// env-credentialed session registry, plus the configured cipher.
    pub fn new(settings: &Settings, ciphers: &CipherRegistry) -> Result<Self, BackendError> {
        let registry = SessionRegistry::new(
            Box::new(EnvCredentials),
            settings.commit_author.clone(),
            settings.max_sessions,
        );
        let router = StorageRouter::with_backend("git", Arc::new(GitStorage::new(registry)));
        let cipher = ciphers.select(settings.encryption_provider.as_deref())?;

        Ok(Self { router, cipher })
    }

    /// Build a backend over an explicit router and cipher. Used by tests
    /// and by embedders wiring custom storage implementations.
    pub fn with_router(router: StorageRouter, cipher: Option<Arc<dyn StateCipher>>) -> Self {
        Self { router, cipher }
    }

    /// Build a request context from raw request parameters.
    ///
    /// Dispatches on `storage_type` so each backend validates the
    /// parameters it needs. `id` is the caller-presented lock ID, when the
    /// adapter received one out-of-band.
    pub fn parse_request(
        &self,
        storage_type: &str,
        id: Option<String>,
        params: &HashMap<String, String>,
    ) -> Result<RequestContext, BackendError> {
        let storage = self.router.get(storage_type)?;
        let address = storage.parse_params(params)?;

        let mut ctx = RequestContext::new(storage_type, address);
        ctx.id = id;
        Ok(ctx)
    }

    /// Read the state document.
    ///
    /// An absent document is [`BackendError::StateNotFound`], distinguished
    /// from read failures so adapters can answer "no content".
    pub fn get_state(&self, ctx: &RequestContext) -> Result<Vec<u8>, BackendError> {
        let storage = self.router.get(&ctx.storage_type)?;

        let sealed = match storage.get_state(&ctx.address) {
            Ok(bytes) => bytes,
            Err(StorageError::StateNotFound { .. }) => return Err(BackendError::StateNotFound),
            Err(e) => return Err(e.into()),
        };

        match &self.cipher {
            Some(cipher) => cipher.decrypt(&sealed).map_err(BackendError::Cipher),
            None => Ok(sealed),
        }
    }

    /// Write the state document. The caller must hold the lock.
    pub fn update_state(&self, ctx: &RequestContext, state: &[u8]) -> Result<(), BackendError> {
        let storage = self.router.get(&ctx.storage_type)?;

        let caller_id = ctx.id.clone().unwrap_or_default();
        self.ensure_locked_by(storage.as_ref(), &ctx.address, &caller_id)?;

        let sealed = match &self.cipher {
            Some(cipher) => cipher.encrypt(state).map_err(BackendError::Cipher)?,
            None => state.to_vec(),
        };

        storage.update_state(&ctx.address, &sealed)?;
        Ok(())
    }

    /// Acquire the lock described by `raw_lock` (the caller's lock record,
    /// stored verbatim).
    ///
    /// When the path is already locked the existing record is returned in
    /// [`BackendError::StateLocked`]. A push race lost to a concurrent
    /// writer is reported the same way once the winner's record is
    /// readable, and as [`BackendError::LockContended`] until then.
    pub fn lock_state(&self, ctx: &RequestContext, raw_lock: &[u8]) -> Result<(), BackendError> {
        let storage = self.router.get(&ctx.storage_type)?;

        match storage.get_lock_data(&ctx.address) {
            // Having no lock is the way forward.
            Err(StorageError::LockMissing) => {}
            Ok(info) => return Err(BackendError::StateLocked { info }),
            Err(e) => return Err(e.into()),
        }

        match storage.lock_state(&ctx.address, raw_lock) {
            Ok(()) => Ok(()),
            Err(StorageError::LockConflict { .. }) => {
                debug!(address = %ctx.address, "lock race lost, re-inspecting holder");
                match storage.get_lock_data(&ctx.address) {
                    Ok(info) => Err(BackendError::StateLocked { info }),
                    Err(StorageError::LockMissing) => Err(BackendError::LockContended),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock.
    ///
    /// Regular unlock presents the lock record in `body` and must match the
    /// held lock's ID. Force unlock (ID supplied out-of-band in the
    /// context) releases unconditionally.
    pub fn unlock_state(&self, ctx: &RequestContext, body: &[u8]) -> Result<(), BackendError> {
        let storage = self.router.get(&ctx.storage_type)?;

        if !ctx.is_force_unlock() {
            let lock: LockInfo = serde_json::from_slice(body)
                .map_err(|e| BackendError::InvalidLockRecord(e.to_string()))?;
            self.ensure_locked_by(storage.as_ref(), &ctx.address, &lock.id)?;
        }

        storage.unlock_state(&ctx.address)?;
        Ok(())
    }

    /// Deletion semantics (remove file vs. remove history) are undefined;
    /// this always reports not-implemented.
    pub fn delete_state(&self, _ctx: &RequestContext) -> Result<(), BackendError> {
        Err(BackendError::NotImplemented)
    }

    fn ensure_locked_by(
        &self,
        storage: &dyn StateStorage,
        address: &StateAddress,
        caller_id: &str,
    ) -> Result<(), BackendError> {
        match storage.get_lock_data(address) {
            Ok(info) if info.id == caller_id => Ok(()),
            Ok(_) => Err(BackendError::NotLockedByMe),
            Err(StorageError::LockMissing) => Err(BackendError::LockMissing),
            Err(e) => Err(e.into()),
        }
    }
}
