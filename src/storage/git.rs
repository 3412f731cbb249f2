//! storage::git
//!
//! Git-backed state storage: the branch-based locking protocol plus plain
//! file read/write for the state document itself.
//!
//! # Storage format
//!
//! These three conventions are shared with every other reader of the same
//! repository and must be preserved bit-for-bit:
//!
//! - lock branch: `"lock/" + state path`
//! - lock file: `state path + ".lock"`, containing the JSON lock record
//! - locks fetch refspec: `refs/heads/locks/*:refs/remotes/origin/locks/*`
//!
//! # Locking protocol
//!
//! A state path is locked exactly when its lock branch exists on the
//! remote; there is no separate lock table. Inspection checks out the
//! remote-tracking lock branch - "reference not found" means unlocked.
//! Acquisition creates the lock branch from the data branch, commits the
//! lock record, and pushes; a push rejected by the transport means a
//! concurrent writer won and surfaces as [`StorageError::LockConflict`].

use std::collections::HashMap;

use tracing::{debug, info};

use super::{StateStorage, StorageError};
use crate::core::types::{LockInfo, StateAddress};
use crate::git::{CheckoutMode, GitError, SessionRegistry};

/// Refspec used to discover lock branches without a full fetch.
const LOCKS_REFSPEC: &str = "refs/heads/locks/*:refs/remotes/origin/locks/*";

/// Branch whose remote existence signals an exclusive claim on `state_path`.
fn lock_branch(state_path: &str) -> String {
    format!("lock/{state_path}")
}

/// Path of the lock record file on the lock branch.
fn lock_file(state_path: &str) -> String {
    format!("{state_path}.lock")
}

/// Git-backed [`StateStorage`] implementation.
pub struct GitStorage {
    registry: SessionRegistry,
}

impl GitStorage {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// The registry backing this storage (exposed for observability).
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

impl StateStorage for GitStorage {
    fn parse_params(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<StateAddress, StorageError> {
        let required = |name: &str| {
            params
                .get(name)
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or_else(|| StorageError::MissingParameter {
                    name: name.to_string(),
                })
        };

        Ok(StateAddress {
            repository: required("repository")?,
            ref_name: required("ref")?,
            state_path: required("state")?,
        })
    }

    fn get_lock_data(&self, address: &StateAddress) -> Result<LockInfo, StorageError> {
        let session = self
            .registry
            .session(&address.repository, &address.ref_name)?;
        let mut worktree = session.worktree();

        worktree.fetch(&[LOCKS_REFSPEC])?;

        let branch = lock_branch(&address.state_path);

        // Delete any local leftovers from a previous sequence.
        worktree.delete_branch(&branch, false)?;

        match worktree.checkout(&branch, CheckoutMode::RemoteTracking) {
            Ok(()) => {}
            Err(GitError::RefNotFound { .. }) => return Err(StorageError::LockMissing),
            Err(e) => return Err(e.into()),
        }

        worktree.pull(&branch)?;

        let raw = worktree.read_file(&lock_file(&address.state_path))?;
        serde_json::from_slice(&raw).map_err(|e| StorageError::CorruptLockRecord {
            state_path: address.state_path.clone(),
            message: e.to_string(),
        })
    }

    fn lock_state(&self, address: &StateAddress, raw_lock: &[u8]) -> Result<(), StorageError> {
        let session = self
            .registry
            .session(&address.repository, &address.ref_name)?;
        let mut worktree = session.worktree();

        worktree.checkout(&address.ref_name, CheckoutMode::Default)?;

        let branch = lock_branch(&address.state_path);
        worktree.delete_branch(&branch, false)?;

        // Fresh local branch from the data branch carries the lock record.
        worktree.checkout(&branch, CheckoutMode::CreateLocal)?;

        let file = lock_file(&address.state_path);
        worktree.write_file(&file, raw_lock)?;
        worktree.add(&file)?;
        worktree.commit(&format!("Lock {}", address.state_path))?;

        match worktree.push() {
            Ok(()) => {
                info!(address = %address, "lock acquired");
                Ok(())
            }
            Err(GitError::PushRejected { message, .. }) => {
                debug!(address = %address, message, "lock push rejected");
                // Leave no half-made claim behind.
                worktree.delete_branch(&branch, false)?;
                Err(StorageError::LockConflict {
                    state_path: address.state_path.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn unlock_state(&self, address: &StateAddress) -> Result<(), StorageError> {
        let session = self
            .registry
            .session(&address.repository, &address.ref_name)?;
        let mut worktree = session.worktree();

        worktree.delete_branch(&lock_branch(&address.state_path), true)?;
        info!(address = %address, "lock released");
        Ok(())
    }

    fn get_state(&self, address: &StateAddress) -> Result<Vec<u8>, StorageError> {
        let session = self
            .registry
            .session(&address.repository, &address.ref_name)?;
        let mut worktree = session.worktree();

        worktree.checkout(&address.ref_name, CheckoutMode::Default)?;
        worktree.pull(&address.ref_name)?;

        match worktree.read_file(&address.state_path) {
            Ok(bytes) => Ok(bytes),
            Err(GitError::PathNotFound { .. }) => Err(StorageError::StateNotFound {
                state_path: address.state_path.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn update_state(&self, address: &StateAddress, state: &[u8]) -> Result<(), StorageError> {
        let session = self
            .registry
            .session(&address.repository, &address.ref_name)?;
        let mut worktree = session.worktree();

        worktree.checkout(&address.ref_name, CheckoutMode::Default)?;
        worktree.pull(&address.ref_name)?;

        worktree.write_file(&address.state_path, state)?;
        worktree.add(&address.state_path)?;
        worktree.commit(&format!("Update {}", address.state_path))?;
        worktree.push()?;

        info!(address = %address, "state updated");
        Ok(())
    }
}
