//! core::types
//!
//! Strong types for core domain concepts.
//!
//! # Types
//!
//! - [`StateAddress`] - The (repository, ref, state path) triple naming one
//!   state document
//! - [`RequestContext`] - Per-request routing data: storage type, optional
//!   caller lock ID, and the address
//! - [`LockInfo`] - The lock record persisted at `<state path>.lock`
//!
//! # Wire compatibility
//!
//! [`LockInfo`] serializes with capitalized field names (`ID`, `Operation`,
//! `Created`, ...) and an RFC3339 `Created` timestamp. This is the exact
//! shape Terraform writes and reads for HTTP backend locks, and it must not
//! change: any other reader of the same repository decodes the same bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The address of one state document.
///
/// The repository URL is the sharding key for sessions; `ref_name` and
/// `state_path` qualify which branch and file within that repository's
/// working copy hold the document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateAddress {
    /// Transport URL of the repository.
    pub repository: String,
    /// Branch holding the state document.
    pub ref_name: String,
    /// Path of the state document within the repository.
    pub state_path: String,
}

impl StateAddress {
    pub fn new(
        repository: impl Into<String>,
        ref_name: impl Into<String>,
        state_path: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            ref_name: ref_name.into(),
            state_path: state_path.into(),
        }
    }
}

impl std::fmt::Display for StateAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}?ref={}//{}",
            self.repository, self.ref_name, self.state_path
        )
    }
}

/// Per-request context supplied by the request-parsing adapter.
///
/// `id` is the caller-presented lock ID. When it arrives out-of-band (as a
/// request parameter rather than inside the lock record body) it selects the
/// force-unlock path; see [`RequestContext::is_force_unlock`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Storage implementation to dispatch to (e.g. "git").
    pub storage_type: String,
    /// Caller-presented lock ID, if any.
    pub id: Option<String>,
    /// Address of the state document.
    pub address: StateAddress,
}

impl RequestContext {
    pub fn new(storage_type: impl Into<String>, address: StateAddress) -> Self {
        Self {
            storage_type: storage_type.into(),
            id: None,
            address,
        }
    }

    /// Attach a caller-presented lock ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// An unlock carrying an out-of-band lock ID is a force unlock.
    pub fn is_force_unlock(&self) -> bool {
        self.id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// A lock record: one exclusive claim over one state path.
///
/// Persisted verbatim as JSON at `<state path>.lock` on the lock branch.
/// Existence of that branch on the remote is the sole source of truth for
/// "is this path locked".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique ID for the lock, presented back by the caller on unlock.
    #[serde(rename = "ID")]
    pub id: String,

    /// Operation the caller is performing.
    #[serde(rename = "Operation", default)]
    pub operation: String,

    /// Extra information stored with the lock.
    #[serde(rename = "Info", default)]
    pub info: String,

    /// user@hostname when available.
    #[serde(rename = "Who", default)]
    pub who: String,

    /// Client tool version.
    #[serde(rename = "Version", default)]
    pub version: String,

    /// Time the lock was taken. A record without one decodes as the Unix
    /// epoch rather than being rejected as corrupt.
    #[serde(rename = "Created", default = "unix_epoch")]
    pub created: DateTime<Utc>,

    /// Path to the state file, when applicable.
    #[serde(rename = "Path", default)]
    pub path: String,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl LockInfo {
    /// Create a lock record with a generated ID and the current time.
    pub fn new(operation: impl Into<String>, who: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.into(),
            info: String::new(),
            who: who.into(),
            version: String::new(),
            created: Utc::now(),
            path: String::new(),
        }
    }
}
