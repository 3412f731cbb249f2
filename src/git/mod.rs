//! git
//!
//! The git layer: credential resolution, repository sessions, and the
//! session registry. This is the only layer that touches `git2`; everything
//! above it speaks in terms of [`RepoSession`] operations and typed
//! [`GitError`] values.

pub mod auth;
pub mod registry;
pub mod session;

pub use auth::{AuthError, CredentialResolver, Credentials, EnvCredentials, StaticCredentials};
pub use registry::SessionRegistry;
pub use session::{CheckoutMode, GitError, RepoSession, Worktree};
