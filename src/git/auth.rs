//! git::auth
//!
//! Credential resolution for remote repositories.
//!
//! # Policy
//!
//! Only network transports are supported: a repository URL must use the
//! `http` or `https` scheme. For those, a username/password (or
//! username/token) pair is resolved from the environment:
//!
//! - `GIT_USERNAME` - required
//! - `GIT_PASSWORD` - preferred secret
//! - `GITHUB_TOKEN` - fallback secret when `GIT_PASSWORD` is unset
//!
//! There is no anonymous fallback in [`EnvCredentials`]: a missing
//! credential is a hard failure, surfaced before any clone is attempted.
//!
//! [`StaticCredentials`] exists for injection - tests and embedders that
//! talk to local-path remotes use it to bypass the transport policy.
//!
//! # Security
//!
//! Credential values are never logged and never appear in error messages.

use thiserror::Error;

/// Errors from credential resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The repository URL does not use a supported transport scheme.
    #[error("unsupported transport for '{repository}': only http(s) is supported")]
    UnsupportedTransport {
        /// The offending repository URL
        repository: String,
    },

    /// `GIT_USERNAME` was not set.
    #[error("git transport was http but GIT_USERNAME was not set")]
    MissingUsername,

    /// Neither `GIT_PASSWORD` nor `GITHUB_TOKEN` was set.
    #[error("git transport was http but neither GIT_PASSWORD nor GITHUB_TOKEN was set")]
    MissingSecret,
}

/// An authentication method for remote git operations.
#[derive(Clone)]
pub enum Credentials {
    /// No credentials; only usable against transports that do not
    /// authenticate (local paths in tests).
    Anonymous,
    /// HTTP basic auth with a username and a password or token.
    UserPass {
        username: String,
        password: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose secret material through Debug output.
        match self {
            Credentials::Anonymous => f.write_str("Credentials::Anonymous"),
            Credentials::UserPass { username, .. } => f
                .debug_struct("Credentials::UserPass")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Derives an authentication method for a repository address.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, repository: &str) -> Result<Credentials, AuthError>;
}

/// Resolver backed by process environment variables.
#[derive(Debug, Default)]
pub struct EnvCredentials;

impl CredentialResolver for EnvCredentials {
    fn resolve(&self, repository: &str) -> Result<Credentials, AuthError> {
        resolve_with(repository, |key| std::env::var(key).ok())
    }
}

/// Resolver that always yields the same credentials, regardless of address.
///
/// Used by tests and by embedders whose remotes need no env-derived auth.
#[derive(Debug)]
pub struct StaticCredentials(pub Credentials);

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, _repository: &str) -> Result<Credentials, AuthError> {
        Ok(self.0.clone())
    }
}

fn resolve_with(
    repository: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Credentials, AuthError> {
    if !repository.starts_with("http://") && !repository.starts_with("https://") {
        return Err(AuthError::UnsupportedTransport {
            repository: repository.to_string(),
        });
    }

    let username = lookup("GIT_USERNAME").ok_or(AuthError::MissingUsername)?;

    let password = match lookup("GIT_PASSWORD") {
        Some(password) => password,
        None => lookup("GITHUB_TOKEN").ok_or(AuthError::MissingSecret)?,
    };

    Ok(Credentials::UserPass { username, password })
}
