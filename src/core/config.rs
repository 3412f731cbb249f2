//! core::config
//!
//! Configuration schema and loading.
//!
//! # Precedence
//!
//! Settings are resolved in this order (later overrides earlier):
//! 1. Default values
//! 2. Config file
//! 3. Environment variables
//!
//! # Config File Locations
//!
//! Searched in order:
//! 1. `$GITSTATE_CONFIG` if set
//! 2. `~/.gitstate/config.toml`
//!
//! # Environment Overrides
//!
//! - `GITSTATE_MAX_SESSIONS` - session registry bound
//! - `GITSTATE_ENCRYPTION_PROVIDER` - content cipher name
//! - `GITSTATE_COMMIT_AUTHOR_NAME` / `GITSTATE_COMMIT_AUTHOR_EMAIL` -
//!   commit identity override
//!
//! Git credentials (`GIT_USERNAME`, `GIT_PASSWORD`, `GITHUB_TOKEN`) are
//! resolved by [`crate::git::auth`] and are deliberately env-only; they are
//! never read from or written to config files.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default bound on concurrently cached repository sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 16;

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid config value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Commit author identity applied to a session's working copy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// On-disk config file shape. All fields optional; defaults apply.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    max_sessions: Option<usize>,
    encryption_provider: Option<String>,
    commit_author: Option<Identity>,
}

/// Resolved settings for the storage engine.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bound on cached repository sessions (LRU-evicted beyond this).
    pub max_sessions: usize,
    /// Content cipher name, or `None` for plaintext state.
    pub encryption_provider: Option<String>,
    /// Commit identity written into each session's repository config.
    /// `None` falls back to the process-level git configuration.
    pub commit_author: Option<Identity>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            encryption_provider: None,
            commit_author: None,
        }
    }
}

impl Settings {
    /// Load settings from the default locations with env overrides applied.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = Settings::default();

        if let Some(path) = Self::config_path() {
            if path.exists() {
                settings.merge_file(&Self::read_file(&path)?);
            }
        }

        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Load settings from a specific file, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        settings.merge_file(&Self::read_file(path)?);
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("GITSTATE_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|home| home.join(".gitstate").join("config.toml"))
    }

    fn read_file(path: &Path) -> Result<SettingsFile, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn merge_file(&mut self, file: &SettingsFile) {
        if let Some(max) = file.max_sessions {
            self.max_sessions = max;
        }
        if let Some(provider) = &file.encryption_provider {
            self.encryption_provider = Some(provider.clone());
        }
        if let Some(author) = &file.commit_author {
            self.commit_author = Some(author.clone());
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(raw) = lookup("GITSTATE_MAX_SESSIONS") {
            self.max_sessions =
                raw.parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: "GITSTATE_MAX_SESSIONS".into(),
                        message: format!("expected a positive integer, got '{raw}'"),
                    })?;
        }

        if let Some(provider) = lookup("GITSTATE_ENCRYPTION_PROVIDER") {
            self.encryption_provider = Some(provider);
        }

        if let (Some(name), Some(email)) = (
            lookup("GITSTATE_COMMIT_AUTHOR_NAME"),
            lookup("GITSTATE_COMMIT_AUTHOR_EMAIL"),
        ) {
            self.commit_author = Some(Identity { name, email });
        }

        Ok(())
    }
}
