//! git::registry
//!
//! Session registry: repository URL -> live [`RepoSession`].
//!
//! # Ownership model
//!
//! Two tiers: the registry's own mutex guards only the map (lookup,
//! insert, evict) and is the sole place sessions are created; each session
//! then serializes its working copy behind its own lock. Operations against
//! different repositories proceed in parallel once their sessions exist;
//! session creation (the clone) happens under the registry lock, so a slow
//! clone delays other lookups - the price of never registering a partially
//! constructed session.
//!
//! # Eviction
//!
//! Sessions hold a full working copy each, so the registry is bounded:
//! beyond `max_sessions`, the least recently used idle session is dropped.
//! A session still referenced by an in-flight operation is never evicted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, warn};

use super::auth::CredentialResolver;
use super::session::{GitError, RepoSession};
use crate::core::Identity;

struct Entry {
    session: Arc<RepoSession>,
    last_used: Instant,
}

/// Lazily creates and caches one [`RepoSession`] per repository URL.
pub struct SessionRegistry {
    resolver: Box<dyn CredentialResolver>,
    author: Option<Identity>,
    max_sessions: usize,
    sessions: Mutex<HashMap<String, Entry>>,
}

impl SessionRegistry {
    pub fn new(
        resolver: Box<dyn CredentialResolver>,
        author: Option<Identity>,
        max_sessions: usize,
    ) -> Self {
        Self {
            resolver,
            author,
            max_sessions: max_sessions.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return the session for `repository`, cloning it at `initial_ref` on
    /// first reference. A clone failure registers nothing.
    pub fn session(
        &self,
        repository: &str,
        initial_ref: &str,
    ) -> Result<Arc<RepoSession>, GitError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = sessions.get_mut(repository) {
            entry.last_used = Instant::now();
            return Ok(Arc::clone(&entry.session));
        }

        let credentials = self.resolver.resolve(repository)?;
        let session = Arc::new(RepoSession::connect(
            repository,
            initial_ref,
            credentials,
            self.author.as_ref(),
        )?);

        sessions.insert(
            repository.to_string(),
            Entry {
                session: Arc::clone(&session),
                last_used: Instant::now(),
            },
        );
        Self::evict_lru(&mut sessions, self.max_sessions);

        Ok(session)
    }

    /// Number of cached sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_lru(sessions: &mut HashMap<String, Entry>, max_sessions: usize) {
        while sessions.len() > max_sessions {
            let victim = sessions
                .iter()
                // strong_count == 1 means no operation holds the session
                .filter(|(_, entry)| Arc::strong_count(&entry.session) == 1)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(url, _)| url.clone());

            match victim {
                Some(url) => {
                    debug!(repository = %url, "evicting idle repository session");
                    sessions.remove(&url);
                }
                None => {
                    warn!(
                        sessions = sessions.len(),
                        max_sessions, "registry over capacity but all sessions are busy"
                    );
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("max_sessions", &self.max_sessions)
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}
