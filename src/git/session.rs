//! git::session
//!
//! Repository sessions: one cloned working copy per remote repository.
//!
//! This module is the **single doorway** to all git operations. No other
//! module imports `git2`. A [`RepoSession`] owns one working copy, cloned
//! into a scratch directory that is removed when the session drops - the
//! working copy is never durably persisted.
//!
//! # Serialization
//!
//! The working copy cannot tolerate interleaved operations (a checkout in
//! the middle of someone else's commit sequence corrupts both), so all
//! operations live on [`Worktree`] behind the session's mutex. Callers hold
//! the guard across an entire multi-step sequence (checkout, write, commit,
//! push).
//!
//! # Error Handling
//!
//! Failures are categorized into typed [`GitError`] variants. Two matter to
//! the locking protocol upstream:
//!
//! - [`GitError::RefNotFound`]: a remote-tracking checkout target does not
//!   exist - the lock-absence signal
//! - [`GitError::PushRejected`]: the remote refused a ref update (ref
//!   already exists / non-fast-forward) - the lock-contention signal

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use super::auth::{AuthError, Credentials};
use crate::core::Identity;

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Requested ref does not exist.
    ///
    /// For remote-tracking checkouts this is the lock-absence signal and is
    /// recognized by the locking protocol; it must stay distinguishable
    /// from other failures.
    #[error("ref not found: {refname}")]
    RefNotFound {
        /// The ref that was not found
        refname: String,
    },

    /// A file is absent from the working copy.
    #[error("path not found in working copy: {path}")]
    PathNotFound {
        /// The path that was not found
        path: String,
    },

    /// The remote refused a ref update on push.
    ///
    /// Carries the per-ref rejection reported by the transport. On a lock
    /// branch this means another writer pushed first.
    #[error("push rejected for {refname}: {message}")]
    PushRejected {
        /// The ref being pushed
        refname: String,
        /// The rejection message from the transport
        message: String,
    },

    /// A pull could not fast-forward the local branch.
    #[error("cannot fast-forward branch {branch}")]
    NonFastForward {
        /// The branch being pulled
        branch: String,
    },

    /// Credential resolution failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Internal libgit2 error.
    #[error("git error: {message}")]
    Internal {
        /// The error message
        message: String,
    },
}

impl GitError {
    /// Create a GitError from a git2::Error with richer context.
    fn from_git2(err: git2::Error, context: &str) -> Self {
        match err.code() {
            git2::ErrorCode::NotFound if context.starts_with("refs/") => GitError::RefNotFound {
                refname: context.to_string(),
            },
            _ => GitError::Internal {
                message: format!("{}: {}", context, err.message()),
            },
        }
    }
}

/// Checkout behaviour. One mode per checkout; "create" and "remote
/// tracking" are mutually exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Check out an existing local branch.
    Default,
    /// Create a new local branch at the current HEAD and check it out.
    /// Fails if the branch already exists.
    CreateLocal,
    /// Check out a remote-tracking branch, resetting the local branch to
    /// the remote tip. Fails with [`GitError::RefNotFound`] when the remote
    /// branch is unknown.
    RemoteTracking,
}

/// A session for one remote repository.
///
/// Created lazily by the registry on first reference to a repository URL.
/// The clone happens during construction; a failed clone registers nothing.
pub struct RepoSession {
    repository: String,
    worktree: Mutex<Worktree>,
}

impl std::fmt::Debug for RepoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoSession")
            .field("repository", &self.repository)
            .finish_non_exhaustive()
    }
}

impl RepoSession {
    /// Clone `repository` at `initial_ref` into a fresh working copy.
    ///
    /// `author`, when present, is written into the clone's local git config
    /// so commits do not depend on process-level configuration.
    pub fn connect(
        repository: &str,
        initial_ref: &str,
        credentials: Credentials,
        author: Option<&Identity>,
    ) -> Result<Self, GitError> {
        let dir = TempDir::new().map_err(|e| GitError::Internal {
            message: format!("failed to create working copy directory: {e}"),
        })?;

        info!(repository, initial_ref, "cloning repository session");

        let mut fetch_opts = git2::FetchOptions::new();
        fetch_opts.remote_callbacks(callbacks_for(&credentials));

        let repo = git2::build::RepoBuilder::new()
            .branch(initial_ref)
            .fetch_options(fetch_opts)
            .clone(repository, dir.path())
            .map_err(|e| GitError::Internal {
                message: format!("clone of {repository} failed: {}", e.message()),
            })?;

        if let Some(author) = author {
            let mut config = repo
                .config()
                .map_err(|e| GitError::from_git2(e, "config"))?;
            config
                .set_str("user.name", &author.name)
                .map_err(|e| GitError::from_git2(e, "user.name"))?;
            config
                .set_str("user.email", &author.email)
                .map_err(|e| GitError::from_git2(e, "user.email"))?;
        }

        Ok(Self {
            repository: repository.to_string(),
            worktree: Mutex::new(Worktree {
                repo,
                credentials,
                identity: None,
                _dir: dir,
            }),
        })
    }

    /// The repository URL this session serves.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Acquire exclusive access to the working copy.
    ///
    /// A poisoned mutex is recovered: every operation sequence begins with
    /// a forced checkout, so a working copy abandoned mid-sequence is safe
    /// to reuse.
    pub fn worktree(&self) -> MutexGuard<'_, Worktree> {
        self.worktree.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The working copy of one session. All operations assume the caller holds
/// the session mutex (this type is only reachable through it).
pub struct Worktree {
    repo: git2::Repository,
    credentials: Credentials,
    /// Commit author, resolved from git config on first commit and cached.
    identity: Option<Identity>,
    /// Owns the on-disk working copy; removed when the session drops.
    _dir: TempDir,
}

impl Worktree {
    /// Check out `branch` according to `mode`, discarding any uncommitted
    /// local changes so the working copy stays deterministic across reuses.
    pub fn checkout(&mut self, branch: &str, mode: CheckoutMode) -> Result<(), GitError> {
        debug!(branch, ?mode, "checkout");
        match mode {
            CheckoutMode::Default => {
                let refname = local_ref(branch);
                let commit = self
                    .repo
                    .find_reference(&refname)
                    .map_err(|e| GitError::from_git2(e, &refname))?
                    .peel_to_commit()
                    .map_err(|e| GitError::from_git2(e, &refname))?;
                self.force_checkout(&commit, &refname)
            }
            CheckoutMode::CreateLocal => {
                let head = self.head_commit()?;
                self.repo
                    .branch(branch, &head, false)
                    .map_err(|e| GitError::Internal {
                        message: format!("cannot create branch {branch}: {}", e.message()),
                    })?;
                self.force_checkout(&head, &local_ref(branch))
            }
            CheckoutMode::RemoteTracking => {
                let remote_refname = remote_ref(branch);
                let commit = self
                    .repo
                    .find_reference(&remote_refname)
                    .map_err(|e| GitError::from_git2(e, &remote_refname))?
                    .peel_to_commit()
                    .map_err(|e| GitError::from_git2(e, &remote_refname))?;

                let mut local = self
                    .repo
                    .branch(branch, &commit, true)
                    .map_err(|e| GitError::Internal {
                        message: format!("cannot reset branch {branch}: {}", e.message()),
                    })?;
                local
                    .set_upstream(Some(&format!("origin/{branch}")))
                    .map_err(|e| GitError::from_git2(e, branch))?;

                self.force_checkout(&commit, &local_ref(branch))
            }
        }
    }

    /// Fetch the given refspecs from origin. Nothing matching is not an error.
    pub fn fetch(&mut self, refspecs: &[&str]) -> Result<(), GitError> {
        let mut opts = git2::FetchOptions::new();
        opts.remote_callbacks(callbacks_for(&self.credentials));

        self.repo
            .find_remote("origin")
            .map_err(|e| GitError::from_git2(e, "origin"))?
            .fetch(refspecs, Some(&mut opts), None)
            .map_err(|e| GitError::from_git2(e, "fetch"))
    }

    /// Fast-forward the checked-out `branch` from origin.
    ///
    /// "Already up to date" is not an error; a history that cannot be
    /// fast-forwarded is.
    pub fn pull(&mut self, branch: &str) -> Result<(), GitError> {
        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        self.fetch(&[&refspec])?;

        let remote_refname = remote_ref(branch);
        let fetched = self
            .repo
            .find_reference(&remote_refname)
            .map_err(|e| GitError::from_git2(e, &remote_refname))?;
        let annotated = self
            .repo
            .reference_to_annotated_commit(&fetched)
            .map_err(|e| GitError::from_git2(e, &remote_refname))?;

        let (analysis, _) = self
            .repo
            .merge_analysis(&[&annotated])
            .map_err(|e| GitError::from_git2(e, branch))?;

        if analysis.is_up_to_date() {
            return Ok(());
        }
        if !analysis.is_fast_forward() {
            return Err(GitError::NonFastForward {
                branch: branch.to_string(),
            });
        }

        let refname = local_ref(branch);
        self.repo
            .find_reference(&refname)
            .map_err(|e| GitError::from_git2(e, &refname))?
            .set_target(annotated.id(), "fast-forward pull")
            .map_err(|e| GitError::from_git2(e, &refname))?;
        self.repo
            .set_head(&refname)
            .map_err(|e| GitError::from_git2(e, &refname))?;

        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force();
        self.repo
            .checkout_head(Some(&mut checkout))
            .map_err(|e| GitError::from_git2(e, branch))
    }

    /// Publish the checked-out branch's commits to origin.
    ///
    /// Per-ref rejections reported by the transport surface as
    /// [`GitError::PushRejected`]; no further conflict detection happens
    /// here.
    pub fn push(&mut self) -> Result<(), GitError> {
        let branch = self.current_branch()?;
        let refname = local_ref(&branch);
        let refspec = format!("{refname}:{refname}");
        debug!(branch, "push");

        let rejected: RefCell<Option<(String, String)>> = RefCell::new(None);
        {
            let mut callbacks = callbacks_for(&self.credentials);
            callbacks.push_update_reference(|name, status| {
                if let Some(message) = status {
                    *rejected.borrow_mut() = Some((name.to_string(), message.to_string()));
                }
                Ok(())
            });

            let mut opts = git2::PushOptions::new();
            opts.remote_callbacks(callbacks);

            self.repo
                .find_remote("origin")
                .map_err(|e| GitError::from_git2(e, "origin"))?
                .push(&[&refspec], Some(&mut opts))
                .map_err(|e| match e.code() {
                    git2::ErrorCode::NotFastForward | git2::ErrorCode::Exists => {
                        GitError::PushRejected {
                            refname: refname.clone(),
                            message: e.message().to_string(),
                        }
                    }
                    _ => GitError::from_git2(e, "push"),
                })?;
        }

        if let Some((refname, message)) = rejected.into_inner() {
            return Err(GitError::PushRejected { refname, message });
        }

        // Advance the tracking ref so the new remote state is visible to
        // this working copy immediately.
        let oid = self.head_commit()?.id();
        self.repo
            .reference(&remote_ref(&branch), oid, true, "update tracking after push")
            .map_err(|e| GitError::from_git2(e, &branch))?;

        Ok(())
    }

    /// Delete a local branch, and force-delete its remote counterpart when
    /// `also_remote` is set. Idempotent: a branch that does not exist is not
    /// an error.
    pub fn delete_branch(&mut self, branch: &str, also_remote: bool) -> Result<(), GitError> {
        let refname = local_ref(branch);

        // The branch may still be checked out from a previous sequence;
        // detach HEAD before deleting it.
        if let Ok(head) = self.repo.head() {
            if head.name() == Some(refname.as_str()) {
                let oid = self.head_commit()?.id();
                self.repo
                    .set_head_detached(oid)
                    .map_err(|e| GitError::from_git2(e, &refname))?;
            }
        }

        match self.repo.find_branch(branch, git2::BranchType::Local) {
            Ok(mut local) => local
                .delete()
                .map_err(|e| GitError::from_git2(e, &refname))?,
            Err(e) if e.code() == git2::ErrorCode::NotFound => {}
            Err(e) => return Err(GitError::from_git2(e, &refname)),
        }

        if !also_remote {
            return Ok(());
        }

        let mut opts = git2::PushOptions::new();
        opts.remote_callbacks(callbacks_for(&self.credentials));

        let delete_spec = format!(":{refname}");
        let result = self
            .repo
            .find_remote("origin")
            .map_err(|e| GitError::from_git2(e, "origin"))?
            .push(&[&delete_spec], Some(&mut opts));

        match result {
            Ok(()) => {}
            // Remote ref already gone - deletion is idempotent.
            Err(e) if e.code() == git2::ErrorCode::NotFound => {}
            Err(e) => return Err(GitError::from_git2(e, &delete_spec)),
        }

        // Drop stale remote-tracking knowledge so a later remote-tracking
        // checkout observes the deletion.
        if let Ok(mut tracking) = self.repo.find_reference(&remote_ref(branch)) {
            tracking
                .delete()
                .map_err(|e| GitError::from_git2(e, branch))?;
        }

        Ok(())
    }

    /// Stage a path in the working copy.
    pub fn add(&mut self, path: &str) -> Result<(), GitError> {
        let mut index = self
            .repo
            .index()
            .map_err(|e| GitError::from_git2(e, path))?;
        index
            .add_path(Path::new(path))
            .map_err(|e| GitError::from_git2(e, path))?;
        index.write().map_err(|e| GitError::from_git2(e, path))
    }

    /// Commit staged changes with the session's cached author identity.
    pub fn commit(&mut self, message: &str) -> Result<(), GitError> {
        let identity = self.resolve_identity()?;
        let signature = git2::Signature::now(&identity.name, &identity.email)
            .map_err(|e| GitError::from_git2(e, "signature"))?;

        let mut index = self
            .repo
            .index()
            .map_err(|e| GitError::from_git2(e, "index"))?;
        let tree_oid = index
            .write_tree()
            .map_err(|e| GitError::from_git2(e, "index"))?;
        let tree = self
            .repo
            .find_tree(tree_oid)
            .map_err(|e| GitError::from_git2(e, "tree"))?;
        let parent = self.head_commit()?;

        self.repo
            .commit(
                Some("HEAD"),
                &signature,
                &signature,
                message,
                &tree,
                &[&parent],
            )
            .map_err(|e| GitError::from_git2(e, "commit"))?;

        Ok(())
    }

    /// Read a file from the working copy.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, GitError> {
        let full = self.workdir()?.join(path);
        fs::read(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GitError::PathNotFound {
                path: path.to_string(),
            },
            _ => GitError::Internal {
                message: format!("cannot read {path}: {e}"),
            },
        })
    }

    /// Write a file into the working copy, creating or truncating it.
    pub fn write_file(&mut self, path: &str, bytes: &[u8]) -> Result<(), GitError> {
        let full = self.workdir()?.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| GitError::Internal {
                message: format!("cannot create directories for {path}: {e}"),
            })?;
        }
        fs::write(&full, bytes).map_err(|e| GitError::Internal {
            message: format!("cannot write {path}: {e}"),
        })
    }

    fn workdir(&self) -> Result<PathBuf, GitError> {
        self.repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| GitError::Internal {
                message: "session repository has no working copy".into(),
            })
    }

    fn head_commit(&self) -> Result<git2::Commit<'_>, GitError> {
        self.repo
            .head()
            .map_err(|e| GitError::from_git2(e, "HEAD"))?
            .peel_to_commit()
            .map_err(|e| GitError::from_git2(e, "HEAD"))
    }

    fn current_branch(&self) -> Result<String, GitError> {
        let head = self.repo.head().map_err(|e| GitError::from_git2(e, "HEAD"))?;
        head.shorthand()
            .filter(|_| head.is_branch())
            .map(str::to_string)
            .ok_or_else(|| GitError::Internal {
                message: "HEAD is not on a branch".into(),
            })
    }

    fn force_checkout(&self, commit: &git2::Commit<'_>, refname: &str) -> Result<(), GitError> {
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force();
        self.repo
            .checkout_tree(commit.as_object(), Some(&mut checkout))
            .map_err(|e| GitError::from_git2(e, refname))?;
        self.repo
            .set_head(refname)
            .map_err(|e| GitError::from_git2(e, refname))
    }

    fn resolve_identity(&mut self) -> Result<Identity, GitError> {
        if let Some(identity) = &self.identity {
            return Ok(identity.clone());
        }

        let signature = self
            .repo
            .signature()
            .map_err(|e| GitError::Internal {
                message: format!("cannot resolve commit author from git config: {}", e.message()),
            })?;

        let identity = Identity {
            name: signature.name().unwrap_or("gitstate").to_string(),
            email: signature.email().unwrap_or("gitstate@localhost").to_string(),
        };
        self.identity = Some(identity.clone());
        Ok(identity)
    }
}

/// Short branch name to a full local ref.
fn local_ref(branch: &str) -> String {
    format!("refs/heads/{branch}")
}

/// Short branch name to its remote-tracking ref. The remote is always
/// "origin": sessions clone without naming one.
fn remote_ref(branch: &str) -> String {
    format!("refs/remotes/origin/{branch}")
}

fn callbacks_for<'cb>(credentials: &Credentials) -> git2::RemoteCallbacks<'cb> {
    let credentials = credentials.clone();
    let mut callbacks = git2::RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username_from_url, _allowed| match &credentials {
        Credentials::UserPass { username, password } => {
            git2::Cred::userpass_plaintext(username, password)
        }
        Credentials::Anonymous => git2::Cred::default(),
    });
    callbacks
}
