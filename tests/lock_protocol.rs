//! Integration tests for the branch-based locking protocol.
//!
//! These tests run the full facade against real bare repositories created
//! via tempfile, so every lock and unlock goes through an actual clone,
//! commit, and push.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tempfile::TempDir;

use gitstate::backend::{Backend, BackendError};
use gitstate::core::types::{LockInfo, RequestContext, StateAddress};
use gitstate::core::Identity;
use gitstate::git::{Credentials, SessionRegistry, StaticCredentials};
use gitstate::storage::{GitStorage, StorageRouter};

/// Test fixture owning one bare repository seeded with a `main` branch.
struct StateRemote {
    dir: TempDir,
}

impl StateRemote {
    fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo = git2::Repository::init_bare(dir.path()).unwrap();

        let tree_oid = {
            let mut builder = repo.treebuilder(None).unwrap();
            let blob = repo.blob(b"# state repository\n").unwrap();
            builder.insert("README.md", blob, 0o100644).unwrap();
            builder.write().unwrap()
        };
        let tree = repo.find_tree(tree_oid).unwrap();
        let sig = git2::Signature::now("seed", "seed@example.com").unwrap();
        repo.commit(Some("refs/heads/main"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        repo.set_head("refs/heads/main").unwrap();

        Self { dir }
    }

    fn url(&self) -> String {
        self.dir.path().to_str().unwrap().to_string()
    }

    /// Build a backend whose git storage talks to this remote.
    fn backend(&self) -> Backend {
        let registry = SessionRegistry::new(
            Box::new(StaticCredentials(Credentials::Anonymous)),
            Some(Identity {
                name: "Test Author".into(),
                email: "test@example.com".into(),
            }),
            4,
        );
        Backend::with_router(
            StorageRouter::with_backend("git", Arc::new(GitStorage::new(registry))),
            None,
        )
    }

    fn ctx(&self, state_path: &str) -> RequestContext {
        RequestContext::new("git", StateAddress::new(self.url(), "main", state_path))
    }

    /// Lock branches present on the remote, by full ref name.
    fn lock_branches(&self) -> Vec<String> {
        let repo = git2::Repository::open_bare(self.dir.path()).unwrap();
        repo.references_glob("refs/heads/lock/*")
            .unwrap()
            .filter_map(|r| r.ok().and_then(|r| r.name().map(str::to_string)))
            .collect()
    }
}

fn raw_lock(id: &str) -> Vec<u8> {
    let mut info = LockInfo::new("OperationTypeApply", "tester@host");
    info.id = id.to_string();
    serde_json::to_vec(&info).unwrap()
}

#[test]
fn full_lock_lifecycle() {
    let remote = StateRemote::new();
    let backend = remote.backend();
    let ctx = remote.ctx("prod.tfstate");

    // Acquire.
    backend.lock_state(&ctx, &raw_lock("abc")).unwrap();
    assert_eq!(remote.lock_branches(), vec!["refs/heads/lock/prod.tfstate"]);

    // A second caller is told who holds the lock.
    let err = backend.lock_state(&ctx, &raw_lock("def")).unwrap_err();
    match err {
        BackendError::StateLocked { info } => assert_eq!(info.id, "abc"),
        other => panic!("expected StateLocked, got {other:?}"),
    }

    // The holder can write and read back.
    backend
        .update_state(&ctx.clone().with_id("abc"), b"{\"version\":4}")
        .unwrap();
    assert_eq!(backend.get_state(&ctx).unwrap(), b"{\"version\":4}");

    // Releasing with the wrong ID is refused and the lock survives.
    let err = backend.unlock_state(&ctx, &raw_lock("def")).unwrap_err();
    assert!(matches!(err, BackendError::NotLockedByMe), "got {err:?}");
    assert_eq!(remote.lock_branches().len(), 1);

    // The holder releases; the branch is gone from the remote.
    backend.unlock_state(&ctx, &raw_lock("abc")).unwrap();
    assert!(remote.lock_branches().is_empty());

    // The path is free for the next caller.
    backend.lock_state(&ctx, &raw_lock("def")).unwrap();
}

#[test]
fn unlock_of_unlocked_path_requires_force() {
    let remote = StateRemote::new();
    let backend = remote.backend();
    let ctx = remote.ctx("prod.tfstate");

    // A regular unlock cannot verify ownership of a lock that is not there.
    let err = backend.unlock_state(&ctx, &raw_lock("abc")).unwrap_err();
    assert!(matches!(err, BackendError::LockMissing), "got {err:?}");

    // Force unlock of an unlocked path is a no-op, not a failure.
    backend
        .unlock_state(&ctx.clone().with_id("abc"), b"")
        .unwrap();
}

#[test]
fn force_unlock_releases_another_callers_lock() {
    let remote = StateRemote::new();
    let backend = remote.backend();
    let ctx = remote.ctx("prod.tfstate");

    backend.lock_state(&ctx, &raw_lock("abc")).unwrap();

    backend
        .unlock_state(&ctx.clone().with_id("someone-else"), b"")
        .unwrap();

    assert!(remote.lock_branches().is_empty());
    backend.lock_state(&ctx, &raw_lock("def")).unwrap();
}

#[test]
fn locks_on_different_paths_are_independent() {
    let remote = StateRemote::new();
    let backend = remote.backend();

    backend
        .lock_state(&remote.ctx("envs/prod/terraform.tfstate"), &raw_lock("abc"))
        .unwrap();
    backend
        .lock_state(&remote.ctx("envs/dev/terraform.tfstate"), &raw_lock("def"))
        .unwrap();

    let mut branches = remote.lock_branches();
    branches.sort();
    assert_eq!(
        branches,
        vec![
            "refs/heads/lock/envs/dev/terraform.tfstate",
            "refs/heads/lock/envs/prod/terraform.tfstate",
        ]
    );
}

#[test]
fn concurrent_acquires_elect_exactly_one_winner() {
    let remote = StateRemote::new();
    let backend = Arc::new(remote.backend());

    let workers = 4;
    let mut handles = Vec::new();
    for n in 0..workers {
        let backend = Arc::clone(&backend);
        let ctx = remote.ctx("prod.tfstate");
        handles.push(thread::spawn(move || {
            let jitter = rand::rng().random_range(0..20);
            thread::sleep(Duration::from_millis(jitter));
            backend.lock_state(&ctx, &raw_lock(&format!("worker-{n}")))
        }));
    }

    let mut won = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(()) => won += 1,
            Err(BackendError::StateLocked { .. }) | Err(BackendError::LockContended) => {}
            Err(other) => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(won, 1);
    assert_eq!(remote.lock_branches(), vec!["refs/heads/lock/prod.tfstate"]);
}
