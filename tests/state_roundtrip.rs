//! Integration tests for state reads and writes through the facade.
//!
//! Each test drives a real bare repository via tempfile: updates become
//! commits on the data branch and reads pull before returning bytes.

use std::sync::Arc;

use tempfile::TempDir;

use gitstate::backend::{Backend, BackendError};
use gitstate::core::types::{LockInfo, RequestContext, StateAddress};
use gitstate::core::Identity;
use gitstate::encryption::StateCipher;
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

    fn backend_with_cipher(&self, cipher: Option<Arc<dyn StateCipher>>) -> Backend {
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
            cipher,
        )
    }

    fn backend(&self) -> Backend {
        self.backend_with_cipher(None)
    }

    fn ctx(&self, state_path: &str) -> RequestContext {
        RequestContext::new("git", StateAddress::new(self.url(), "main", state_path))
    }

    /// Number of commits reachable from `main` on the remote.
    fn commits_on_main(&self) -> usize {
        let repo = git2::Repository::open_bare(self.dir.path()).unwrap();
        let mut walk = repo.revwalk().unwrap();
        walk.push_ref("refs/heads/main").unwrap();
        walk.count()
    }

    /// Bytes of `path` at the tip of `main` on the remote, if present.
    fn blob_on_main(&self, path: &str) -> Option<Vec<u8>> {
        let repo = git2::Repository::open_bare(self.dir.path()).unwrap();
        let commit = repo
            .find_reference("refs/heads/main")
            .unwrap()
            .peel_to_commit()
            .unwrap();
        let entry = commit.tree().unwrap().get_path(std::path::Path::new(path)).ok()?;
        let blob = repo.find_blob(entry.id()).unwrap();
        Some(blob.content().to_vec())
    }
}

fn acquire(backend: &Backend, ctx: &RequestContext, id: &str) {
    let mut info = LockInfo::new("OperationTypeApply", "tester@host");
    info.id = id.to_string();
    backend
        .lock_state(ctx, &serde_json::to_vec(&info).unwrap())
        .unwrap();
}

struct XorCipher(u8);

impl StateCipher for XorCipher {
    fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(plaintext.iter().map(|b| b ^ self.0).collect())
    }
    fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.encrypt(ciphertext)
    }
}

#[test]
fn absent_state_is_distinguished_from_failure() {
    let remote = StateRemote::new();
    let backend = remote.backend();

    let err = backend.get_state(&remote.ctx("prod.tfstate")).unwrap_err();
    assert!(matches!(err, BackendError::StateNotFound), "got {err:?}");
}

#[test]
fn update_then_get_returns_exact_bytes() {
    let remote = StateRemote::new();
    let backend = remote.backend();
    let ctx = remote.ctx("prod.tfstate");

    acquire(&backend, &ctx, "abc");

    let state = br#"{"version":4,"serial":7,"resources":[]}"#;
    backend
        .update_state(&ctx.clone().with_id("abc"), state)
        .unwrap();

    assert_eq!(backend.get_state(&ctx).unwrap(), state);
    // The write became a commit on the data branch.
    assert_eq!(remote.blob_on_main("prod.tfstate").unwrap(), state);
}

#[test]
fn update_without_lock_is_rejected() {
    let remote = StateRemote::new();
    let backend = remote.backend();
    let ctx = remote.ctx("prod.tfstate");

    let err = backend
        .update_state(&ctx.clone().with_id("abc"), b"{\"version\":4}")
        .unwrap_err();
    assert!(matches!(err, BackendError::LockMissing), "got {err:?}");

    assert!(remote.blob_on_main("prod.tfstate").is_none());
}

#[test]
fn successive_updates_accumulate_commits() {
    let remote = StateRemote::new();
    let backend = remote.backend();
    let ctx = remote.ctx("prod.tfstate");

    acquire(&backend, &ctx, "abc");
    let before = remote.commits_on_main();

    for serial in 1..=3u32 {
        let state = format!("{{\"version\":4,\"serial\":{serial}}}");
        backend
            .update_state(&ctx.clone().with_id("abc"), state.as_bytes())
            .unwrap();
    }

    assert_eq!(
        backend.get_state(&ctx).unwrap(),
        b"{\"version\":4,\"serial\":3}"
    );
    // One commit per update, all published to the data branch.
    assert_eq!(remote.commits_on_main(), before + 3);
}

#[test]
fn cipher_seals_at_rest_but_roundtrips_plaintext() {
    let remote = StateRemote::new();
    let backend = remote.backend_with_cipher(Some(Arc::new(XorCipher(0x5a))));
    let ctx = remote.ctx("prod.tfstate");

    acquire(&backend, &ctx, "abc");

    let state = b"{\"version\":4}";
    backend.update_state(&ctx.clone().with_id("abc"), state).unwrap();

    // What the repository stores is not the plaintext.
    let stored = remote.blob_on_main("prod.tfstate").unwrap();
    assert_ne!(stored, state.to_vec());

    // But the facade returns it.
    assert_eq!(backend.get_state(&ctx).unwrap(), state);
}

#[test]
fn state_written_by_one_backend_is_visible_to_another() {
    let remote = StateRemote::new();
    let writer = remote.backend();
    let reader = remote.backend();
    let ctx = remote.ctx("prod.tfstate");

    acquire(&writer, &ctx, "abc");
    writer
        .update_state(&ctx.clone().with_id("abc"), b"{\"version\":4}")
        .unwrap();

    // The reader has its own clone and must pull to observe the write.
    assert_eq!(reader.get_state(&ctx).unwrap(), b"{\"version\":4}");
}
