//! gitstate
//!
//! A git-backed remote-state storage engine. State documents live as files
//! on a branch of an ordinary git repository; distributed locking is
//! expressed as branch existence (`lock/<state path>` on the remote), so
//! the git server's atomic ref update is the only coordination primitive.
//!
//! # Architecture
//!
//! The crate is layered; each layer only reaches downward:
//!
//! - [`backend`] - The get/update/lock/unlock facade. Ownership checks,
//!   lock-race outcomes, and the content cipher boundary live here.
//! - [`storage`] - The [`storage::StateStorage`] contract, the router that
//!   dispatches on storage type, and the git implementation of the locking
//!   protocol.
//! - [`git`] - Repository sessions over temporary clones, the session
//!   registry that shares them per repository URL, and credential
//!   resolution. The single doorway to libgit2.
//! - [`encryption`] - The pluggable at-rest cipher seam.
//! - [`core`] - Domain types and settings shared by every layer.
//!
//! # Concurrency model
//!
//! One session per repository URL, shared through the registry. A session
//! serializes all working-copy operations behind a mutex, so two requests
//! against the same repository never interleave checkouts. Cross-process
//! safety comes from the remote: pushing a lock branch that already exists
//! is rejected atomically by the server.

pub mod backend;
pub mod core;
pub mod encryption;
pub mod git;
pub mod storage;
