//! core
//!
//! Domain types and configuration shared by every layer.

pub mod config;
pub mod types;

pub use config::{ConfigError, Identity, Settings};
pub use types::{LockInfo, RequestContext, StateAddress};
