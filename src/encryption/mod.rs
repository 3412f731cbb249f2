//! encryption
//!
//! Content-transform seam for state documents.
//!
//! The storage engine never interprets state bytes; an optional cipher is
//! applied immediately before a write and immediately after a read. The
//! contract is deliberately small: `encrypt(bytes) -> bytes` and
//! `decrypt(bytes) -> bytes`, both fallible, with
//! `decrypt(encrypt(x)) == x` required of every implementation.
//!
//! No production cipher ships in the core - concrete providers are
//! external collaborators registered by the embedding process:
//!
//! ```
//! use std::sync::Arc;
//! use gitstate::encryption::{CipherRegistry, StateCipher};
//!
//! struct Passthrough;
//!
//! impl StateCipher for Passthrough {
//!     fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
//!         Ok(plaintext.to_vec())
//!     }
//!     fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
//!         Ok(ciphertext.to_vec())
//!     }
//! }
//!
//! let registry = CipherRegistry::new().register("passthrough", Arc::new(Passthrough));
//! assert!(registry.select(Some("passthrough")).is_ok());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

/// Errors from cipher selection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// Configuration named a provider nobody registered.
    #[error("unknown encryption provider {0:?}")]
    UnknownProvider(String),
}

/// A reversible transform applied to state bytes at the storage boundary.
pub trait StateCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Named cipher providers, selected by configuration.
#[derive(Default)]
pub struct CipherRegistry {
    providers: HashMap<String, Arc<dyn StateCipher>>,
}

impl CipherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `cipher` under `name`, replacing any previous registration.
    pub fn register(mut self, name: impl Into<String>, cipher: Arc<dyn StateCipher>) -> Self {
        self.providers.insert(name.into(), cipher);
        self
    }

    /// Select the configured provider.
    ///
    /// `None` means encryption is disabled; a name that was never
    /// registered is a configuration error, not a silent passthrough.
    pub fn select(
        &self,
        provider: Option<&str>,
    ) -> Result<Option<Arc<dyn StateCipher>>, CipherError> {
        match provider {
            None => Ok(None),
            Some(name) => self
                .providers
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| CipherError::UnknownProvider(name.to_string())),
        }
    }
}
