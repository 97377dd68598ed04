//! Persistence for primary credentials
//!
//! Interactive sessions keep their primary credential across restarts. Each
//! session kind reads and writes under its own [`StorageKey`].

use std::error;

use async_trait::async_trait;

use crate::PrimaryCredential;

#[cfg(feature = "file")]
pub mod file;
pub mod in_memory;

#[cfg(feature = "file")]
pub use file::FileCredentialStore;
pub use in_memory::InMemoryCredentialStore;

/// The key a session kind persists its credential under
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StorageKey(&'static str);

impl StorageKey {
    /// Storage used by browser sessions
    pub const WEB: StorageKey = StorageKey("contxt.auth.web");
    /// Storage used by native sessions
    pub const NATIVE: StorageKey = StorageKey("contxt.auth.native");

    /// The key as a string
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

/// An error reading or writing persisted credentials
pub type StoreError = Box<dyn error::Error + Send + Sync + 'static>;

/// An asynchronous store for primary credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Loads the credential stored under `key`, if any
    async fn load(&self, key: StorageKey) -> Result<Option<PrimaryCredential>, StoreError>;

    /// Persists a credential under `key`, replacing any previous one
    async fn save(&self, key: StorageKey, credential: &PrimaryCredential) -> Result<(), StoreError>;

    /// Removes the credential stored under `key`
    ///
    /// Removing a missing credential succeeds.
    async fn clear(&self, key: StorageKey) -> Result<(), StoreError>;
}
