//! An in-memory credential store

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use super::{CredentialStore, StorageKey, StoreError};
use crate::PrimaryCredential;

/// A credential store that lives only as long as the process
#[derive(Default, Debug)]
pub struct InMemoryCredentialStore {
    credentials: Mutex<HashMap<StorageKey, PrimaryCredential>>,
}

impl InMemoryCredentialStore {
    /// Constructs a new, empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    fn with_credentials<T>(
        &self,
        f: impl FnOnce(&mut HashMap<StorageKey, PrimaryCredential>) -> T,
    ) -> T {
        let mut credentials = self
            .credentials
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut credentials)
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self, key: StorageKey) -> Result<Option<PrimaryCredential>, StoreError> {
        Ok(self.with_credentials(|c| c.get(&key).cloned()))
    }

    async fn save(&self, key: StorageKey, credential: &PrimaryCredential) -> Result<(), StoreError> {
        self.with_credentials(|c| c.insert(key, credential.clone()));
        Ok(())
    }

    async fn clear(&self, key: StorageKey) -> Result<(), StoreError> {
        self.with_credentials(|c| c.remove(&key));
        Ok(())
    }
}
