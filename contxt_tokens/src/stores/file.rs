//! A file-backed credential store

use std::{io, path::PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};

use super::{CredentialStore, StorageKey, StoreError};
use crate::PrimaryCredential;

/// A credential store keeping one JSON file per storage key in a directory
#[derive(Debug)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Constructs a new file store rooted at `dir`
    ///
    /// The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: StorageKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }

    async fn read_credential(&self, key: StorageKey) -> Result<Option<PrimaryCredential>, io::Error> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(self.path_for(key)).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        let credential = serde_json::from_str(&data)?;
        Ok(Some(credential))
    }

    async fn write_credential(
        &self,
        key: StorageKey,
        credential: &PrimaryCredential,
    ) -> Result<(), io::Error> {
        use tokio::io::AsyncWriteExt;

        fs::create_dir_all(&self.dir).await?;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(self.path_for(key)).await?;
        let data = serde_json::to_string_pretty(credential)?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, key: StorageKey) -> Result<Option<PrimaryCredential>, StoreError> {
        Ok(self.read_credential(key).await?)
    }

    async fn save(&self, key: StorageKey, credential: &PrimaryCredential) -> Result<(), StoreError> {
        Ok(self.write_credential(key, credential).await?)
    }

    async fn clear(&self, key: StorageKey) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
