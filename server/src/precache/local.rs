//! Local filesystem implementation of the BodyStore trait

use crate::precache::{BodyStore, PrecacheError};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Local filesystem-backed implementation of BodyStore
#[derive(Debug, Clone)]
pub struct LocalBodyStore {
    base_path: PathBuf,
}

impl LocalBodyStore {
    /// Create a new local body store
    ///
    /// The base_path will be created if it doesn't exist.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, PrecacheError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        info!("Initialized LocalBodyStore at {:?}", base_path);
        Ok(Self { base_path })
    }

    /// Get the filesystem path for a given hash
    ///
    /// Uses a nested directory structure: {hash[0:2]}/{hash[2:4]}/{hash[4:]}
    fn hash_to_path(&self, hash: &str) -> PathBuf {
        if hash.len() < 4 || !hash.is_ascii() {
            return self.base_path.join(hash);
        }

        self.base_path
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(&hash[4..])
    }

    /// Store data atomically using a temporary file
    ///
    /// Each write gets its own temporary file, so concurrent puts of the same
    /// hash never share one.
    fn put_atomic(&self, hash: &str, data: &[u8]) -> Result<(), PrecacheError> {
        let final_path = self.hash_to_path(hash);
        let parent = final_path.parent().unwrap_or(&self.base_path);
        fs::create_dir_all(parent)?;

        let mut temp_file = NamedTempFile::new_in(parent)?;
        temp_file.write_all(data)?;
        temp_file.persist(&final_path).map_err(|e| e.error)?;

        debug!("Stored body {} at {:?}", hash, final_path);
        Ok(())
    }
}

#[async_trait::async_trait]
impl BodyStore for LocalBodyStore {
    async fn put(&self, hash: &str, data: &[u8]) -> Result<(), PrecacheError> {
        let store = self.clone();
        let hash = hash.to_string();
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || store.put_atomic(&hash, &data))
            .await
            .map_err(|e| PrecacheError::Storage(format!("body write task failed: {}", e)))?
    }

    async fn exists(&self, hash: &str) -> Result<bool, PrecacheError> {
        Ok(tokio::fs::try_exists(self.hash_to_path(hash)).await?)
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>, PrecacheError> {
        let data = tokio::fs::read(self.hash_to_path(hash)).await?;
        Ok(data)
    }

    async fn delete(&self, hash: &str) -> Result<(), PrecacheError> {
        match tokio::fs::remove_file(self.hash_to_path(hash)).await {
            Ok(()) => {
                debug!("Deleted body {}", hash);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn storage_type(&self) -> &str {
        "local"
    }
}
