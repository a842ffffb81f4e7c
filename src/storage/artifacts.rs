//! Firmware image lookup by SHA-256

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{Result, UplinkError};

/// File name of the single deployable image in a firmware directory.
pub const FIRMWARE_FILE_NAME: &str = "firmware.bin";

/// A stored firmware image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareArtifact {
    /// Lowercase hex SHA-256 of the image
    pub sha256: String,
    pub size: u64,
}

impl FirmwareArtifact {
    pub fn of(bytes: &[u8]) -> Self {
        Self { sha256: hex::encode(Sha256::digest(bytes)), size: bytes.len() as u64 }
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
    /// Find the artifact with this digest.
    async fn locate(&self, sha256: &str) -> Result<Option<FirmwareArtifact>>;
}

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<String, FirmwareArtifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, bytes: Vec<u8>) -> FirmwareArtifact {
        let artifact = FirmwareArtifact::of(&bytes);
        self.artifacts.write().await.insert(artifact.sha256.clone(), artifact.clone());
        artifact
    }

    pub async fn remove(&self, sha256: &str) -> Option<FirmwareArtifact> {
        self.artifacts.write().await.remove(sha256)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn locate(&self, sha256: &str) -> Result<Option<FirmwareArtifact>> {
        Ok(self.artifacts.read().await.get(sha256).cloned())
    }
}

/// Directory holding one `firmware.bin`; uploading a new image replaces it.
#[derive(Debug, Clone)]
pub struct DirectoryArtifactStore {
    dir: PathBuf,
}

impl DirectoryArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.join(FIRMWARE_FILE_NAME)
    }

    /// Replace the stored image.
    pub async fn publish(&self, bytes: &[u8]) -> Result<FirmwareArtifact> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|err| io_failure(&self.dir, err))?;
        let path = self.image_path();
        tokio::fs::write(&path, bytes).await.map_err(|err| io_failure(&path, err))?;
        let artifact = FirmwareArtifact::of(bytes);
        info!("Published firmware {} ({} bytes)", artifact.sha256, artifact.size);
        Ok(artifact)
    }

    /// Digest of the current image, if one exists.
    pub async fn current(&self) -> Result<Option<FirmwareArtifact>> {
        let path = self.image_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(FirmwareArtifact::of(&bytes))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_failure(&path, err)),
        }
    }
}

fn io_failure(path: &Path, err: io::Error) -> UplinkError {
    UplinkError::persistence_with_source(format!("firmware store {}", path.display()), Box::new(err))
}

#[async_trait]
impl ArtifactStore for DirectoryArtifactStore {
    async fn locate(&self, sha256: &str) -> Result<Option<FirmwareArtifact>> {
        let current = self.current().await?;
        debug!(
            "Looking up firmware {} in {}: current {:?}",
            sha256,
            self.dir.display(),
            current.as_ref().map(|artifact| &artifact.sha256)
        );
        Ok(current.filter(|artifact| artifact.sha256 == sha256))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::scratch_path;

    #[test]
    fn digest_of_known_input() {
        let artifact = FirmwareArtifact::of(b"abc");
        assert_eq!(artifact.sha256, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert_eq!(artifact.size, 3);
    }

    #[tokio::test]
    async fn memory_store_lookup() {
        let store = MemoryArtifactStore::new();
        let artifact = store.insert(vec![1, 2, 3]).await;
        assert_eq!(store.locate(&artifact.sha256).await.unwrap(), Some(artifact.clone()));
        store.remove(&artifact.sha256).await;
        assert_eq!(store.locate(&artifact.sha256).await.unwrap(), None);
    }

    #[tokio::test]
    async fn directory_store_tracks_latest_upload() {
        let dir = scratch_path("firmware-dir");
        let store = DirectoryArtifactStore::new(&dir);
        assert_eq!(store.current().await.unwrap(), None);

        let first = store.publish(b"image v1").await.unwrap();
        assert!(store.locate(&first.sha256).await.unwrap().is_some());

        let second = store.publish(b"image v2").await.unwrap();
        assert!(store.locate(&first.sha256).await.unwrap().is_none());
        assert_eq!(store.locate(&second.sha256).await.unwrap(), Some(second));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
