//! Persistent storage for the replay counter
//!
//! [`NonceStore`] is the seam between the replay guard and wherever the last
//! accepted nonce lives. [`MemoryNonceStore`] backs tests; [`FileNonceStore`]
//! keeps `{"nonce": n}` in a JSON file and holds an exclusive file lock for
//! every read-modify-write so that concurrent writers never interleave.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Result, UplinkError};

/// Storage of the last accepted nonce.
#[async_trait]
pub trait NonceStore: Send + Sync + std::fmt::Debug {
    async fn read(&self) -> Result<u64>;

    async fn write(&self, nonce: u64) -> Result<()>;

    /// Store `new` only if the current value is still `expected`.
    ///
    /// Returns `false` without writing when another writer got there first.
    async fn compare_and_swap(&self, expected: u64, new: u64) -> Result<bool>;
}

/// Process-local nonce store.
#[derive(Debug, Default)]
pub struct MemoryNonceStore {
    value: AtomicU64,
}

impl MemoryNonceStore {
    pub fn new(initial: u64) -> Self {
        Self { value: AtomicU64::new(initial) }
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn read(&self) -> Result<u64> {
        Ok(self.value.load(Ordering::SeqCst))
    }

    async fn write(&self, nonce: u64) -> Result<()> {
        self.value.store(nonce, Ordering::SeqCst);
        Ok(())
    }

    async fn compare_and_swap(&self, expected: u64, new: u64) -> Result<bool> {
        Ok(self.value.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst).is_ok())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct NonceRecord {
    nonce: u64,
}

/// Nonce persisted in a JSON file.
///
/// In-process callers are serialized by an async mutex; other processes are
/// excluded by an advisory `flock` held for the whole read-modify-write.
#[derive(Debug, Clone)]
pub struct FileNonceStore {
    path: Arc<PathBuf>,
    gate: Arc<Mutex<()>>,
}

impl FileNonceStore {
    /// Open the store at `path`, creating it with nonce 0 if missing.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: Arc::new(path.into()), gate: Arc::new(Mutex::new(())) };
        let existed = tokio::fs::try_exists(store.path.as_path())
            .await
            .map_err(|source| store.io_error(source))?;
        if !existed {
            info!("Nonce file not found, initializing {} with nonce 0", store.path.display());
        }
        // Forces creation and validates existing content
        let current = store.locked(|current| Ok((current, None))).await?;
        debug!("Nonce store {} at {}", store.path.display(), current);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> UplinkError {
        UplinkError::NonceFile { path: self.path.to_path_buf(), source }
    }

    /// Run `update` on the current value under both locks.
    ///
    /// `update` returns its result and, optionally, the value to store.
    async fn locked<T, F>(&self, update: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(u64) -> io::Result<(T, Option<u64>)> + Send + 'static,
    {
        let _guard = self.gate.lock().await;
        let path = Arc::clone(&self.path);
        let outcome = tokio::task::spawn_blocking(move || update_locked_file(&path, update))
            .await
            .map_err(|join| self.io_error(io::Error::other(join)))?;
        outcome.map_err(|source| self.io_error(source))
    }
}

fn update_locked_file<T>(
    path: &Path,
    update: impl FnOnce(u64) -> io::Result<(T, Option<u64>)>,
) -> io::Result<T> {
    let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
    FileExt::lock_exclusive(&file)?;
    let result = read_then_write(&mut file, update);
    FileExt::unlock(&file)?;
    result
}

fn read_then_write<T>(
    file: &mut File,
    update: impl FnOnce(u64) -> io::Result<(T, Option<u64>)>,
) -> io::Result<T> {
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let (current, needs_init) = if contents.trim().is_empty() {
        (0, true)
    } else {
        let record: NonceRecord = serde_json::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        (record.nonce, false)
    };

    let (result, next) = update(current)?;
    let next = next.or(needs_init.then_some(current));

    if let Some(nonce) = next {
        let json = serde_json::to_string(&NonceRecord { nonce })
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    Ok(result)
}

#[async_trait]
impl NonceStore for FileNonceStore {
    async fn read(&self) -> Result<u64> {
        self.locked(|current| Ok((current, None))).await
    }

    async fn write(&self, nonce: u64) -> Result<()> {
        self.locked(move |_| Ok(((), Some(nonce)))).await
    }

    async fn compare_and_swap(&self, expected: u64, new: u64) -> Result<bool> {
        self.locked(move |current| {
            if current == expected { Ok((true, Some(new))) } else { Ok((false, None)) }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::scratch_path;

    #[tokio::test]
    async fn memory_store_compare_and_swap() {
        let store = MemoryNonceStore::new(5);
        assert!(!store.compare_and_swap(4, 9).await.unwrap());
        assert_eq!(store.read().await.unwrap(), 5);
        assert!(store.compare_and_swap(5, 9).await.unwrap());
        assert_eq!(store.read().await.unwrap(), 9);
        store.write(1).await.unwrap();
        assert_eq!(store.read().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn file_store_initializes_missing_file() {
        let path = scratch_path("nonce-init.json");
        let store = FileNonceStore::open(&path).await.unwrap();
        assert_eq!(store.read().await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), r#"{"nonce":0}"#);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let path = scratch_path("nonce-persist.json");
        {
            let store = FileNonceStore::open(&path).await.unwrap();
            store.write(41).await.unwrap();
            assert!(store.compare_and_swap(41, 42).await.unwrap());
            assert!(!store.compare_and_swap(41, 43).await.unwrap());
        }
        let reopened = FileNonceStore::open(&path).await.unwrap();
        assert_eq!(reopened.read().await.unwrap(), 42);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn file_store_reports_corrupt_content() {
        let path = scratch_path("nonce-corrupt.json");
        std::fs::write(&path, "not json").unwrap();
        let err = FileNonceStore::open(&path).await.unwrap_err();
        assert!(matches!(err, UplinkError::NonceFile { .. }));
        assert!(err.is_retryable());
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_never_interleave() {
        let path = scratch_path("nonce-concurrent.json");
        let store = FileNonceStore::open(&path).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut wins = 0;
                for _ in 0..10 {
                    loop {
                        let current = store.read().await.unwrap();
                        if store.compare_and_swap(current, current + 1).await.unwrap() {
                            wins += 1;
                            break;
                        }
                    }
                }
                wins
            }));
        }

        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }
        assert_eq!(total, 80);
        assert_eq!(store.read().await.unwrap(), 80);
        std::fs::remove_file(&path).unwrap();
    }
}
