//! Content-addressed blob store.
//!
//! Layout:
//! ```text
//! {root}/{64 hex chars}   one file per layer
//! {root}/tmp/             in-progress writes, renamed into place
//! ```
//!
//! The in-memory index is rebuilt from the directory on open. Every read re-hashes
//! the blob, so a corrupted file is never handed out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::digest::LayerDigest;
use crate::scheduler::LayerAvailability;

const TMP_DIR: &str = "tmp";

#[derive(Debug, thiserror::Error)]
pub enum LayerStoreError {
    #[error("layer {0} not found")]
    NotFound(LayerDigest),

    #[error("layer {0} is corrupted on disk and was removed")]
    Corrupted(LayerDigest),

    #[error("layer bytes hash to {actual}, expected {expected}")]
    DigestMismatch {
        expected: LayerDigest,
        actual: LayerDigest,
    },

    #[error("layer store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LayerStoreError + '_ {
    move |source| LayerStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub struct LayerStore {
    root: PathBuf,
    /// digest -> blob size
    index: Mutex<HashMap<LayerDigest, u64>>,
    /// Per-digest write locks so concurrent puts of one layer write it once.
    writes: Mutex<HashMap<LayerDigest, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for LayerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerStore")
            .field("root", &self.root)
            .field("layers", &self.index.lock().len())
            .finish()
    }
}

impl LayerStore {
    /// Open (or create) a store rooted at `root` and index its contents.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, LayerStoreError> {
        let root = root.into();
        let tmp = root.join(TMP_DIR);

        // Leftovers from interrupted writes.
        if tokio::fs::try_exists(&tmp).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&tmp)
                .await
                .map_err(io_error(&tmp))?;
        }
        tokio::fs::create_dir_all(&tmp)
            .await
            .map_err(io_error(&tmp))?;

        let mut index = HashMap::new();
        let mut skipped = 0usize;
        let mut entries = tokio::fs::read_dir(&root).await.map_err(io_error(&root))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&root))? {
            let name = entry.file_name();
            let Some(digest) = name.to_str().and_then(|n| n.parse::<LayerDigest>().ok()) else {
                if name != TMP_DIR {
                    skipped += 1;
                }
                continue;
            };
            let metadata = entry.metadata().await.map_err(io_error(&entry.path()))?;
            if metadata.is_file() {
                index.insert(digest, metadata.len());
            }
        }

        tracing::info!(
            dir = %root.display(),
            layers = index.len(),
            skipped,
            "Layer store opened"
        );

        Ok(Self {
            root,
            index: Mutex::new(index),
            writes: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &LayerDigest) -> PathBuf {
        self.root.join(digest.to_string())
    }

    /// Store `data`, returning its digest. Storing identical bytes again is a no-op.
    pub async fn put(&self, data: &[u8]) -> Result<LayerDigest, LayerStoreError> {
        let digest = LayerDigest::compute(data);
        self.write_blob(digest, data).await?;
        Ok(digest)
    }

    /// Store `data` only if it hashes to `expected`.
    pub async fn put_verified(
        &self,
        expected: LayerDigest,
        data: &[u8],
    ) -> Result<(), LayerStoreError> {
        let actual = LayerDigest::compute(data);
        if actual != expected {
            return Err(LayerStoreError::DigestMismatch { expected, actual });
        }
        self.write_blob(expected, data).await
    }

    async fn write_blob(&self, digest: LayerDigest, data: &[u8]) -> Result<(), LayerStoreError> {
        if self.contains(&digest) {
            return Ok(());
        }

        let lock = self
            .writes
            .lock()
            .entry(digest)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let result = if self.contains(&digest) {
            Ok(())
        } else {
            self.write_new_blob(digest, data).await
        };

        self.writes.lock().remove(&digest);
        result
    }

    async fn write_new_blob(&self, digest: LayerDigest, data: &[u8]) -> Result<(), LayerStoreError> {
        let tmp_path = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.{}", digest, Uuid::new_v4()));
        let final_path = self.blob_path(&digest);

        let write = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp_path, &final_path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(LayerStoreError::Io {
                path: final_path,
                source: e,
            });
        }

        self.index.lock().insert(digest, data.len() as u64);
        tracing::debug!(layer = %digest.short(), bytes = data.len(), "Layer stored");
        Ok(())
    }

    /// Read a layer, verifying its digest. A corrupted blob is deleted.
    pub async fn get(&self, digest: &LayerDigest) -> Result<Vec<u8>, LayerStoreError> {
        if !self.contains(digest) {
            return Err(LayerStoreError::NotFound(*digest));
        }
        let path = self.blob_path(digest);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.index.lock().remove(digest);
                return Err(LayerStoreError::NotFound(*digest));
            }
            Err(e) => return Err(io_error(&path)(e)),
        };

        if LayerDigest::compute(&data) != *digest {
            tracing::error!(layer = %digest, path = %path.display(), "Layer failed verification, removing");
            self.index.lock().remove(digest);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(LayerStoreError::Corrupted(*digest));
        }
        Ok(data)
    }

    /// Delete a layer. Returns whether it was present.
    pub async fn remove(&self, digest: &LayerDigest) -> Result<bool, LayerStoreError> {
        if self.index.lock().remove(digest).is_none() {
            return Ok(false);
        }
        let path = self.blob_path(digest);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    pub fn contains(&self, digest: &LayerDigest) -> bool {
        self.index.lock().contains_key(digest)
    }

    pub fn size_of(&self, digest: &LayerDigest) -> Option<u64> {
        self.index.lock().get(digest).copied()
    }

    /// Every indexed layer with its size.
    pub fn entries(&self) -> Vec<(LayerDigest, u64)> {
        self.index.lock().iter().map(|(d, s)| (*d, *s)).collect()
    }

    pub fn digests(&self) -> Vec<LayerDigest> {
        self.index.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.index.lock().values().sum()
    }
}

impl LayerAvailability for LayerStore {
    fn has_layer(&self, digest: &LayerDigest) -> bool {
        self.contains(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, LayerStore) {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::open(dir.path().join("layers")).await.unwrap();
        (dir, store)
    }

    fn blob_files(store: &LayerStore) -> usize {
        std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .count()
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let (_dir, store) = store().await;
        let first = store.put(b"layer bytes").await.unwrap();
        let second = store.put(b"layer bytes").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, LayerDigest::compute(b"layer bytes"));
        assert_eq!(blob_files(&store), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&first).await.unwrap(), b"layer bytes");
    }

    #[tokio::test]
    async fn concurrent_puts_store_once() {
        let (_dir, store) = store().await;
        let store = Arc::new(store);
        let data = vec![42u8; 64 * 1024];
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let data = data.clone();
                tokio::spawn(async move { store.put(&data).await.unwrap() })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), LayerDigest::compute(&data));
        }
        assert_eq!(blob_files(&store), 1);
        let tmp_entries = std::fs::read_dir(store.root().join(TMP_DIR)).unwrap().count();
        assert_eq!(tmp_entries, 0);
    }

    #[tokio::test]
    async fn put_verified_rejects_wrong_bytes() {
        let (_dir, store) = store().await;
        let expected = LayerDigest::compute(b"right");
        let err = store.put_verified(expected, b"wrong").await.unwrap_err();
        assert!(matches!(err, LayerStoreError::DigestMismatch { .. }));
        assert!(!store.contains(&expected));

        store.put_verified(expected, b"right").await.unwrap();
        assert!(store.contains(&expected));
    }

    #[tokio::test]
    async fn missing_layer_is_not_found() {
        let (_dir, store) = store().await;
        let err = store.get(&LayerDigest::from(1u64)).await.unwrap_err();
        assert!(matches!(err, LayerStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn corrupted_blob_is_removed() {
        let (_dir, store) = store().await;
        let digest = store.put(b"pristine").await.unwrap();
        std::fs::write(store.root().join(digest.to_string()), b"tampered").unwrap();

        let err = store.get(&digest).await.unwrap_err();
        assert!(matches!(err, LayerStoreError::Corrupted(d) if d == digest));
        assert!(!store.contains(&digest));
        assert!(!store.root().join(digest.to_string()).exists());
    }

    #[tokio::test]
    async fn index_is_rebuilt_on_open() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("layers");
        let digest = {
            let store = LayerStore::open(&root).await.unwrap();
            store.put(b"persisted").await.unwrap()
        };
        std::fs::write(root.join("not-a-digest"), b"junk").unwrap();
        std::fs::write(root.join(TMP_DIR).join("partial"), b"half").unwrap();

        let store = LayerStore::open(&root).await.unwrap();
        assert_eq!(store.digests(), vec![digest]);
        assert_eq!(store.size_of(&digest), Some(9));
        assert_eq!(std::fs::read_dir(root.join(TMP_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn remove_deletes_the_file() {
        let (_dir, store) = store().await;
        let digest = store.put(b"bye").await.unwrap();
        assert!(store.remove(&digest).await.unwrap());
        assert!(!store.remove(&digest).await.unwrap());
        assert_eq!(blob_files(&store), 0);
    }
}
