use std::path::{Path, PathBuf};

use async_trait::async_trait;
use docmig_core::{FieldMap, PatchMap, Record, RecordId, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::memory::{MemoryStore, Snapshot};
use crate::{RecordStore, StoreError};

/// [`MemoryStore`] persisted to one JSON snapshot file, rewritten atomically after every mutation.
/// A mutation that cannot be written to disk is rolled back in memory as well.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Loads `path` if it exists; a missing file starts an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let snapshot: Snapshot = match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| StoreError::Codec(format!("parsing {}: {e}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Snapshot::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            inner: MemoryStore::from_snapshot(snapshot),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Caller holds `write_lock`. On failure the in-memory state goes back to `before`.
    async fn persist_or_restore(&self, before: Snapshot) -> Result<(), StoreError> {
        if let Err(err) = self.persist().await {
            warn!(path = %self.path.display(), error = %err, "snapshot not written, mutation rolled back");
            self.inner.restore(before).await;
            return Err(err);
        }
        Ok(())
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let snapshot = self.inner.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| StoreError::Codec(format!("serializing snapshot: {e}")))?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn list_all(&self, collection: &str) -> Result<Vec<Record>, StoreError> {
        self.inner.list_all(collection).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<FieldMap>, StoreError> {
        self.inner.get(collection, id).await
    }

    async fn set(&self, collection: &str, id: &str, fields: &FieldMap) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.snapshot().await;
        self.inner.set(collection, id, fields).await?;
        self.persist_or_restore(before).await
    }

    async fn patch(&self, collection: &str, id: &str, patch: &PatchMap) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.snapshot().await;
        self.inner.patch(collection, id, patch).await?;
        self.persist_or_restore(before).await
    }

    async fn delete_many(&self, collection: &str, ids: &[RecordId]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.snapshot().await;
        let committed = self.inner.delete_many(collection, ids).await?;
        self.persist_or_restore(before).await?;
        Ok(committed)
    }

    async fn query_by_equality_pair(
        &self,
        collection: &str,
        first: (&str, &Value),
        second: (&str, &Value),
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        self.inner
            .query_by_equality_pair(collection, first, second, limit)
            .await
    }
}
