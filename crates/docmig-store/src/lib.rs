//! Record Store Adapter: the only layer that talks to a document database.

use async_trait::async_trait;
use docmig_core::{FieldMap, PatchMap, Record, RecordId, Value};
use thiserror::Error;

mod file;
mod firestore;
mod memory;

pub use file::JsonFileStore;
pub use firestore::{
    classify_reqwest_error, classify_status, BackoffPolicy, FirestoreConfig, FirestoreRestStore,
    RetryDisposition,
};
pub use memory::{MemoryStore, Snapshot};

pub const CRATE_NAME: &str = "docmig-store";

/// Upper bound on writes in one atomic commit.
pub const MAX_BATCH_WRITES: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },
    #[error("store unreachable: {0}")]
    Connectivity(String),
    #[error("store rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("batch of {len} writes exceeds the {max} write limit")]
    BatchTooLarge { len: usize, max: usize },
    #[error("codec error: {0}")]
    Codec(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl StoreError {
    /// Connectivity and auth failures end the run; everything else is per-record.
    pub fn is_connectivity(&self) -> bool {
        match self {
            StoreError::Connectivity(_) => true,
            StoreError::Http(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }
}

/// Narrow interface over a document database collection namespace.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short human-readable name for logs.
    fn describe(&self) -> String;

    async fn list_all(&self, collection: &str) -> Result<Vec<Record>, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<FieldMap>, StoreError>;

    /// Full overwrite; creates the record when missing.
    async fn set(&self, collection: &str, id: &str, fields: &FieldMap) -> Result<(), StoreError>;

    /// Merge-update of an existing record. Fails with [`StoreError::NotFound`] when absent.
    async fn patch(&self, collection: &str, id: &str, patch: &PatchMap) -> Result<(), StoreError>;

    /// Deletes all `ids` in one atomic commit. Returns how many records were removed;
    /// backends that cannot tell a missing id from a removed one count every id.
    async fn delete_many(&self, collection: &str, ids: &[RecordId]) -> Result<usize, StoreError>;

    async fn query_by_equality_pair(
        &self,
        collection: &str,
        first: (&str, &Value),
        second: (&str, &Value),
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;
}
