use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use docmig_core::{apply_patch, FieldMap, PatchMap, Record, RecordId, Value};
use tokio::sync::RwLock;

use crate::{RecordStore, StoreError, MAX_BATCH_WRITES};

/// Whole-store contents: collection name -> record id -> fields.
pub type Snapshot = BTreeMap<String, BTreeMap<RecordId, FieldMap>>;

/// In-process store used for tests, dry runs and as the engine behind [`crate::JsonFileStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<Snapshot>,
    failing_ids: BTreeSet<RecordId>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            collections: RwLock::new(snapshot),
            ..Self::default()
        }
    }

    pub fn with_collection<I>(mut self, collection: &str, records: I) -> Self
    where
        I: IntoIterator<Item = (RecordId, FieldMap)>,
    {
        self.collections
            .get_mut()
            .entry(collection.to_string())
            .or_default()
            .extend(records);
        self
    }

    /// Every write touching `id` is rejected, in any collection.
    pub fn failing_writes_for(mut self, id: impl Into<RecordId>) -> Self {
        self.failing_ids.insert(id.into());
        self
    }

    /// Simulates a lost connection: every call fails with [`StoreError::Connectivity`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.collections.read().await.clone()
    }

    /// Puts back a state captured with [`MemoryStore::snapshot`].
    pub(crate) async fn restore(&self, snapshot: Snapshot) {
        *self.collections.write().await = snapshot;
    }

    pub async fn collection(&self, name: &str) -> BTreeMap<RecordId, FieldMap> {
        self.collections
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connectivity("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self, id: &str) -> Result<(), StoreError> {
        self.check_online()?;
        if self.failing_ids.contains(id) {
            return Err(StoreError::Rejected {
                status: 403,
                message: format!("write to {id} denied"),
            });
        }
        Ok(())
    }
}

fn resolve_timestamps(fields: &mut FieldMap) {
    let now = Utc::now();
    fields
        .values_mut()
        .for_each(|value| value.resolve_server_timestamps(now));
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn list_all(&self, collection: &str) -> Result<Vec<Record>, StoreError> {
        self.check_online()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .map(|(id, fields)| Record::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<FieldMap>, StoreError> {
        self.check_online()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned())
    }

    async fn set(&self, collection: &str, id: &str, fields: &FieldMap) -> Result<(), StoreError> {
        self.check_writable(id)?;
        let mut fields = fields.clone();
        resolve_timestamps(&mut fields);
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
        Ok(())
    }

    async fn patch(&self, collection: &str, id: &str, patch: &PatchMap) -> Result<(), StoreError> {
        self.check_writable(id)?;
        let mut collections = self.collections.write().await;
        let Some(fields) = collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
        else {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        apply_patch(fields, patch);
        resolve_timestamps(fields);
        Ok(())
    }

    async fn delete_many(&self, collection: &str, ids: &[RecordId]) -> Result<usize, StoreError> {
        if ids.len() > MAX_BATCH_WRITES {
            return Err(StoreError::BatchTooLarge {
                len: ids.len(),
                max: MAX_BATCH_WRITES,
            });
        }
        // All-or-nothing: validate the whole batch before removing anything.
        for id in ids {
            self.check_writable(id)?;
        }
        let mut collections = self.collections.write().await;
        let removed = match collections.get_mut(collection) {
            Some(records) => ids.iter().filter(|id| records.remove(*id).is_some()).count(),
            None => 0,
        };
        Ok(removed)
    }

    async fn query_by_equality_pair(
        &self,
        collection: &str,
        first: (&str, &Value),
        second: (&str, &Value),
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        self.check_online()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, fields)| {
                        fields.get(first.0) == Some(first.1) && fields.get(second.0) == Some(second.1)
                    })
                    .take(limit)
                    .map(|(id, fields)| Record::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmig_core::{fields, FieldPatch};

    fn store() -> MemoryStore {
        MemoryStore::new().with_collection(
            "usuarios",
            [
                ("u1".to_string(), fields([("rol", "admin"), ("organizacionId", "org-1")])),
                ("u2".to_string(), fields([("rol", "viewer"), ("organizacionId", "org-1")])),
            ],
        )
    }

    #[tokio::test]
    async fn patch_merges_unsets_and_stamps() {
        let store = store();
        let mut patch = PatchMap::new();
        patch.insert("rol".into(), FieldPatch::Unset);
        patch.insert("actualizado".into(), FieldPatch::Set(Value::ServerTimestamp));
        store.patch("usuarios", "u1", &patch).await.expect("patch");

        let u1 = store.get("usuarios", "u1").await.expect("get").expect("exists");
        assert!(!u1.contains_key("rol"));
        assert!(matches!(u1.get("actualizado"), Some(Value::Timestamp(_))));
        assert_eq!(u1.get("organizacionId"), Some(&Value::from("org-1")));
    }

    #[tokio::test]
    async fn patch_of_missing_record_is_not_found() {
        let store = store();
        let err = store
            .patch("usuarios", "ghost", &PatchMap::new())
            .await
            .expect_err("missing record");
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_many_is_all_or_nothing() {
        let store = store().failing_writes_for("u2");
        let ids = vec!["u1".to_string(), "u2".to_string()];
        assert!(store.delete_many("usuarios", &ids).await.is_err());
        assert_eq!(store.collection("usuarios").await.len(), 2);

        let committed = store
            .delete_many("usuarios", &ids[..1])
            .await
            .expect("delete u1");
        assert_eq!(committed, 1);
        assert_eq!(store.collection("usuarios").await.len(), 1);
    }

    #[tokio::test]
    async fn delete_many_counts_only_records_it_removed() {
        let store = store();
        let ids = vec!["u1".to_string(), "ghost".to_string()];
        assert_eq!(store.delete_many("usuarios", &ids).await.expect("delete"), 1);
        assert_eq!(store.delete_many("usuarios", &ids).await.expect("again"), 0);
        assert_eq!(store.delete_many("missing", &ids).await.expect("no collection"), 0);
        assert_eq!(store.collection("usuarios").await.len(), 1);
    }

    #[tokio::test]
    async fn equality_pair_query_honours_limit() {
        let store = store();
        let hits = store
            .query_by_equality_pair(
                "usuarios",
                ("organizacionId", &Value::from("org-1")),
                ("rol", &Value::from("viewer")),
                5,
            )
            .await
            .expect("query");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "u2");

        let limited = store
            .query_by_equality_pair(
                "usuarios",
                ("organizacionId", &Value::from("org-1")),
                ("organizacionId", &Value::from("org-1")),
                1,
            )
            .await
            .expect("query");
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn offline_store_reports_connectivity() {
        let store = store();
        store.set_offline(true);
        let err = store.list_all("usuarios").await.expect_err("offline");
        assert!(err.is_connectivity());
    }
}
