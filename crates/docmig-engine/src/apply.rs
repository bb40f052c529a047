//! Apply layer: executes a [`MigrationPlan`] against one collection, one record at a time.
//!
//! A rejected write is logged, counted and skipped; the pass continues. Only a
//! connectivity failure stops the pass, and even then the partial report is returned.

use std::collections::BTreeSet;
use std::fmt;

use docmig_core::{FieldMap, MigrationPlan, RecordId};
use docmig_store::{RecordStore, StoreError, MAX_BATCH_WRITES};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    Insert,
    Patch,
    Delete,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteOp::Insert => "insert",
            WriteOp::Patch => "patch",
            WriteOp::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedOp {
    pub collection: String,
    pub id: RecordId,
    pub op: WriteOp,
    pub error: String,
}

/// What to check before an insert is issued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InsertGuard {
    /// Plain `set`; the snapshot already established absence.
    #[default]
    Overwrite,
    /// Skip when a record with the same id exists.
    IfAbsent,
    /// Skip when any record matches the inserted values of both fields.
    NoMatchOn { first: String, second: String },
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub dry_run: bool,
    pub insert_guard: InsertGuard,
    pub delete_batch_size: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            insert_guard: InsertGuard::Overwrite,
            delete_batch_size: MAX_BATCH_WRITES,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub inserted: usize,
    pub patched: usize,
    pub deleted: usize,
    /// Inserts dropped by the guard because the record already exists.
    pub already_present: Vec<RecordId>,
    pub skipped: Vec<SkippedOp>,
    /// Ids whose write was acknowledged by the store (all planned ids on a dry run).
    #[serde(skip)]
    pub confirmed: BTreeSet<RecordId>,
    pub dry_run: bool,
}

impl ApplyReport {
    fn skip(&mut self, collection: &str, id: &str, op: WriteOp, err: &StoreError) {
        warn!(collection, id, %op, error = %err, "write rejected, skipping record");
        self.skipped.push(SkippedOp {
            collection: collection.to_string(),
            id: id.to_string(),
            op,
            error: err.to_string(),
        });
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub report: ApplyReport,
    /// Set when a connectivity failure stopped the pass early.
    pub aborted: Option<String>,
}

pub struct Applier<'a> {
    store: &'a dyn RecordStore,
    options: ApplyOptions,
}

enum Step {
    Continue,
    Abort(String),
}

impl<'a> Applier<'a> {
    pub fn new(store: &'a dyn RecordStore, options: ApplyOptions) -> Self {
        Self { store, options }
    }

    pub async fn apply(&self, collection: &str, plan: &MigrationPlan) -> ApplyOutcome {
        let span = info_span!("apply", collection, store = %self.store.describe(), dry_run = self.options.dry_run);
        async {
            let mut outcome = ApplyOutcome {
                report: ApplyReport {
                    dry_run: self.options.dry_run,
                    ..ApplyReport::default()
                },
                aborted: None,
            };
            if self.options.dry_run {
                self.preview(collection, plan, &mut outcome.report);
                return outcome;
            }

            for (id, fields) in &plan.to_insert {
                if let Step::Abort(reason) = self.insert(collection, id, fields, &mut outcome.report).await {
                    outcome.aborted = Some(reason);
                    return outcome;
                }
            }

            for (id, patch) in &plan.to_patch {
                match self.store.patch(collection, id, patch).await {
                    Ok(()) => {
                        debug!(id = %id, fields = patch.len(), "patched");
                        outcome.report.patched += 1;
                        outcome.report.confirmed.insert(id.clone());
                    }
                    Err(err) if err.is_connectivity() => {
                        outcome.aborted = Some(err.to_string());
                        return outcome;
                    }
                    Err(err) => outcome.report.skip(collection, id, WriteOp::Patch, &err),
                }
            }

            let ids: Vec<RecordId> = plan.to_delete.iter().cloned().collect();
            let batch_size = self.options.delete_batch_size.clamp(1, MAX_BATCH_WRITES);
            for chunk in ids.chunks(batch_size) {
                match self.store.delete_many(collection, chunk).await {
                    Ok(committed) => {
                        debug!(committed, "delete batch committed");
                        outcome.report.deleted += committed;
                        outcome.report.confirmed.extend(chunk.iter().cloned());
                    }
                    Err(err) if err.is_connectivity() => {
                        outcome.aborted = Some(err.to_string());
                        return outcome;
                    }
                    Err(err) => {
                        for id in chunk {
                            outcome.report.skip(collection, id, WriteOp::Delete, &err);
                        }
                    }
                }
            }

            info!(
                inserted = outcome.report.inserted,
                patched = outcome.report.patched,
                deleted = outcome.report.deleted,
                skipped = outcome.report.skipped.len(),
                "plan applied"
            );
            outcome
        }
        .instrument(span)
        .await
    }

    async fn insert(&self, collection: &str, id: &str, fields: &FieldMap, report: &mut ApplyReport) -> Step {
        match self.exists(collection, id, fields).await {
            Ok(true) => {
                info!(id, "record already present, insert skipped");
                report.already_present.push(id.to_string());
                return Step::Continue;
            }
            Ok(false) => {}
            Err(err) if err.is_connectivity() => return Step::Abort(err.to_string()),
            Err(err) => {
                report.skip(collection, id, WriteOp::Insert, &err);
                return Step::Continue;
            }
        }

        match self.store.set(collection, id, fields).await {
            Ok(()) => {
                debug!(id, "inserted");
                report.inserted += 1;
                report.confirmed.insert(id.to_string());
                Step::Continue
            }
            Err(err) if err.is_connectivity() => Step::Abort(err.to_string()),
            Err(err) => {
                report.skip(collection, id, WriteOp::Insert, &err);
                Step::Continue
            }
        }
    }

    async fn exists(&self, collection: &str, id: &str, fields: &FieldMap) -> Result<bool, StoreError> {
        match &self.options.insert_guard {
            InsertGuard::Overwrite => Ok(false),
            InsertGuard::IfAbsent => Ok(self.store.get(collection, id).await?.is_some()),
            InsertGuard::NoMatchOn { first, second } => match (fields.get(first), fields.get(second)) {
                (Some(a), Some(b)) => Ok(!self
                    .store
                    .query_by_equality_pair(collection, (first.as_str(), a), (second.as_str(), b), 1)
                    .await?
                    .is_empty()),
                _ => Ok(self.store.get(collection, id).await?.is_some()),
            },
        }
    }

    fn preview(&self, collection: &str, plan: &MigrationPlan, report: &mut ApplyReport) {
        for (id, fields) in &plan.to_insert {
            info!(collection, id = %id, fields = fields.len(), "would insert");
        }
        for (id, patch) in &plan.to_patch {
            let names = patch.keys().cloned().collect::<Vec<_>>().join(",");
            info!(collection, id = %id, fields = %names, "would patch");
        }
        if !plan.to_delete.is_empty() {
            info!(collection, count = plan.to_delete.len(), "would delete");
        }
        report.inserted = plan.to_insert.len();
        report.patched = plan.to_patch.len();
        report.deleted = plan.to_delete.len();
        report.confirmed = plan
            .to_insert
            .keys()
            .chain(plan.to_patch.keys())
            .chain(plan.to_delete.iter())
            .cloned()
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmig_core::{fields, FieldPatch, PatchMap, Value};
    use docmig_store::MemoryStore;

    fn plan() -> MigrationPlan {
        let mut plan = MigrationPlan::new();
        plan.insert("u2", fields([("nombre", "Jane")]));
        plan.insert("u3", fields([("nombre", "Rodrigo")]));
        let mut patch = PatchMap::new();
        patch.insert("organizacionId".into(), FieldPatch::set("ACME"));
        plan.patch("u1", patch);
        plan
    }

    fn store() -> MemoryStore {
        MemoryStore::new().with_collection(
            "users",
            [("u1".to_string(), fields([("rol", "admin")]))],
        )
    }

    #[tokio::test]
    async fn rejected_writes_are_skipped_and_the_pass_continues() {
        let store = store().failing_writes_for("u2");
        let outcome = Applier::new(&store, ApplyOptions::default())
            .apply("users", &plan())
            .await;

        assert!(outcome.aborted.is_none());
        assert_eq!(outcome.report.inserted, 1);
        assert_eq!(outcome.report.patched, 1);
        assert_eq!(outcome.report.skipped.len(), 1);
        assert_eq!(outcome.report.skipped[0].id, "u2");
        assert_eq!(outcome.report.skipped[0].op, WriteOp::Insert);
        assert!(!outcome.report.confirmed.contains("u2"));
        assert!(outcome.report.confirmed.contains("u3"));

        let users = store.collection("users").await;
        assert_eq!(users["u1"].get("organizacionId"), Some(&Value::from("ACME")));
        assert!(!users.contains_key("u2"));
    }

    #[tokio::test]
    async fn patch_of_vanished_record_is_skipped() {
        let store = MemoryStore::new();
        let outcome = Applier::new(&store, ApplyOptions::default())
            .apply("users", &plan())
            .await;
        assert_eq!(outcome.report.patched, 0);
        assert_eq!(outcome.report.skipped.len(), 1);
        assert_eq!(outcome.report.skipped[0].op, WriteOp::Patch);
    }

    #[tokio::test]
    async fn connectivity_loss_aborts_with_partial_report() {
        let store = store();
        store.set_offline(true);
        let outcome = Applier::new(&store, ApplyOptions::default())
            .apply("users", &plan())
            .await;
        assert!(outcome.aborted.is_some());
        assert_eq!(outcome.report.inserted, 0);
        assert!(outcome.report.skipped.is_empty());
    }

    #[tokio::test]
    async fn deletes_are_batched_and_failed_batches_skipped() {
        let store = MemoryStore::new()
            .with_collection(
                "usuarios",
                (1..=5).map(|i| (format!("u{i}"), fields([("n", i as i64)]))),
            )
            .failing_writes_for("u4");
        let mut plan = MigrationPlan::new();
        for i in 1..=5 {
            plan.delete(format!("u{i}"));
        }
        let options = ApplyOptions {
            delete_batch_size: 2,
            ..ApplyOptions::default()
        };
        let outcome = Applier::new(&store, options).apply("usuarios", &plan).await;

        // Batches: [u1,u2] ok, [u3,u4] rejected whole, [u5] ok.
        assert_eq!(outcome.report.deleted, 3);
        assert_eq!(outcome.report.skipped.len(), 2);
        let left = store.collection("usuarios").await;
        assert_eq!(left.keys().cloned().collect::<Vec<_>>(), vec!["u3", "u4"]);
    }

    #[tokio::test]
    async fn guarded_insert_skips_existing_records() {
        let store = MemoryStore::new().with_collection(
            "organizaciones",
            [(
                "beta".to_string(),
                fields([("nombre", "Beta Partners"), ("organizacionId", "MEIK LABS")]),
            )],
        );
        let mut plan = MigrationPlan::new();
        plan.insert(
            "beta-partners",
            fields([("nombre", "Beta Partners"), ("organizacionId", "MEIK LABS")]),
        );
        plan.insert(
            "gamma",
            fields([("nombre", "Gamma"), ("organizacionId", "MEIK LABS")]),
        );
        let options = ApplyOptions {
            insert_guard: InsertGuard::NoMatchOn {
                first: "nombre".into(),
                second: "organizacionId".into(),
            },
            ..ApplyOptions::default()
        };
        let outcome = Applier::new(&store, options).apply("organizaciones", &plan).await;

        assert_eq!(outcome.report.inserted, 1);
        assert_eq!(outcome.report.already_present, vec!["beta-partners".to_string()]);
        assert!(!store.collection("organizaciones").await.contains_key("beta-partners"));
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let store = store();
        let options = ApplyOptions {
            dry_run: true,
            ..ApplyOptions::default()
        };
        let outcome = Applier::new(&store, options).apply("users", &plan()).await;

        assert!(outcome.report.dry_run);
        assert_eq!(outcome.report.inserted, 2);
        assert_eq!(outcome.report.patched, 1);
        assert_eq!(store.collection("users").await.len(), 1);
    }
}
