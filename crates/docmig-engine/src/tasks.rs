//! Runs one mode end to end: snapshot, plan, report conflicts, apply, summarise.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use docmig_core::{FieldConflict, MigrationPlan, Record, RecordId, RunSummary};
use docmig_store::RecordStore;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::apply::{Applier, ApplyOptions, ApplyOutcome, InsertGuard, SkippedOp};
use crate::backfill::plan_backfill;
use crate::config::TaskFile;
use crate::dedup::{plan_dedup, DuplicateGroup};
use crate::link::{plan_links, NameIndex, Unresolved};
use crate::merge::{deletion_plan, plan_merge, retained_ids, verify_merged};
use crate::reconcile::{plan_reconciliation, verify_reconciled};
use crate::seed::plan_seed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    LinkByName,
    BackfillRole,
    MergeCollections,
    DedupeRecords,
    SeedReferences,
    BackfillDefaults,
    VerifyOnly,
}

impl Mode {
    /// Order `verify-only` previews the writing modes in.
    pub const WRITING: [Mode; 6] = [
        Mode::BackfillRole,
        Mode::DedupeRecords,
        Mode::MergeCollections,
        Mode::SeedReferences,
        Mode::LinkByName,
        Mode::BackfillDefaults,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::LinkByName => "link-by-name",
            Mode::BackfillRole => "backfill-role",
            Mode::MergeCollections => "merge-collections",
            Mode::DedupeRecords => "dedupe-records",
            Mode::SeedReferences => "seed-references",
            Mode::BackfillDefaults => "backfill-defaults",
            Mode::VerifyOnly => "verify-only",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Overwrite result fields that already hold an identifier.
    pub force_relink: bool,
    /// Fail instead of picking a winner when reference names collide.
    pub strict_names: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub mode: Mode,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub summary: RunSummary,
    pub conflicts: Vec<FieldConflict>,
    pub unresolved: Vec<Unresolved>,
    pub ambiguous: BTreeMap<String, Vec<RecordId>>,
    pub duplicates: Vec<DuplicateGroup>,
    pub skipped: Vec<SkippedOp>,
    pub already_present: Vec<RecordId>,
    /// Failure that ended the run early: connectivity lost mid-apply, or any fatal
    /// error once records had already been written.
    pub aborted: Option<String>,
    pub notes: Vec<String>,
}

impl RunOutcome {
    fn new(mode: Mode, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            mode,
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            dry_run,
            summary: RunSummary::default(),
            conflicts: Vec::new(),
            unresolved: Vec::new(),
            ambiguous: BTreeMap::new(),
            duplicates: Vec::new(),
            skipped: Vec::new(),
            already_present: Vec::new(),
            aborted: None,
            notes: Vec::new(),
        }
    }

    fn note(&mut self, note: impl Into<String>) {
        let note = note.into();
        info!(note = %note);
        self.notes.push(note);
    }

    fn record_conflicts(&mut self, conflicts: Vec<FieldConflict>) {
        for conflict in &conflicts {
            warn!(
                record = %conflict.record_id,
                field = %conflict.field,
                kept = %conflict.kept,
                discarded = %conflict.discarded,
                "conflicting values"
            );
        }
        self.summary.conflicts += conflicts.len();
        self.conflicts.extend(conflicts);
    }

    /// Folds one apply pass in and hands back the ids the store acknowledged.
    fn absorb(&mut self, outcome: ApplyOutcome) -> BTreeSet<RecordId> {
        let report = outcome.report;
        self.summary.inserted += report.inserted;
        self.summary.patched += report.patched;
        self.summary.deleted += report.deleted;
        self.summary.skipped_errors += report.skipped.len();
        self.skipped.extend(report.skipped);
        self.already_present.extend(report.already_present);
        if let Some(reason) = outcome.aborted {
            warn!(reason = %reason, "store unreachable, run aborted");
            self.aborted = Some(reason);
        }
        report.confirmed
    }

    fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} run {}", self.mode, self.run_id)?;
        if self.dry_run {
            f.write_str(" (dry run, nothing written)")?;
        }
        writeln!(f)?;
        writeln!(f, "  {}", self.summary)?;
        for note in &self.notes {
            writeln!(f, "  - {note}")?;
        }
        for unresolved in &self.unresolved {
            match &unresolved.suggestion {
                Some(hint) => writeln!(
                    f,
                    "  unresolved {}: {:?} (did you mean {:?}?)",
                    unresolved.record_id, unresolved.name, hint
                )?,
                None => writeln!(f, "  unresolved {}: {:?}", unresolved.record_id, unresolved.name)?,
            }
        }
        for group in &self.duplicates {
            writeln!(
                f,
                "  duplicate {:?}: kept {}, removed {}",
                group.key,
                group.kept,
                group.removed.join(", ")
            )?;
        }
        for skipped in &self.skipped {
            writeln!(
                f,
                "  skipped {} {}/{}: {}",
                skipped.op, skipped.collection, skipped.id, skipped.error
            )?;
        }
        if let Some(reason) = &self.aborted {
            writeln!(f, "  ABORTED: {reason}")?;
        }
        Ok(())
    }
}

pub struct Runner<'a> {
    store: &'a dyn RecordStore,
    tasks: TaskFile,
    options: RunOptions,
}

impl<'a> Runner<'a> {
    pub fn new(store: &'a dyn RecordStore, tasks: TaskFile, options: RunOptions) -> Self {
        Self { store, tasks, options }
    }

    /// Errors only on fatal conditions met before anything was written: a snapshot that
    /// cannot be read, cyclic duplicate pairs or a strict-name clash. Rejected writes,
    /// mid-run connectivity loss and fatal errors after the first write are reported
    /// inside the outcome.
    pub async fn run(&self, mode: Mode) -> Result<RunOutcome> {
        let dry_run = self.options.dry_run || mode == Mode::VerifyOnly;
        let mut out = RunOutcome::new(mode, dry_run);
        let span = info_span!("run", %mode, run_id = %out.run_id, dry_run);

        let result = async {
            info!(store = %self.store.describe(), "run started");
            if mode == Mode::VerifyOnly {
                self.run_verify(&mut out).await?;
            } else {
                self.execute(mode, &mut out).await?;
            }
            out.finished_at = Utc::now();
            info!(summary = %out.summary, aborted = out.is_aborted(), "run finished");
            Ok::<(), anyhow::Error>(())
        }
        .instrument(span.clone())
        .await;

        match result {
            Ok(()) => Ok(out),
            // Writes already landed: hand back what was done instead of losing it.
            Err(err) if !out.dry_run && out.summary.writes() > 0 => {
                let reason = format!("{err:#}");
                span.in_scope(|| {
                    warn!(reason = %reason, summary = %out.summary, "run failed after writes")
                });
                out.aborted = Some(reason);
                out.finished_at = Utc::now();
                Ok(out)
            }
            Err(err) => Err(err),
        }
    }

    async fn execute(&self, mode: Mode, out: &mut RunOutcome) -> Result<()> {
        match mode {
            Mode::BackfillRole => self.run_reconcile(out).await,
            Mode::MergeCollections => self.run_merge(out).await,
            Mode::DedupeRecords => self.run_dedup(out).await,
            Mode::LinkByName => self.run_link(out).await,
            Mode::SeedReferences => self.run_seed(out).await,
            Mode::BackfillDefaults => self.run_backfill(out).await,
            // composed by `run_verify`
            Mode::VerifyOnly => Ok(()),
        }
    }

    async fn snapshot(&self, collection: &str) -> Result<Vec<Record>> {
        let records = self
            .store
            .list_all(collection)
            .await
            .with_context(|| format!("reading snapshot of {collection}"))?;
        info!(collection, records = records.len(), "snapshot taken");
        Ok(records)
    }

    async fn apply(
        &self,
        collection: &str,
        plan: &MigrationPlan,
        insert_guard: InsertGuard,
        out: &mut RunOutcome,
    ) -> BTreeSet<RecordId> {
        if plan.is_empty() {
            return BTreeSet::new();
        }
        let options = ApplyOptions {
            dry_run: out.dry_run,
            insert_guard,
            ..ApplyOptions::default()
        };
        let outcome = Applier::new(self.store, options).apply(collection, plan).await;
        out.absorb(outcome)
    }

    async fn run_reconcile(&self, out: &mut RunOutcome) -> Result<()> {
        let task = &self.tasks.reconcile;
        let records = self.snapshot(&task.collection).await?;
        let planned = plan_reconciliation(&records, &task.pairs)
            .with_context(|| format!("reconciling {}", task.collection))?;
        out.record_conflicts(planned.conflicts);
        self.apply(&task.collection, &planned.plan, InsertGuard::Overwrite, out)
            .await;
        out.note(format!(
            "{}: {} of {} records carried legacy fields",
            task.collection,
            planned.plan.to_patch.len(),
            planned.examined
        ));

        if !out.dry_run && !out.is_aborted() {
            let after = self.snapshot(&task.collection).await?;
            let leftover = verify_reconciled(&after, &task.pairs);
            if leftover.is_empty() {
                out.note(format!("{}: no legacy field names remain", task.collection));
            } else {
                for (id, field) in &leftover {
                    warn!(id = %id, field = %field, "legacy field still present");
                }
                out.note(format!(
                    "{}: {} legacy fields still present",
                    task.collection,
                    leftover.len()
                ));
            }
        }
        Ok(())
    }

    async fn run_merge(&self, out: &mut RunOutcome) -> Result<()> {
        let task = &self.tasks.merge;
        let primary = self.snapshot(&task.primary).await?;
        let secondary = self.snapshot(&task.secondary).await?;
        let merged = plan_merge(&primary, &secondary);
        out.record_conflicts(merged.conflicts.clone());

        let confirmed = self
            .apply(&task.primary, &merged.plan, InsertGuard::Overwrite, out)
            .await;
        if out.is_aborted() {
            out.note(format!("{}: deletion phase skipped", task.secondary));
            return Ok(());
        }

        let retained = retained_ids(&merged, &confirmed);
        if !retained.is_empty() {
            warn!(count = retained.len(), "unconfirmed records stay in the secondary collection");
            out.note(format!(
                "{}: {} records kept because their merge failed: {}",
                task.secondary,
                retained.len(),
                retained.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }

        let deletions = deletion_plan(&merged, &confirmed);
        self.apply(&task.secondary, &deletions, InsertGuard::Overwrite, out)
            .await;

        if !out.dry_run && !out.is_aborted() {
            let check = verify_merged(
                &self.snapshot(&task.primary).await?,
                &self.snapshot(&task.secondary).await?,
            );
            out.note(format!(
                "{} holds {} records, {} holds {}",
                task.primary, check.primary_count, task.secondary, check.secondary_count
            ));
        }
        Ok(())
    }

    async fn run_dedup(&self, out: &mut RunOutcome) -> Result<()> {
        for task in &self.tasks.dedup {
            let records = self.snapshot(&task.collection).await?;
            let planned = plan_dedup(&records, &task.spec);
            for group in &planned.groups {
                info!(
                    key = %group.key,
                    kept = %group.kept,
                    removed = ?group.removed,
                    "duplicate records, newest kept"
                );
            }
            self.apply(&task.collection, &planned.plan, InsertGuard::Overwrite, out)
                .await;
            out.note(format!(
                "{}.{}: {} duplicate groups, {} records removed keeping the newest {} ({} without {})",
                task.collection,
                task.spec.key_field,
                planned.groups.len(),
                planned.plan.to_delete.len(),
                task.spec.timestamp_field,
                planned.without_key,
                task.spec.key_field
            ));
            out.duplicates.extend(planned.groups);
            if out.is_aborted() {
                break;
            }
        }
        Ok(())
    }

    async fn run_link(&self, out: &mut RunOutcome) -> Result<()> {
        for task in &self.tasks.links {
            let references = self.snapshot(&task.reference_collection).await?;
            let index = if self.options.strict_names {
                NameIndex::build_strict(&references, &task.name_field).with_context(|| {
                    format!("indexing {}.{}", task.reference_collection, task.name_field)
                })?
            } else {
                NameIndex::build(&references, &task.name_field)
            };
            for (name, ids) in index.ambiguities() {
                warn!(name = %name, ids = ?ids, "display name shared by several records, last one wins");
            }
            out.summary.ambiguous += index.ambiguities().len();
            out.ambiguous.extend(
                index
                    .ambiguities()
                    .iter()
                    .map(|(name, ids)| (name.clone(), ids.clone())),
            );

            let targets = self.snapshot(&task.target_collection).await?;
            let mut spec = task.spec.clone();
            spec.force_relink |= self.options.force_relink;
            let planned = plan_links(&targets, &index, &spec);
            for unresolved in &planned.unresolved {
                warn!(
                    id = %unresolved.record_id,
                    name = %unresolved.name,
                    suggestion = ?unresolved.suggestion,
                    "name not found in reference index"
                );
            }

            self.apply(&task.target_collection, &planned.plan, InsertGuard::Overwrite, out)
                .await;
            out.note(format!(
                "{}.{}: {} linked, {} already linked, {} without reference, {} out of scope, {} unresolved ({} names indexed)",
                task.target_collection,
                spec.result_field,
                planned.linked,
                planned.already_linked,
                planned.missing_reference,
                planned.out_of_scope,
                planned.unresolved.len(),
                index.len()
            ));
            out.summary.unresolved += planned.unresolved.len();
            out.unresolved.extend(planned.unresolved);
            if out.is_aborted() {
                break;
            }
        }
        Ok(())
    }

    async fn run_seed(&self, out: &mut RunOutcome) -> Result<()> {
        let Some(task) = &self.tasks.seed else {
            out.note("no seed task configured");
            return Ok(());
        };
        let references = self.snapshot(&task.reference_collection).await?;
        let targets = self.snapshot(&task.target_collection).await?;
        let seeded = plan_seed(&targets, &references, &task.spec);
        for collision in &seeded.collisions {
            warn!(id = %collision.id, names = ?collision.names, "seed id collides, not created");
        }

        let guard = match &task.spec.scope {
            Some(scope) => InsertGuard::NoMatchOn {
                first: task.spec.name_field.clone(),
                second: scope.field.clone(),
            },
            None => InsertGuard::IfAbsent,
        };
        self.apply(&task.reference_collection, &seeded.plan, guard, out)
            .await;
        out.note(format!(
            "{}: {} new names from {}, {} id collisions",
            task.reference_collection,
            seeded.plan.to_insert.len(),
            task.target_collection,
            seeded.collisions.len()
        ));
        Ok(())
    }

    async fn run_backfill(&self, out: &mut RunOutcome) -> Result<()> {
        for task in &self.tasks.backfill {
            let records = self.snapshot(&task.collection).await?;
            let plan = plan_backfill(&records, &task.defaults);
            self.apply(&task.collection, &plan, InsertGuard::Overwrite, out)
                .await;
            out.note(format!(
                "{}: {} of {} records missing default fields",
                task.collection,
                plan.to_patch.len(),
                records.len()
            ));
            if out.is_aborted() {
                break;
            }
        }
        Ok(())
    }

    /// Previews every writing mode against the current data, then checks leftovers.
    async fn run_verify(&self, out: &mut RunOutcome) -> Result<()> {
        for mode in Mode::WRITING {
            out.note(format!("preview of {mode}:"));
            self.execute(mode, out)
                .instrument(info_span!("preview", %mode))
                .await?;
        }

        let reconcile = &self.tasks.reconcile;
        let leftover = verify_reconciled(&self.snapshot(&reconcile.collection).await?, &reconcile.pairs);
        out.note(format!(
            "{}: {} legacy fields present",
            reconcile.collection,
            leftover.len()
        ));

        let merge = &self.tasks.merge;
        let check = verify_merged(
            &self.snapshot(&merge.primary).await?,
            &self.snapshot(&merge.secondary).await?,
        );
        out.note(format!(
            "{} holds {} records, {} holds {}{}",
            merge.primary,
            check.primary_count,
            merge.secondary,
            check.secondary_count,
            if check.is_complete() { " (merge complete)" } else { "" }
        ));
        Ok(())
    }
}
