//! Reconciliation, merge and linking engine plus the apply layer that runs plans against a store.

pub mod apply;
pub mod backfill;
pub mod config;
pub mod dedup;
pub mod link;
pub mod merge;
pub mod reconcile;
pub mod report;
pub mod seed;
pub mod tasks;

pub use apply::{ApplyOptions, ApplyOutcome, ApplyReport, Applier, SkippedOp, WriteOp};
pub use config::{EngineConfig, StoreBackend, TaskFile};
pub use dedup::{plan_dedup, DedupPlan, DedupSpec, DuplicateGroup};
pub use link::{LinkError, LinkPlan, LinkSpec, NameIndex};
pub use merge::{deletion_plan, plan_merge, verify_merged, MergePlan, MergeVerification};
pub use reconcile::{
    plan_reconciliation, reconcile, validate_pairs, verify_reconciled, DuplicatePair,
    ReconcileError, Reconciliation,
};
pub use report::write_run_report;
pub use tasks::{Mode, RunOptions, RunOutcome, Runner};

pub const CRATE_NAME: &str = "docmig-engine";
