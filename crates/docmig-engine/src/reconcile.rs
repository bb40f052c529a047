//! Field Reconciler: folds legacy field names into their canonical names.

use std::collections::{BTreeMap, BTreeSet};

use docmig_core::{FieldConflict, FieldMap, FieldPatch, MigrationPlan, PatchMap, Record, RecordId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("duplicate pairs rename {field:?} back onto itself")]
    CyclicPairs { field: String },
}

/// A field that drifted to two names; `legacy` is retired in favour of `canonical`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub legacy: String,
    pub canonical: String,
}

impl DuplicatePair {
    pub fn new(legacy: impl Into<String>, canonical: impl Into<String>) -> Self {
        Self {
            legacy: legacy.into(),
            canonical: canonical.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// Input fields with every legacy name folded away.
    pub canonical_fields: FieldMap,
    /// Legacy names present on the input.
    pub fields_to_unset: BTreeSet<String>,
    /// Canonical names that were absent and got the legacy value.
    pub filled: BTreeSet<String>,
    pub conflicts: Vec<FieldConflict>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.fields_to_unset.is_empty()
    }

    /// The store update that realises this reconciliation: conditional sets plus unsets.
    pub fn to_patch(&self) -> PatchMap {
        let mut patch = PatchMap::new();
        for name in &self.filled {
            if let Some(value) = self.canonical_fields.get(name) {
                patch.insert(name.clone(), FieldPatch::Set(value.clone()));
            }
        }
        for legacy in &self.fields_to_unset {
            patch.insert(legacy.clone(), FieldPatch::Unset);
        }
        patch
    }
}

/// Rejects pair lists whose renames loop back (`a -> b`, `b -> a`), which have no canonical name.
pub fn validate_pairs(pairs: &[DuplicatePair]) -> Result<(), ReconcileError> {
    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for pair in pairs.iter().filter(|pair| pair.legacy != pair.canonical) {
        edges
            .entry(pair.legacy.as_str())
            .or_default()
            .push(pair.canonical.as_str());
    }

    for &start in edges.keys() {
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(name) = stack.pop() {
            for &next in edges.get(name).into_iter().flatten() {
                if next == start {
                    return Err(ReconcileError::CyclicPairs {
                        field: start.to_string(),
                    });
                }
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
    }
    Ok(())
}

/// Pure: never touches a store. Pairs apply in order, so when two legacy names
/// feed one canonical name the first one present wins. Passes repeat until no
/// legacy name is left, so chained pairs resolve whatever order they are listed in.
pub fn reconcile(record_id: &str, fields: &FieldMap, pairs: &[DuplicatePair]) -> Reconciliation {
    let mut out = Reconciliation {
        canonical_fields: fields.clone(),
        ..Reconciliation::default()
    };

    // Bounded for cyclic pair lists, which `validate_pairs` rejects upstream.
    for _ in 0..=pairs.len() {
        let mut changed = false;
        for pair in pairs {
            if pair.legacy == pair.canonical {
                continue;
            }
            let Some(legacy_value) = out.canonical_fields.remove(&pair.legacy) else {
                continue;
            };
            changed = true;

            match out.canonical_fields.get(&pair.canonical) {
                None => {
                    out.canonical_fields
                        .insert(pair.canonical.clone(), legacy_value);
                }
                Some(current) if *current != legacy_value => {
                    out.conflicts.push(FieldConflict {
                        record_id: record_id.to_string(),
                        field: pair.legacy.clone(),
                        kept: current.clone(),
                        discarded: legacy_value,
                    });
                }
                Some(_) => {}
            }

            if fields.contains_key(&pair.legacy) {
                out.fields_to_unset.insert(pair.legacy.clone());
            }
        }
        if !changed {
            break;
        }
    }

    // Existing values are never overwritten, so anything new came from a legacy name.
    out.filled = out
        .canonical_fields
        .keys()
        .filter(|name| !fields.contains_key(*name))
        .cloned()
        .collect();
    out
}

#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub plan: MigrationPlan,
    pub conflicts: Vec<FieldConflict>,
    pub examined: usize,
}

/// Runs [`reconcile`] over a snapshot and folds every non-empty patch into one plan.
pub fn plan_reconciliation(
    records: &[Record],
    pairs: &[DuplicatePair],
) -> Result<ReconcilePlan, ReconcileError> {
    validate_pairs(pairs)?;
    let mut out = ReconcilePlan {
        examined: records.len(),
        ..ReconcilePlan::default()
    };
    for record in records {
        let result = reconcile(&record.id, &record.fields, pairs);
        if result.is_noop() {
            continue;
        }
        out.plan.patch(record.id.clone(), result.to_patch());
        out.conflicts.extend(result.conflicts);
    }
    Ok(out)
}

/// Legacy names still present after a pass, as `(record id, legacy name)`.
pub fn verify_reconciled(records: &[Record], pairs: &[DuplicatePair]) -> Vec<(RecordId, String)> {
    records
        .iter()
        .flat_map(|record| {
            pairs
                .iter()
                .filter(|pair| pair.legacy != pair.canonical && record.fields.contains_key(&pair.legacy))
                .map(|pair| (record.id.clone(), pair.legacy.clone()))
        })
        .collect()
}
