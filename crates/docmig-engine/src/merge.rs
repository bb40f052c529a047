//! Collection Merger: absorbs a secondary collection into a primary one.
//!
//! Phase one (`plan_merge`) proposes inserts and field patches against the
//! primary collection. Phase two (`deletion_plan`) is computed only after
//! phase one was applied, from the ids the apply layer confirmed.

use std::collections::{BTreeMap, BTreeSet};

use docmig_core::{FieldConflict, FieldMap, FieldPatch, MigrationPlan, PatchMap, Record, RecordId};
use serde::Serialize;

#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    /// Inserts and patches against the primary collection.
    pub plan: MigrationPlan,
    /// Populated primary fields that secondary disagreed with; primary was kept.
    pub conflicts: Vec<FieldConflict>,
    /// Shared ids where primary already had everything secondary offered.
    pub untouched: BTreeSet<RecordId>,
    pub secondary_ids: BTreeSet<RecordId>,
}

/// Fields of `secondary` that should land on `primary`, plus the disagreements.
///
/// Secondary fills a field when primary lacks it, or when primary holds an
/// empty-equivalent value and secondary does not. Primary's populated values always win.
pub fn merge_fields(
    record_id: &str,
    primary: &FieldMap,
    secondary: &FieldMap,
) -> (PatchMap, Vec<FieldConflict>) {
    let mut patch = PatchMap::new();
    let mut conflicts = Vec::new();

    for (name, incoming) in secondary {
        match primary.get(name) {
            None => {
                patch.insert(name.clone(), FieldPatch::Set(incoming.clone()));
            }
            Some(current) if current.is_empty_equivalent() => {
                if !incoming.is_empty_equivalent() {
                    patch.insert(name.clone(), FieldPatch::Set(incoming.clone()));
                }
            }
            Some(current) => {
                if !incoming.is_empty_equivalent() && current != incoming {
                    conflicts.push(FieldConflict {
                        record_id: record_id.to_string(),
                        field: name.clone(),
                        kept: current.clone(),
                        discarded: incoming.clone(),
                    });
                }
            }
        }
    }

    (patch, conflicts)
}

/// Phase one. Read-only and repeatable; an id lands in at most one of insert/patch.
pub fn plan_merge(primary: &[Record], secondary: &[Record]) -> MergePlan {
    let primary_by_id: BTreeMap<&str, &FieldMap> = primary
        .iter()
        .map(|r| (r.id.as_str(), &r.fields))
        .collect();

    let mut out = MergePlan::default();
    for record in secondary {
        out.secondary_ids.insert(record.id.clone());
        match primary_by_id.get(record.id.as_str()) {
            None => out.plan.insert(record.id.clone(), record.fields.clone()),
            Some(existing) => {
                let (patch, conflicts) = merge_fields(&record.id, existing, &record.fields);
                out.conflicts.extend(conflicts);
                if patch.is_empty() {
                    out.untouched.insert(record.id.clone());
                } else {
                    out.plan.patch(record.id.clone(), patch);
                }
            }
        }
    }
    out
}

/// Phase two: delete from secondary only what phase one confirmed, plus ids that needed nothing.
pub fn deletion_plan(merge: &MergePlan, confirmed: &BTreeSet<RecordId>) -> MigrationPlan {
    let mut plan = MigrationPlan::new();
    for id in &merge.secondary_ids {
        if merge.untouched.contains(id) || confirmed.contains(id) {
            plan.delete(id.clone());
        }
    }
    plan
}

/// Ids whose phase-one action did not go through; they stay in secondary.
pub fn retained_ids(merge: &MergePlan, confirmed: &BTreeSet<RecordId>) -> BTreeSet<RecordId> {
    merge
        .secondary_ids
        .iter()
        .filter(|id| !merge.untouched.contains(*id) && !confirmed.contains(*id))
        .cloned()
        .collect()
}

/// Post-run counts; a finished merge leaves the secondary collection empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeVerification {
    pub primary_count: usize,
    pub secondary_count: usize,
}

impl MergeVerification {
    pub fn is_complete(&self) -> bool {
        self.secondary_count == 0
    }
}

pub fn verify_merged(primary: &[Record], secondary: &[Record]) -> MergeVerification {
    MergeVerification {
        primary_count: primary.len(),
        secondary_count: secondary.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmig_core::{apply_patch, fields, Value};

    fn rec(id: &str, pairs: &[(&str, &str)]) -> Record {
        Record::new(id, fields(pairs.iter().copied()))
    }

    #[test]
    fn shared_id_gets_only_missing_fields() {
        let primary = vec![rec("u1", &[("rol", "admin")])];
        let secondary = vec![rec("u1", &[("rol", "admin"), ("organizacionId", "ACME")])];
        let merged = plan_merge(&primary, &secondary);

        assert!(merged.plan.to_insert.is_empty());
        let patch = &merged.plan.to_patch["u1"];
        assert_eq!(patch.len(), 1);
        assert_eq!(patch.get("organizacionId"), Some(&FieldPatch::set("ACME")));
        assert!(merged.conflicts.is_empty());
    }

    #[test]
    fn secondary_only_ids_are_inserted_whole() {
        let primary = vec![rec("u1", &[("rol", "admin")])];
        let secondary = vec![rec("u2", &[("nombre", "Jane")])];
        let merged = plan_merge(&primary, &secondary);

        assert_eq!(merged.plan.to_insert.len(), 1);
        assert_eq!(
            merged.plan.to_insert["u2"],
            fields([("nombre", "Jane")])
        );
        assert!(merged.plan.to_patch.is_empty());
    }

    #[test]
    fn primary_values_win_and_disagreement_is_reported() {
        let primary = vec![rec("u1", &[("nombre", "Ana"), ("email", "")])];
        let secondary = vec![rec("u1", &[("nombre", "Ana María"), ("email", "ana@x.cl")])];
        let merged = plan_merge(&primary, &secondary);

        let patch = &merged.plan.to_patch["u1"];
        assert_eq!(patch.get("email"), Some(&FieldPatch::set("ana@x.cl")));
        assert!(!patch.contains_key("nombre"));
        assert_eq!(merged.conflicts.len(), 1);
        assert_eq!(merged.conflicts[0].kept, Value::from("Ana"));
    }

    #[test]
    fn null_primary_is_filled_but_empty_secondary_never_overwrites() {
        let mut primary_fields = fields([("telefono", "")]);
        primary_fields.insert("cargo".into(), Value::Null);
        let primary = vec![Record::new("u1", primary_fields)];

        let mut secondary_fields = fields([("cargo", "Gerente")]);
        secondary_fields.insert("telefono".into(), Value::Null);
        let secondary = vec![Record::new("u1", secondary_fields)];

        let merged = plan_merge(&primary, &secondary);
        let patch = &merged.plan.to_patch["u1"];
        assert_eq!(patch.get("cargo"), Some(&FieldPatch::set("Gerente")));
        assert!(!patch.contains_key("telefono"));
    }

    #[test]
    fn identical_records_yield_no_patch() {
        let primary = vec![rec("u1", &[("rol", "admin")])];
        let secondary = vec![rec("u1", &[("rol", "admin")])];
        let merged = plan_merge(&primary, &secondary);

        assert!(merged.plan.is_empty());
        assert!(merged.untouched.contains("u1"));
    }

    #[test]
    fn replanning_after_apply_is_empty() {
        let mut primary = vec![rec("u1", &[("rol", "admin")])];
        let secondary = vec![
            rec("u1", &[("organizacionId", "ACME")]),
            rec("u2", &[("nombre", "Jane")]),
        ];
        let merged = plan_merge(&primary, &secondary);

        for (id, patch) in &merged.plan.to_patch {
            let target = primary.iter_mut().find(|r| &r.id == id).unwrap();
            apply_patch(&mut target.fields, patch);
        }
        for (id, fields) in &merged.plan.to_insert {
            primary.push(Record::new(id.clone(), fields.clone()));
        }

        let again = plan_merge(&primary, &secondary);
        assert!(again.plan.is_empty());
        assert!(plan_merge(&primary, &[]).plan.is_empty());
    }

    #[test]
    fn deletion_excludes_unconfirmed_ids() {
        let primary = vec![rec("u1", &[("rol", "admin")]), rec("u3", &[("rol", "viewer")])];
        let secondary = vec![
            rec("u1", &[("organizacionId", "ACME")]),
            rec("u2", &[("nombre", "Jane")]),
            rec("u3", &[("rol", "viewer")]),
        ];
        let merged = plan_merge(&primary, &secondary);

        // u2's insert failed; u1's patch went through; u3 needed nothing.
        let confirmed = BTreeSet::from(["u1".to_string()]);
        let deletions = deletion_plan(&merged, &confirmed);

        assert_eq!(
            deletions.to_delete,
            BTreeSet::from(["u1".to_string(), "u3".to_string()])
        );
        assert_eq!(
            retained_ids(&merged, &confirmed),
            BTreeSet::from(["u2".to_string()])
        );
    }
}
