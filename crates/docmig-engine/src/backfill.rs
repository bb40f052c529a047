//! Adds fields a collection is expected to carry, with a default value, where missing.

use docmig_core::{FieldMap, FieldPatch, MigrationPlan, PatchMap, Record};

/// Existing fields are never touched, whatever they hold.
pub fn plan_backfill(records: &[Record], defaults: &FieldMap) -> MigrationPlan {
    let mut plan = MigrationPlan::new();
    for record in records {
        let patch: PatchMap = defaults
            .iter()
            .filter(|(name, _)| !record.fields.contains_key(*name))
            .map(|(name, value)| (name.clone(), FieldPatch::Set(value.clone())))
            .collect();
        plan.patch(record.id.clone(), patch);
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmig_core::{apply_patch, fields, Value};

    #[test]
    fn fills_only_missing_fields_and_is_idempotent() {
        let defaults = fields([("representanteLegal", ""), ("rutRepresentanteLegal", "")]);
        let mut records = vec![
            Record::new("org-1", fields([("nombre", "Acme"), ("representanteLegal", "J. Pérez")])),
            Record::new(
                "org-2",
                fields([("representanteLegal", "x"), ("rutRepresentanteLegal", "1-9")]),
            ),
        ];

        let plan = plan_backfill(&records, &defaults);
        assert_eq!(plan.to_patch.len(), 1);
        assert_eq!(
            plan.to_patch["org-1"].get("rutRepresentanteLegal"),
            Some(&FieldPatch::Set(Value::from("")))
        );
        assert!(!plan.to_patch["org-1"].contains_key("representanteLegal"));

        apply_patch(&mut records[0].fields, &plan.to_patch["org-1"]);
        assert!(plan_backfill(&records, &defaults).is_empty());
    }
}
