use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::value::{apply_patch, FieldMap, PatchMap};
use crate::RecordId;

/// Side-effect-free description of the work a pass will issue against one collection.
///
/// The three sets stay disjoint: every builder method folds a new action into
/// whatever is already pending for the same identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub to_insert: BTreeMap<RecordId, FieldMap>,
    pub to_patch: BTreeMap<RecordId, PatchMap>,
    pub to_delete: BTreeSet<RecordId>,
}

impl MigrationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full create. Replaces any pending patch or delete for `id`.
    pub fn insert(&mut self, id: impl Into<RecordId>, fields: FieldMap) {
        let id = id.into();
        self.to_patch.remove(&id);
        self.to_delete.remove(&id);
        self.to_insert.insert(id, fields);
    }

    /// Merge-update. Folded into a pending insert or patch for the same `id`.
    pub fn patch(&mut self, id: impl Into<RecordId>, patch: PatchMap) {
        if patch.is_empty() {
            return;
        }
        let id = id.into();
        if let Some(fields) = self.to_insert.get_mut(&id) {
            apply_patch(fields, &patch);
            return;
        }
        self.to_delete.remove(&id);
        self.to_patch.entry(id).or_default().extend(patch);
    }

    pub fn delete(&mut self, id: impl Into<RecordId>) {
        let id = id.into();
        self.to_insert.remove(&id);
        self.to_patch.remove(&id);
        self.to_delete.insert(id);
    }

    /// Folds `other` into `self` using the same rules as the single-entry builders.
    pub fn absorb(&mut self, other: MigrationPlan) {
        for (id, fields) in other.to_insert {
            self.insert(id, fields);
        }
        for (id, patch) in other.to_patch {
            self.patch(id, patch);
        }
        for id in other.to_delete {
            self.delete(id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_patch.is_empty() && self.to_delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_insert.len() + self.to_patch.len() + self.to_delete.len()
    }

    pub fn touches(&self, id: &str) -> bool {
        self.to_insert.contains_key(id) || self.to_patch.contains_key(id) || self.to_delete.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{FieldPatch, Value};

    fn patch_of(name: &str, value: &str) -> PatchMap {
        let mut p = PatchMap::new();
        p.insert(name.into(), FieldPatch::set(value));
        p
    }

    #[test]
    fn patch_folds_into_pending_insert() {
        let mut plan = MigrationPlan::new();
        plan.insert("org-1", crate::fields([("nombre", "Acme")]));
        plan.patch("org-1", patch_of("tipo", "proveedor"));

        assert!(plan.to_patch.is_empty());
        assert_eq!(
            plan.to_insert["org-1"].get("tipo"),
            Some(&Value::from("proveedor"))
        );
    }

    #[test]
    fn patches_for_same_id_merge() {
        let mut plan = MigrationPlan::new();
        plan.patch("u1", patch_of("rol", "admin"));
        plan.patch("u1", patch_of("organizacionId", "ACME"));

        assert_eq!(plan.to_patch.len(), 1);
        assert_eq!(plan.to_patch["u1"].len(), 2);
    }

    #[test]
    fn delete_supersedes_pending_actions() {
        let mut plan = MigrationPlan::new();
        plan.insert("a", FieldMap::new());
        plan.patch("b", patch_of("x", "y"));
        plan.delete("a");
        plan.delete("b");

        assert!(plan.to_insert.is_empty());
        assert!(plan.to_patch.is_empty());
        assert_eq!(plan.to_delete.len(), 2);
        assert!(plan.touches("a"));
    }

    #[test]
    fn empty_patch_is_not_recorded() {
        let mut plan = MigrationPlan::new();
        plan.patch("u1", PatchMap::new());
        assert!(plan.is_empty());
    }
}
