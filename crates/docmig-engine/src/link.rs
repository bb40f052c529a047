//! Name-to-Identifier Linker.

use std::collections::{BTreeMap, BTreeSet};

use docmig_core::{FieldPatch, MigrationPlan, PatchMap, Record, RecordId, Value};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;

/// Minimum Jaro-Winkler score for a "did you mean" hint on unresolved names.
pub const SUGGESTION_THRESHOLD: f64 = 0.9;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("display name {name:?} is shared by records {ids:?}")]
    DuplicateName { name: String, ids: Vec<RecordId> },
}

/// Display name -> identifier, rebuilt from the reference collection on every run.
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    by_name: BTreeMap<String, RecordId>,
    ambiguous: BTreeMap<String, Vec<RecordId>>,
    ids: BTreeSet<RecordId>,
}

impl NameIndex {
    /// Last write wins when two records share a name; every id seen for such a name
    /// is kept in [`NameIndex::ambiguities`].
    pub fn build(records: &[Record], name_field: &str) -> Self {
        let mut index = Self::default();
        for record in records {
            index.ids.insert(record.id.clone());
            let Some(name) = record.str_field(name_field) else {
                continue;
            };
            if let Some(previous) = index.by_name.insert(name.to_string(), record.id.clone()) {
                index
                    .ambiguous
                    .entry(name.to_string())
                    .or_insert_with(|| vec![previous])
                    .push(record.id.clone());
            }
        }
        index
    }

    /// Like [`NameIndex::build`] but refuses to pick a winner for a shared name.
    pub fn build_strict(records: &[Record], name_field: &str) -> Result<Self, LinkError> {
        let index = Self::build(records, name_field);
        match index.ambiguous.iter().next() {
            Some((name, ids)) => Err(LinkError::DuplicateName {
                name: name.clone(),
                ids: ids.clone(),
            }),
            None => Ok(index),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.by_name.get(name.trim()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name.trim())
    }

    /// True when `value` is already the id of a reference record.
    pub fn is_identifier(&self, value: &str) -> bool {
        self.ids.contains(value.trim())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn ambiguities(&self) -> &BTreeMap<String, Vec<RecordId>> {
        &self.ambiguous
    }

    /// Closest indexed name, case-insensitive, when it clears [`SUGGESTION_THRESHOLD`].
    pub fn suggest(&self, name: &str) -> Option<&str> {
        let needle = name.trim().to_lowercase();
        self.by_name
            .keys()
            .map(|candidate| (candidate, jaro_winkler(&needle, &candidate.to_lowercase())))
            .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(candidate, _)| candidate.as_str())
    }
}

/// Restricts linking to targets whose `field` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Target field carrying the human-readable name.
    pub reference_field: String,
    /// Target field that receives the resolved identifier.
    pub result_field: String,
    #[serde(default)]
    pub force_relink: bool,
    /// Stamped with the server time on every emitted patch.
    #[serde(default)]
    pub touch_field: Option<String>,
    #[serde(default)]
    pub scope: Option<ScopeFilter>,
}

impl LinkSpec {
    pub fn new(reference_field: impl Into<String>, result_field: impl Into<String>) -> Self {
        Self {
            reference_field: reference_field.into(),
            result_field: result_field.into(),
            force_relink: false,
            touch_field: None,
            scope: None,
        }
    }

    /// The name is replaced by its identifier in the same field.
    pub fn rewrites_in_place(&self) -> bool {
        self.reference_field == self.result_field
    }

    fn in_scope(&self, record: &Record) -> bool {
        match &self.scope {
            Some(scope) => record.str_field(&scope.field) == Some(scope.value.trim()),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unresolved {
    pub record_id: RecordId,
    pub name: String,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkPlan {
    pub plan: MigrationPlan,
    pub linked: usize,
    pub already_linked: usize,
    pub missing_reference: usize,
    pub out_of_scope: usize,
    pub unresolved: Vec<Unresolved>,
}

/// Emits a patch for every in-scope target whose reference name resolves and whose
/// result field is still empty (or any resolvable target when `force_relink` is set).
/// An in-place spec rewrites names it finds and counts values that are already
/// reference ids as linked.
pub fn plan_links(targets: &[Record], index: &NameIndex, spec: &LinkSpec) -> LinkPlan {
    let mut out = LinkPlan::default();
    let in_place = spec.rewrites_in_place();

    for target in targets {
        if !spec.in_scope(target) {
            out.out_of_scope += 1;
            continue;
        }
        let Some(name) = target.str_field(&spec.reference_field) else {
            out.missing_reference += 1;
            continue;
        };
        if in_place && index.is_identifier(name) {
            out.already_linked += 1;
            continue;
        }
        let current = if in_place {
            None
        } else {
            target
                .get(&spec.result_field)
                .filter(|value| !value.is_empty_equivalent())
        };
        if current.is_some() && !spec.force_relink {
            out.already_linked += 1;
            continue;
        }

        let Some(id) = index.resolve(name) else {
            out.unresolved.push(Unresolved {
                record_id: target.id.clone(),
                name: name.to_string(),
                suggestion: index.suggest(name).map(str::to_string),
            });
            continue;
        };
        if current.and_then(Value::as_str) == Some(id) {
            out.already_linked += 1;
            continue;
        }

        let mut patch = PatchMap::new();
        patch.insert(spec.result_field.clone(), FieldPatch::set(id));
        if let Some(touch) = &spec.touch_field {
            patch.insert(touch.clone(), FieldPatch::Set(Value::ServerTimestamp));
        }
        out.plan.patch(target.id.clone(), patch);
        out.linked += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmig_core::{apply_patch, fields};

    fn orgs() -> Vec<Record> {
        vec![
            Record::new("org-1", fields([("nombre", "Acme Corp")])),
            Record::new("org-2", fields([("nombre", "Inmobiliaria Los Andes")])),
            Record::new("org-3", fields([("tipo", "persona")])),
        ]
    }

    fn spec() -> LinkSpec {
        LinkSpec::new("contraparte", "contraparteOrganizacionId")
    }

    #[test]
    fn resolves_name_to_identifier() {
        let index = NameIndex::build(&orgs(), "nombre");
        let targets = vec![Record::new("c1", fields([("contraparte", "Acme Corp")]))];
        let planned = plan_links(&targets, &index, &spec());

        assert_eq!(planned.linked, 1);
        assert_eq!(
            planned.plan.to_patch["c1"].get("contraparteOrganizacionId"),
            Some(&FieldPatch::set("org-1"))
        );
    }

    #[test]
    fn never_patches_blank_or_missing_reference() {
        let index = NameIndex::build(&orgs(), "nombre");
        let targets = vec![
            Record::new("c1", fields([("contraparte", "   ")])),
            Record::new("c2", fields([("titulo", "Arriendo oficina")])),
        ];
        let planned = plan_links(&targets, &index, &spec());

        assert!(planned.plan.is_empty());
        assert_eq!(planned.missing_reference, 2);
    }

    #[test]
    fn keeps_existing_links_unless_forced() {
        let index = NameIndex::build(&orgs(), "nombre");
        let targets = vec![Record::new(
            "c1",
            fields([
                ("contraparte", "Acme Corp"),
                ("contraparteOrganizacionId", "legacy-id"),
            ]),
        )];

        let planned = plan_links(&targets, &index, &spec());
        assert!(planned.plan.is_empty());
        assert_eq!(planned.already_linked, 1);

        let mut forced = spec();
        forced.force_relink = true;
        let relinked = plan_links(&targets, &index, &forced);
        assert_eq!(
            relinked.plan.to_patch["c1"].get("contraparteOrganizacionId"),
            Some(&FieldPatch::set("org-1"))
        );
    }

    #[test]
    fn unresolved_names_are_reported_with_hint() {
        let index = NameIndex::build(&orgs(), "nombre");
        let targets = vec![
            Record::new("c1", fields([("contraparte", "ACME Corp.")])),
            Record::new("c2", fields([("contraparte", "Papeleria Central")])),
        ];
        let planned = plan_links(&targets, &index, &spec());

        assert!(planned.plan.is_empty());
        assert_eq!(planned.unresolved.len(), 2);
        assert_eq!(planned.unresolved[0].suggestion.as_deref(), Some("Acme Corp"));
        assert_eq!(planned.unresolved[1].suggestion, None);
    }

    #[test]
    fn second_pass_after_apply_is_empty() {
        let index = NameIndex::build(&orgs(), "nombre");
        let mut targets = vec![
            Record::new("c1", fields([("contraparte", "Acme Corp")])),
            Record::new("c2", fields([("contraparte", "Inmobiliaria Los Andes")])),
        ];
        let mut with_touch = spec();
        with_touch.touch_field = Some("fechaUltimaModificacion".into());

        let first = plan_links(&targets, &index, &with_touch);
        assert_eq!(first.linked, 2);
        for target in &mut targets {
            apply_patch(&mut target.fields, &first.plan.to_patch[&target.id]);
        }

        let second = plan_links(&targets, &index, &with_touch);
        assert!(second.plan.is_empty());
        assert_eq!(second.already_linked, 2);
    }

    #[test]
    fn scope_filters_targets() {
        let index = NameIndex::build(&orgs(), "nombre");
        let targets = vec![
            Record::new(
                "c1",
                fields([("contraparte", "Acme Corp"), ("organizacionId", "MEIK LABS")]),
            ),
            Record::new(
                "c2",
                fields([("contraparte", "Acme Corp"), ("organizacionId", "OTRA")]),
            ),
        ];
        let mut scoped = spec();
        scoped.scope = Some(ScopeFilter {
            field: "organizacionId".into(),
            value: "MEIK LABS".into(),
        });
        let planned = plan_links(&targets, &index, &scoped);

        assert_eq!(planned.linked, 1);
        assert_eq!(planned.out_of_scope, 1);
        assert!(planned.plan.to_patch.contains_key("c1"));
    }

    #[test]
    fn duplicate_names_are_last_write_wins_and_tracked() {
        let records = vec![
            Record::new("org-1", fields([("nombre", "Acme Corp")])),
            Record::new("org-9", fields([("nombre", "Acme Corp ")])),
        ];
        let index = NameIndex::build(&records, "nombre");
        assert_eq!(index.resolve("Acme Corp"), Some("org-9"));
        assert_eq!(
            index.ambiguities()["Acme Corp"],
            vec!["org-1".to_string(), "org-9".to_string()]
        );

        let err = NameIndex::build_strict(&records, "nombre").expect_err("strict");
        assert!(matches!(err, LinkError::DuplicateName { .. }));
    }

    #[test]
    fn in_place_rewrite_is_idempotent() {
        let index = NameIndex::build(&orgs(), "nombre");
        let spec = LinkSpec {
            touch_field: Some("ultimoAcceso".to_string()),
            ..LinkSpec::new("organizacionId", "organizacionId")
        };
        let mut users = vec![
            Record::new("u1", fields([("organizacionId", "Acme Corp")])),
            Record::new("u2", fields([("organizacionId", "org-2")])),
            Record::new("u3", fields([("organizacionId", "Sin Nombre")])),
        ];

        let first = plan_links(&users, &index, &spec);
        assert_eq!(first.linked, 1);
        assert_eq!(first.already_linked, 1);
        assert_eq!(first.unresolved.len(), 1);
        assert_eq!(first.unresolved[0].record_id, "u3");
        assert_eq!(
            first.plan.to_patch["u1"].get("organizacionId"),
            Some(&FieldPatch::set("org-1"))
        );

        apply_patch(&mut users[0].fields, &first.plan.to_patch["u1"]);
        let second = plan_links(&users, &index, &spec);
        assert!(second.plan.is_empty());
        assert_eq!(second.already_linked, 2);
        assert_eq!(second.unresolved.len(), 1);
    }
}
