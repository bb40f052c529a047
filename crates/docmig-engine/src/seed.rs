//! Reference Seeder: proposes reference records for names targets mention but nobody defined.

use std::collections::{BTreeMap, BTreeSet};

use docmig_core::{FieldMap, MigrationPlan, Record, RecordId, Value};
use serde::{Deserialize, Serialize};

use crate::link::{NameIndex, ScopeFilter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedSpec {
    /// Display-name field on reference records.
    pub name_field: String,
    /// Target field holding the name to seed from.
    pub reference_field: String,
    /// Limits which targets are read; also stamped onto each seeded record.
    #[serde(default)]
    pub scope: Option<ScopeFilter>,
    /// Extra fields every seeded record starts with.
    #[serde(default)]
    pub defaults: FieldMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlugCollision {
    pub id: RecordId,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SeedPlan {
    pub plan: MigrationPlan,
    /// Target records mentioning each seeded name.
    pub mentions: BTreeMap<String, usize>,
    /// Names skipped because their id clashed with another name or an existing record.
    pub collisions: Vec<SlugCollision>,
}

/// Stable identifier derived from a display name: lower-case ASCII alphanumerics
/// joined by single hyphens. Anything else is dropped.
pub fn slug(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join("-")
}

pub fn plan_seed(targets: &[Record], references: &[Record], spec: &SeedSpec) -> SeedPlan {
    let index = NameIndex::build(references, &spec.name_field);
    let existing_ids: BTreeSet<&str> = references.iter().map(|r| r.id.as_str()).collect();

    let mut mentions: BTreeMap<String, usize> = BTreeMap::new();
    for target in targets {
        if let Some(scope) = &spec.scope {
            if target.str_field(&scope.field) != Some(scope.value.trim()) {
                continue;
            }
        }
        let Some(name) = target.str_field(&spec.reference_field) else {
            continue;
        };
        if index.contains(name) {
            continue;
        }
        *mentions.entry(name.to_string()).or_default() += 1;
    }

    let mut by_id: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in mentions.keys() {
        by_id.entry(slug(name)).or_default().push(name.clone());
    }

    let mut out = SeedPlan::default();
    for (id, names) in by_id {
        if id.is_empty() || names.len() > 1 || existing_ids.contains(id.as_str()) {
            out.collisions.push(SlugCollision { id, names });
            continue;
        }
        let name = names.into_iter().next().unwrap_or_default();
        let mut fields = spec.defaults.clone();
        fields.insert(spec.name_field.clone(), Value::from(name.as_str()));
        if let Some(scope) = &spec.scope {
            fields.insert(scope.field.clone(), Value::from(scope.value.as_str()));
        }
        out.plan.insert(id, fields);
    }
    out.mentions = mentions;
    out
}
