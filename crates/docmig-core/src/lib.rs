//! Shared record, value and plan types for docmig.

mod plan;
mod summary;
mod value;

pub use plan::MigrationPlan;
pub use summary::{FieldConflict, RunSummary};
pub use value::{apply_patch, FieldMap, FieldPatch, PatchMap, Value};

pub const CRATE_NAME: &str = "docmig-core";

/// Opaque record identifier, unique within its collection.
pub type RecordId = String;

/// One addressable document read from a collection snapshot.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub fields: FieldMap,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, fields: FieldMap) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Trimmed string value of `field`, `None` when absent, blank or not a string.
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Builds a [`FieldMap`] from `(name, value)` pairs.
pub fn fields<I, K, V>(pairs: I) -> FieldMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
