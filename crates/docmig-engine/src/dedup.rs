//! Record Deduplicator: collapses records that share a key field down to the newest one.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use docmig_core::{MigrationPlan, Record, RecordId, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupSpec {
    /// Records with the same trimmed value here are duplicates.
    pub key_field: String,
    /// Newest value wins. Timestamps, RFC 3339 strings and `YYYY-MM-DD` dates are understood.
    pub timestamp_field: String,
}

impl DedupSpec {
    pub fn new(key_field: impl Into<String>, timestamp_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            timestamp_field: timestamp_field.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub key: String,
    pub kept: RecordId,
    pub removed: Vec<RecordId>,
}

#[derive(Debug, Clone, Default)]
pub struct DedupPlan {
    /// Deletes only.
    pub plan: MigrationPlan,
    pub groups: Vec<DuplicateGroup>,
    /// Records with no usable key; never grouped.
    pub without_key: usize,
}

fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Timestamp(ts) => Some(*ts),
        Value::String(text) => {
            let text = text.trim();
            DateTime::parse_from_rfc3339(text)
                .map(|ts| ts.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDate::parse_from_str(text, "%Y-%m-%d")
                        .ok()
                        .and_then(|date| date.and_hms_opt(0, 0, 0))
                        .map(|naive| naive.and_utc())
                })
        }
        _ => None,
    }
}

/// Newest first; records without a readable timestamp sort last, ties by id.
fn newest_first(spec: &DedupSpec, a: &Record, b: &Record) -> Ordering {
    let a_ts = a.get(&spec.timestamp_field).and_then(timestamp_of);
    let b_ts = b.get(&spec.timestamp_field).and_then(timestamp_of);
    match (a_ts, b_ts) {
        (Some(a_ts), Some(b_ts)) => b_ts.cmp(&a_ts),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}

/// Keeps the newest record of every group sharing `key_field` and deletes the rest.
/// The output of one pass has no groups left, so a second pass plans nothing.
pub fn plan_dedup(records: &[Record], spec: &DedupSpec) -> DedupPlan {
    let mut out = DedupPlan::default();
    let mut by_key: BTreeMap<&str, Vec<&Record>> = BTreeMap::new();
    for record in records {
        match record.str_field(&spec.key_field) {
            Some(key) => by_key.entry(key).or_default().push(record),
            None => out.without_key += 1,
        }
    }

    for (key, mut group) in by_key {
        if group.len() < 2 {
            continue;
        }
        group.sort_by(|a, b| newest_first(spec, a, b));
        let removed: Vec<RecordId> = group[1..].iter().map(|r| r.id.clone()).collect();
        for id in &removed {
            out.plan.delete(id.clone());
        }
        out.groups.push(DuplicateGroup {
            key: key.to_string(),
            kept: group[0].id.clone(),
            removed,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use docmig_core::fields;

    fn spec() -> DedupSpec {
        DedupSpec::new("email", "fechaCreacion")
    }

    fn user(id: &str, email: &str, created: Value) -> Record {
        let mut record = Record::new(id, fields([("email", email)]));
        record.fields.insert("fechaCreacion".into(), created);
        record
    }

    #[test]
    fn keeps_newest_record_per_email() {
        let older = Utc.with_ymd_and_hms(2023, 1, 10, 9, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap();
        let records = vec![
            user("u1", "ana@meik.cl", Value::Timestamp(older)),
            user("u2", "ana@meik.cl ", Value::Timestamp(newer)),
            user("u3", "ana@meik.cl", Value::from("2023-06-01")),
            user("u4", "rodrigo@meik.cl", Value::Timestamp(older)),
        ];
        let planned = plan_dedup(&records, &spec());

        assert_eq!(planned.groups.len(), 1);
        let group = &planned.groups[0];
        assert_eq!(group.key, "ana@meik.cl");
        assert_eq!(group.kept, "u2");
        assert_eq!(group.removed, vec!["u3".to_string(), "u1".to_string()]);
        assert_eq!(planned.plan.to_delete.len(), 2);
        assert!(planned.plan.to_patch.is_empty());
        assert!(!planned.plan.touches("u4"));
    }

    #[test]
    fn unreadable_timestamps_lose_and_ties_go_to_lowest_id() {
        let records = vec![
            user("u9", "jane@meik.cl", Value::from("2024-02-30T10:00:00Z")),
            user("u5", "jane@meik.cl", Value::from("2024-01-01T10:00:00Z")),
            user("u7", "jane@meik.cl", Value::from("2024-01-01T10:00:00Z")),
            Record::new("u8", fields([("nombre", "Sin correo")])),
        ];
        let planned = plan_dedup(&records, &spec());

        assert_eq!(planned.without_key, 1);
        assert_eq!(planned.groups[0].kept, "u5");
        assert_eq!(planned.groups[0].removed, vec!["u7".to_string(), "u9".to_string()]);
    }

    #[test]
    fn surviving_records_plan_nothing() {
        let records = vec![
            user("u1", "ana@meik.cl", Value::from("2023-01-01")),
            user("u2", "ana@meik.cl", Value::from("2024-01-01")),
        ];
        let planned = plan_dedup(&records, &spec());
        let survivors: Vec<Record> = records
            .into_iter()
            .filter(|r| !planned.plan.to_delete.contains(&r.id))
            .collect();
        assert!(plan_dedup(&survivors, &spec()).plan.is_empty());
    }
}
