use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

/// Ordered, string-keyed field map of a schema-less record.
pub type FieldMap = BTreeMap<String, Value>;

/// Partial update: every entry either sets a value or removes the field.
pub type PatchMap = BTreeMap<String, FieldPatch>;

const TIMESTAMP_KEY: &str = "__timestamp";
const SERVER_TIMESTAMP_KEY: &str = "__serverTimestamp";

/// Tagged value union stored in record fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    /// Placeholder resolved by the store to its own clock at write time.
    ServerTimestamp,
    Array(Vec<Value>),
    Map(FieldMap),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Null, blank strings, empty arrays and empty maps count as "not populated".
    pub fn is_empty_equivalent(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Map(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Replaces every [`Value::ServerTimestamp`] (including nested ones) with `now`.
    pub fn resolve_server_timestamps(&mut self, now: DateTime<Utc>) {
        match self {
            Value::ServerTimestamp => *self = Value::Timestamp(now),
            Value::Array(items) => items
                .iter_mut()
                .for_each(|item| item.resolve_server_timestamps(now)),
            Value::Map(map) => map
                .values_mut()
                .for_each(|item| item.resolve_server_timestamps(now)),
            _ => {}
        }
    }

    /// Plain JSON rendering; timestamps become single-key marker objects so they survive a round trip.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Integer(i) => JsonValue::from(*i),
            Value::Double(d) => serde_json::Number::from_f64(*d)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Timestamp(ts) => marker(TIMESTAMP_KEY, JsonValue::String(ts.to_rfc3339())),
            Value::ServerTimestamp => marker(SERVER_TIMESTAMP_KEY, JsonValue::Bool(true)),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Double(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::Array(items.into_iter().map(Value::from_json).collect()),
            JsonValue::Object(obj) => {
                if obj.len() == 1 {
                    if let Some(ts) = obj
                        .get(TIMESTAMP_KEY)
                        .and_then(JsonValue::as_str)
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    {
                        return Value::Timestamp(ts.with_timezone(&Utc));
                    }
                    if obj.get(SERVER_TIMESTAMP_KEY) == Some(&JsonValue::Bool(true)) {
                        return Value::ServerTimestamp;
                    }
                }
                Value::Map(
                    obj.into_iter()
                        .map(|(k, v)| (k, Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }
}

fn marker(key: &str, value: JsonValue) -> JsonValue {
    let mut obj = serde_json::Map::new();
    obj.insert(key.to_string(), value);
    JsonValue::Object(obj)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s:?}"),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::ServerTimestamp => f.write_str("<server timestamp>"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(Value::from_json)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl From<FieldMap> for Value {
    fn from(value: FieldMap) -> Self {
        Value::Map(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

/// One entry of a merge-update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPatch {
    Set(Value),
    Unset,
}

impl FieldPatch {
    pub fn set(value: impl Into<Value>) -> Self {
        FieldPatch::Set(value.into())
    }
}

/// Applies `patch` onto `fields` in place. Sentinels are kept as-is.
pub fn apply_patch(fields: &mut FieldMap, patch: &PatchMap) {
    for (name, change) in patch {
        match change {
            FieldPatch::Set(value) => {
                fields.insert(name.clone(), value.clone());
            }
            FieldPatch::Unset => {
                fields.remove(name);
            }
        }
    }
}
