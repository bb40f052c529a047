//! Firestore v1 REST backend.
//!
//! Writes go through `documents:commit` so field removal, server timestamps,
//! existence preconditions and multi-document deletes share one code path.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docmig_core::{FieldMap, FieldPatch, PatchMap, Record, RecordId, Value};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tracing::{debug, info_span, Instrument};

use crate::{RecordStore, StoreError, MAX_BATCH_WRITES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub database: String,
    /// OAuth bearer token obtained out of band (service account, gcloud, emulator "owner").
    pub access_token: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub page_size: u32,
    pub backoff: BackoffPolicy,
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: "(default)".to_string(),
            access_token: None,
            base_url: "https://firestore.googleapis.com/v1".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            page_size: 300,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct FirestoreRestStore {
    client: reqwest::Client,
    config: FirestoreConfig,
}

#[derive(Debug, Deserialize)]
struct Document {
    name: String,
    #[serde(default)]
    fields: JsonMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    documents: Vec<Document>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryRow {
    document: Option<Document>,
}

impl FirestoreRestStore {
    pub fn new(config: FirestoreConfig) -> Result<Self, StoreError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        Ok(Self { client, config })
    }

    fn database_path(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.config.project_id, self.config.database
        )
    }

    fn documents_url(&self) -> String {
        format!("{}/{}/documents", self.config.base_url, self.database_path())
    }

    fn document_name(&self, collection: &str, id: &str) -> String {
        format!("{}/documents/{collection}/{id}", self.database_path())
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Sends with exponential backoff on retryable statuses and transport errors.
    async fn send<F>(&self, build: F) -> Result<Response, StoreError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match self.authorize(build()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying firestore request");
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying firestore request");
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }

    async fn commit(&self, writes: Vec<JsonValue>) -> Result<(), StoreError> {
        let url = format!("{}:commit", self.documents_url());
        let body = json!({ "writes": writes });
        let resp = self.send(|| self.client.post(&url).json(&body)).await?;
        ensure_success(resp).await.map(|_| ())
    }
}

async fn ensure_success(resp: Response) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        return Err(StoreError::Connectivity(format!("unauthorized: {message}")));
    }
    Err(StoreError::Rejected {
        status: status.as_u16(),
        message,
    })
}

fn id_from_name(name: &str) -> RecordId {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

fn decode_document(doc: Document) -> Result<Record, StoreError> {
    Ok(Record::new(id_from_name(&doc.name), decode_fields(&doc.fields)?))
}

/// Quotes a field name with backticks unless it is a plain identifier.
pub(crate) fn field_path(name: &str) -> String {
    let simple = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

pub(crate) fn encode_value(value: &Value) -> Result<JsonValue, StoreError> {
    Ok(match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Integer(i) => json!({ "integerValue": i.to_string() }),
        Value::Double(d) => json!({ "doubleValue": d }),
        Value::String(s) => json!({ "stringValue": s }),
        Value::Timestamp(ts) => json!({ "timestampValue": ts.to_rfc3339() }),
        Value::ServerTimestamp => {
            return Err(StoreError::Codec(
                "server timestamp is only supported as a map field".to_string(),
            ))
        }
        Value::Array(items) => {
            let values = items.iter().map(encode_value).collect::<Result<Vec<_>, _>>()?;
            json!({ "arrayValue": { "values": values } })
        }
        Value::Map(map) => {
            let (fields, transforms) = encode_fields(map, "")?;
            if !transforms.is_empty() {
                return Err(StoreError::Codec(
                    "server timestamp inside a nested value".to_string(),
                ));
            }
            json!({ "mapValue": { "fields": fields } })
        }
    })
}

/// Encodes a field map, splitting out server-timestamp sentinels as transform paths.
pub(crate) fn encode_fields(
    fields: &FieldMap,
    prefix: &str,
) -> Result<(JsonMap<String, JsonValue>, Vec<String>), StoreError> {
    let mut encoded = JsonMap::new();
    let mut transforms = Vec::new();
    for (name, value) in fields {
        let path = if prefix.is_empty() {
            field_path(name)
        } else {
            format!("{prefix}.{}", field_path(name))
        };
        match value {
            Value::ServerTimestamp => transforms.push(path),
            Value::Map(inner) => {
                let (inner_fields, inner_transforms) = encode_fields(inner, &path)?;
                transforms.extend(inner_transforms);
                encoded.insert(
                    name.clone(),
                    json!({ "mapValue": { "fields": inner_fields } }),
                );
            }
            other => {
                encoded.insert(name.clone(), encode_value(other)?);
            }
        }
    }
    Ok((encoded, transforms))
}

pub(crate) fn decode_value(json: &JsonValue) -> Result<Value, StoreError> {
    let obj = json
        .as_object()
        .ok_or_else(|| StoreError::Codec(format!("expected typed value, got {json}")))?;
    let Some((kind, inner)) = obj.iter().next() else {
        return Err(StoreError::Codec("empty typed value".to_string()));
    };
    Ok(match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" => Value::Bool(inner.as_bool().unwrap_or_default()),
        "integerValue" => {
            let parsed = match inner {
                JsonValue::String(s) => s.parse().ok(),
                other => other.as_i64(),
            };
            Value::Integer(
                parsed.ok_or_else(|| StoreError::Codec(format!("bad integerValue {inner}")))?,
            )
        }
        "doubleValue" => Value::Double(inner.as_f64().unwrap_or_default()),
        "stringValue" | "referenceValue" | "bytesValue" => {
            Value::String(inner.as_str().unwrap_or_default().to_string())
        }
        "timestampValue" => {
            let raw = inner.as_str().unwrap_or_default();
            let ts = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| StoreError::Codec(format!("bad timestampValue {raw}: {e}")))?;
            Value::Timestamp(ts.with_timezone(&Utc))
        }
        "geoPointValue" => {
            let mut map = FieldMap::new();
            for key in ["latitude", "longitude"] {
                map.insert(
                    key.to_string(),
                    Value::Double(inner.get(key).and_then(JsonValue::as_f64).unwrap_or_default()),
                );
            }
            Value::Map(map)
        }
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(JsonValue::as_array)
                .map(|values| values.iter().map(decode_value).collect::<Result<Vec<_>, _>>())
                .transpose()?
                .unwrap_or_default(),
        ),
        "mapValue" => Value::Map(
            inner
                .get("fields")
                .and_then(JsonValue::as_object)
                .map(decode_fields)
                .transpose()?
                .unwrap_or_default(),
        ),
        other => return Err(StoreError::Codec(format!("unsupported value kind {other}"))),
    })
}

pub(crate) fn decode_fields(fields: &JsonMap<String, JsonValue>) -> Result<FieldMap, StoreError> {
    fields
        .iter()
        .map(|(name, value)| Ok((name.clone(), decode_value(value)?)))
        .collect()
}

fn server_time_transforms(paths: Vec<String>) -> Vec<JsonValue> {
    paths
        .into_iter()
        .map(|path| json!({ "fieldPath": path, "setToServerValue": "REQUEST_TIME" }))
        .collect()
}

/// Merge-update write for `patch`: masked sets and unsets, `REQUEST_TIME` transforms for
/// timestamp sentinels at any depth, and an `exists` precondition.
fn patch_write(document_name: String, patch: &PatchMap) -> Result<JsonValue, StoreError> {
    let mut values = FieldMap::new();
    let mut mask = Vec::new();
    let mut transforms = Vec::new();
    for (name, change) in patch {
        match change {
            FieldPatch::Set(Value::ServerTimestamp) => transforms.push(field_path(name)),
            FieldPatch::Set(value) => {
                values.insert(name.clone(), value.clone());
                mask.push(field_path(name));
            }
            // Masked but absent from the body: Firestore removes the field.
            FieldPatch::Unset => mask.push(field_path(name)),
        }
    }
    let (encoded, nested) = encode_fields(&values, "")?;
    transforms.extend(nested);

    let mut write = json!({
        "update": { "name": document_name, "fields": encoded },
        "updateMask": { "fieldPaths": mask },
        "currentDocument": { "exists": true },
    });
    if !transforms.is_empty() {
        write["updateTransforms"] = JsonValue::Array(server_time_transforms(transforms));
    }
    Ok(write)
}

#[async_trait]
impl RecordStore for FirestoreRestStore {
    fn describe(&self) -> String {
        format!("firestore:{}", self.database_path())
    }

    async fn list_all(&self, collection: &str) -> Result<Vec<Record>, StoreError> {
        let span = info_span!("firestore_list", collection);
        async {
            let url = format!("{}/{collection}", self.documents_url());
            let page_size = self.config.page_size.to_string();
            let mut records = Vec::new();
            let mut page_token: Option<String> = None;
            loop {
                let resp = self
                    .send(|| {
                        let mut req = self
                            .client
                            .get(&url)
                            .query(&[("pageSize", page_size.as_str())]);
                        if let Some(token) = &page_token {
                            req = req.query(&[("pageToken", token.as_str())]);
                        }
                        req
                    })
                    .await?;
                let page: ListPage = ensure_success(resp).await?.json().await?;
                for doc in page.documents {
                    records.push(decode_document(doc)?);
                }
                match page.next_page_token.filter(|t| !t.is_empty()) {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
            debug!(count = records.len(), "listed collection");
            Ok(records)
        }
        .instrument(span)
        .await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<FieldMap>, StoreError> {
        let url = format!("{}/{collection}/{id}", self.documents_url());
        let resp = self.send(|| self.client.get(&url)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc: Document = ensure_success(resp).await?.json().await?;
        decode_fields(&doc.fields).map(Some)
    }

    async fn set(&self, collection: &str, id: &str, fields: &FieldMap) -> Result<(), StoreError> {
        let (encoded, transforms) = encode_fields(fields, "")?;
        let mut write = json!({
            "update": { "name": self.document_name(collection, id), "fields": encoded },
        });
        if !transforms.is_empty() {
            write["updateTransforms"] = JsonValue::Array(server_time_transforms(transforms));
        }
        self.commit(vec![write]).await
    }

    async fn patch(&self, collection: &str, id: &str, patch: &PatchMap) -> Result<(), StoreError> {
        let write = patch_write(self.document_name(collection, id), patch)?;
        match self.commit(vec![write]).await {
            Err(StoreError::Rejected { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Err(StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })
            }
            other => other,
        }
    }

    async fn delete_many(&self, collection: &str, ids: &[RecordId]) -> Result<usize, StoreError> {
        if ids.len() > MAX_BATCH_WRITES {
            return Err(StoreError::BatchTooLarge {
                len: ids.len(),
                max: MAX_BATCH_WRITES,
            });
        }
        if ids.is_empty() {
            return Ok(0);
        }
        let writes = ids
            .iter()
            .map(|id| json!({ "delete": self.document_name(collection, id) }))
            .collect();
        self.commit(writes).await?;
        Ok(ids.len())
    }

    async fn query_by_equality_pair(
        &self,
        collection: &str,
        first: (&str, &Value),
        second: (&str, &Value),
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let url = format!("{}:runQuery", self.documents_url());
        let filter = |(field, value): (&str, &Value)| -> Result<JsonValue, StoreError> {
            let encoded = encode_value(value)?;
            Ok(json!({
                "fieldFilter": {
                    "field": { "fieldPath": field_path(field) },
                    "op": "EQUAL",
                    "value": encoded,
                }
            }))
        };
        let filters = vec![filter(first)?, filter(second)?];
        let body = json!({
            "structuredQuery": {
                "from": [{ "collectionId": collection }],
                "where": {
                    "compositeFilter": { "op": "AND", "filters": filters }
                },
                "limit": limit,
            }
        });
        let resp = self.send(|| self.client.post(&url).json(&body)).await?;
        let rows: Vec<QueryRow> = ensure_success(resp).await?.json().await?;
        rows.into_iter()
            .filter_map(|row| row.document)
            .map(decode_document)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use docmig_core::fields;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn typed_values_decode_from_wire_shape() {
        let wire = json!({
            "nombre": { "stringValue": "Acme Corp" },
            "monto": { "integerValue": "1500000" },
            "activo": { "booleanValue": true },
            "creado": { "timestampValue": "2025-03-01T10:00:00Z" },
            "tags": { "arrayValue": { "values": [{ "stringValue": "proveedor" }] } },
            "vacio": { "arrayValue": {} },
            "contacto": { "mapValue": { "fields": { "email": { "nullValue": null } } } },
        });
        let decoded = decode_fields(wire.as_object().unwrap()).expect("decode");

        assert_eq!(decoded["nombre"], Value::from("Acme Corp"));
        assert_eq!(decoded["monto"], Value::Integer(1_500_000));
        assert_eq!(decoded["activo"], Value::Bool(true));
        assert_eq!(
            decoded["creado"],
            Value::Timestamp(Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).single().unwrap())
        );
        assert_eq!(decoded["tags"], Value::Array(vec![Value::from("proveedor")]));
        assert_eq!(decoded["vacio"], Value::Array(vec![]));
        assert_eq!(
            decoded["contacto"],
            Value::Map(fields([("email", Value::Null)]))
        );
    }

    #[test]
    fn server_timestamps_become_transforms() {
        let mut record = fields([("nombre", "Acme")]);
        record.insert("fechaUltimaModificacion".into(), Value::ServerTimestamp);
        let mut meta = FieldMap::new();
        meta.insert("visto en".into(), Value::ServerTimestamp);
        record.insert("meta".into(), Value::Map(meta));

        let (encoded, transforms) = encode_fields(&record, "").expect("encode");
        assert!(encoded.contains_key("nombre"));
        assert!(!encoded.contains_key("fechaUltimaModificacion"));
        assert_eq!(
            transforms,
            vec!["fechaUltimaModificacion".to_string(), "meta.`visto en`".to_string()]
        );
    }

    #[test]
    fn integers_encode_as_strings() {
        assert_eq!(
            encode_value(&Value::Integer(42)).unwrap(),
            json!({ "integerValue": "42" })
        );
        assert!(encode_value(&Value::Array(vec![Value::ServerTimestamp])).is_err());
    }

    #[test]
    fn ids_come_from_document_names() {
        assert_eq!(
            id_from_name("projects/p/databases/(default)/documents/contratos/c-17"),
            "c-17"
        );
    }

    #[test]
    fn patch_keeps_nested_server_timestamps_as_transforms() {
        let mut audit = FieldMap::new();
        audit.insert("por".into(), Value::from("docmig"));
        audit.insert("en".into(), Value::ServerTimestamp);
        let mut patch = PatchMap::new();
        patch.insert("auditoria".into(), FieldPatch::Set(Value::Map(audit)));
        patch.insert("actualizado".into(), FieldPatch::Set(Value::ServerTimestamp));
        patch.insert("role".into(), FieldPatch::Unset);

        let write = patch_write("projects/p/databases/(default)/documents/users/u1".into(), &patch)
            .expect("encode");
        assert_eq!(write["updateMask"]["fieldPaths"], json!(["auditoria", "role"]));
        let nested = &write["update"]["fields"]["auditoria"]["mapValue"]["fields"];
        assert_eq!(nested["por"], json!({ "stringValue": "docmig" }));
        assert!(nested.get("en").is_none());

        let mut paths: Vec<&str> = write["updateTransforms"]
            .as_array()
            .expect("transforms")
            .iter()
            .map(|t| {
                assert_eq!(t["setToServerValue"], "REQUEST_TIME");
                t["fieldPath"].as_str().expect("path")
            })
            .collect();
        paths.sort_unstable();
        assert_eq!(paths, vec!["actualizado", "auditoria.en"]);
    }
}
