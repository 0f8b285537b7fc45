use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::core::{Direction, FieldFilter, Operator, Query};
use crate::error::{invalid_argument, SyncResult};
use crate::local::target_data::TargetData;
use crate::model::{
    Document, DocumentKey, FieldMask, FieldPath, FieldTransform, Mutation, MutationKind,
    MutationResult, Precondition, ResourcePath, SnapshotVersion, TargetId, Timestamp,
    TransformOperation,
};
use crate::value::{MapValue, Value, ValueKind};

/// Server acknowledgement of one write request.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub write_results: Vec<MutationResult>,
}

/// JSON message codec for the watch and write streams.
#[derive(Clone, Debug)]
pub struct JsonSerializer {
    database_name: String,
}

impl JsonSerializer {
    /// `database_name` is the resource prefix, e.g. `projects/demo/databases/main`.
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
        }
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            format!("{}/documents", self.database_name)
        } else {
            format!("{}/documents/{}", self.database_name, path.canonical_string())
        }
    }

    pub fn document_key_from_name(&self, name: &str) -> SyncResult<DocumentKey> {
        let prefix = format!("{}/documents/", self.database_name);
        let path = name
            .strip_prefix(&prefix)
            .ok_or_else(|| invalid_argument(format!("Resource name '{name}' is outside this database")))?;
        DocumentKey::from_string(path)
    }

    pub fn encode_value(&self, value: &Value) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> SyncResult<Value> {
        decode_value(value)
    }

    pub fn decode_version(&self, value: Option<&JsonValue>) -> SyncResult<SnapshotVersion> {
        match value.and_then(JsonValue::as_str) {
            Some(timestamp) => Ok(SnapshotVersion::new(parse_timestamp(timestamp)?)),
            None => Ok(SnapshotVersion::min()),
        }
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> JsonValue {
        json!(encode_timestamp(&version.timestamp()))
    }

    /// Decodes a watch `document` object into a found document.
    pub fn decode_document(&self, value: &JsonValue) -> SyncResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Watch document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let version = self.decode_version(value.get("updateTime"))?;
        if version.is_min() {
            return Err(invalid_argument(format!("Watch document {key} has no update time")));
        }
        let data = decode_map_value(value)?;
        Ok(Document::new_found(key, version, data))
    }

    pub fn encode_document(&self, document: &Document) -> JsonValue {
        json!({
            "name": self.document_name(document.key()),
            "fields": encode_map_fields(document.data()),
            "updateTime": self.encode_version(document.version()),
        })
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let name = self.document_name(&mutation.key);
        let mut write = serde_json::Map::new();
        match &mutation.kind {
            MutationKind::Set { value } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": name, "fields": encode_map_fields(value) }),
                );
            }
            MutationKind::Patch { data, field_mask } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": name, "fields": encode_map_fields(data) }),
                );
                let mask: Vec<String> = field_mask
                    .fields()
                    .iter()
                    .map(FieldPath::canonical_string)
                    .collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": mask }));
            }
            MutationKind::Delete => {
                write.insert("delete".to_string(), json!(name));
            }
            MutationKind::Verify => {
                write.insert("verify".to_string(), json!(name));
            }
        }
        if !mutation.field_transforms.is_empty() {
            let transforms = mutation
                .field_transforms
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect();
            write.insert("updateTransforms".to_string(), JsonValue::Array(transforms));
        }
        match &mutation.precondition {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".to_string(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".to_string(),
                    json!({ "updateTime": self.encode_version(*version) }),
                );
            }
        }
        JsonValue::Object(write)
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> SyncResult<Mutation> {
        let precondition = match value.get("currentDocument") {
            Some(current) => match (current.get("exists"), current.get("updateTime")) {
                (Some(exists), _) => Precondition::Exists(
                    exists
                        .as_bool()
                        .ok_or_else(|| invalid_argument("currentDocument.exists must be bool"))?,
                ),
                (None, Some(_)) => Precondition::UpdateTime(self.decode_version(current.get("updateTime"))?),
                (None, None) => Precondition::None,
            },
            None => Precondition::None,
        };

        let mut mutation = if let Some(update) = value.get("update") {
            let key = self.key_field(update.get("name"))?;
            let data = decode_map_value(update)?;
            match value.get("updateMask") {
                Some(mask) => {
                    let fields = mask
                        .get("fieldPaths")
                        .and_then(JsonValue::as_array)
                        .map(|paths| {
                            paths
                                .iter()
                                .filter_map(JsonValue::as_str)
                                .map(FieldPath::from_dot_separated)
                                .collect::<SyncResult<Vec<_>>>()
                        })
                        .transpose()?
                        .unwrap_or_default();
                    Mutation::patch(key, data, FieldMask::new(fields))
                }
                None => Mutation::set(key, data),
            }
        } else if let Some(name) = value.get("delete") {
            Mutation::delete(self.key_field(Some(name))?)
        } else if let Some(name) = value.get("verify") {
            Mutation::verify(self.key_field(Some(name))?, SnapshotVersion::min())
        } else {
            return Err(invalid_argument("Write has no update, delete or verify"));
        };
        mutation.precondition = precondition;

        if let Some(transforms) = value.get("updateTransforms").and_then(JsonValue::as_array) {
            for transform in transforms {
                let transform = self.decode_field_transform(transform)?;
                mutation = mutation.with_transform(transform.field, transform.operation);
            }
        }
        Ok(mutation)
    }

    fn key_field(&self, name: Option<&JsonValue>) -> SyncResult<DocumentKey> {
        let name = name
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Write is missing a document name"))?;
        self.document_key_from_name(name)
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field.canonical_string();
        match &transform.operation {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": encode_value(operand)
            }),
        }
    }

    fn decode_field_transform(&self, value: &JsonValue) -> SyncResult<FieldTransform> {
        let field = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Field transform missing fieldPath"))?;
        let field = FieldPath::from_dot_separated(field)?;
        let operation = if value.get("setToServerValue").is_some() {
            TransformOperation::ServerTimestamp
        } else if let Some(union) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(decode_array_values(union)?)
        } else if let Some(remove) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(decode_array_values(remove)?)
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(decode_value(operand)?)
        } else {
            return Err(invalid_argument("Unknown field transform"));
        };
        Ok(FieldTransform::new(field, operation))
    }

    /// Encodes an `addTarget` payload, resuming from the token or read time when known.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let query = &target_data.target;
        let mut target = serde_json::Map::new();
        target.insert("targetId".to_string(), json!(target_data.target_id));
        if query.is_document_query() {
            target.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(query.path())] }),
            );
        } else {
            target.insert("query".to_string(), self.encode_query_target(query));
        }

        if !target_data.resume_token.is_empty() {
            target.insert(
                "resumeToken".to_string(),
                json!(BASE64_STANDARD.encode(&target_data.resume_token)),
            );
        } else if !target_data.snapshot_version.is_min() {
            target.insert(
                "readTime".to_string(),
                self.encode_version(target_data.snapshot_version),
            );
        }
        let resuming = !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min();
        if let (true, Some(expected)) = (resuming, target_data.expected_count) {
            target.insert("expectedCount".to_string(), json!(expected));
        }
        JsonValue::Object(target)
    }

    fn encode_query_target(&self, query: &Query) -> JsonValue {
        let (parent, collection_id) = match query.collection_group_id() {
            Some(group) => (query.path().clone(), group.to_string()),
            None => (
                query.path().without_last(),
                query.path().last_segment().unwrap_or_default().to_string(),
            ),
        };

        let mut structured = serde_json::Map::new();
        structured.insert(
            "from".to_string(),
            json!([{
                "collectionId": collection_id,
                "allDescendants": query.is_collection_group_query(),
            }]),
        );
        if !query.filters().is_empty() {
            structured.insert("where".to_string(), encode_filters(query.filters()));
        }
        let orders: Vec<JsonValue> = query
            .server_order_by()
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field.canonical_string() },
                    "direction": match order.direction {
                        Direction::Ascending => "ASCENDING",
                        Direction::Descending => "DESCENDING",
                    },
                })
            })
            .collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));
        if let Some(limit) = query.limit() {
            structured.insert("limit".to_string(), json!(limit as i64));
        }

        json!({
            "parent": self.resource_name(&parent),
            "structuredQuery": JsonValue::Object(structured),
        })
    }

    pub fn encode_listen_request(&self, target_data: &TargetData) -> JsonValue {
        json!({
            "database": self.database_name,
            "addTarget": self.encode_target(target_data),
        })
    }

    pub fn encode_unlisten_request(&self, target_id: TargetId) -> JsonValue {
        json!({
            "database": self.database_name,
            "removeTarget": target_id,
        })
    }

    pub fn encode_handshake(&self) -> JsonValue {
        json!({ "database": self.database_name })
    }

    pub fn encode_write_request(&self, stream_token: &[u8], mutations: &[Mutation]) -> JsonValue {
        json!({
            "streamToken": BASE64_STANDARD.encode(stream_token),
            "writes": mutations
                .iter()
                .map(|mutation| self.encode_mutation(mutation))
                .collect::<Vec<_>>(),
        })
    }

    pub fn decode_write_response(&self, value: &JsonValue) -> SyncResult<WriteResponse> {
        let stream_token = decode_bytes(value.get("streamToken"))?;
        let commit_version = self.decode_version(value.get("commitTime"))?;
        let write_results = value
            .get("writeResults")
            .and_then(JsonValue::as_array)
            .map(|results| {
                results
                    .iter()
                    .map(|result| self.decode_write_result(result, commit_version))
                    .collect::<SyncResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        Ok(WriteResponse {
            stream_token,
            commit_version,
            write_results,
        })
    }

    /// A result without `updateTime` (a no-op write) reports the commit version.
    fn decode_write_result(
        &self,
        value: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> SyncResult<MutationResult> {
        let mut version = self.decode_version(value.get("updateTime"))?;
        if version.is_min() {
            version = commit_version;
        }
        let transform_results = value
            .get("transformResults")
            .and_then(JsonValue::as_array)
            .map(|values| values.iter().map(decode_value).collect::<SyncResult<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        Ok(MutationResult {
            version,
            transform_results,
        })
    }
}

pub(crate) fn decode_bytes(value: Option<&JsonValue>) -> SyncResult<Vec<u8>> {
    match value.and_then(JsonValue::as_str) {
        Some(encoded) => BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}"))),
        None => Ok(Vec::new()),
    }
}

fn operator_name(op: Operator) -> &'static str {
    match op {
        Operator::LessThan => "LESS_THAN",
        Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        Operator::Equal => "EQUAL",
        Operator::NotEqual => "NOT_EQUAL",
        Operator::GreaterThan => "GREATER_THAN",
        Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        Operator::ArrayContains => "ARRAY_CONTAINS",
        Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        Operator::In => "IN",
        Operator::NotIn => "NOT_IN",
    }
}

fn encode_filters(filters: &[FieldFilter]) -> JsonValue {
    if let [filter] = filters {
        return encode_field_filter(filter);
    }
    json!({
        "compositeFilter": {
            "op": "AND",
            "filters": filters.iter().map(encode_field_filter).collect::<Vec<_>>()
        }
    })
}

fn encode_field_filter(filter: &FieldFilter) -> JsonValue {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": filter.field.canonical_string() },
            "op": operator_name(filter.op),
            "value": encode_value(&filter.value)
        }
    })
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let fields = map
        .fields()
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(value)))
        .collect();
    JsonValue::Object(fields)
}

fn encode_value(value: &Value) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => json!({ "doubleValue": double }),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
        // Placeholders only live in local views; writes carry the transform instead.
        ValueKind::ServerTimestamp(_) => json!({ "nullValue": JsonValue::Null }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": BASE64_STANDARD.encode(bytes) }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": { "fields": encode_map_fields(map) }
        }),
    }
}

fn decode_map_value(value: &JsonValue) -> SyncResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::empty()),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_array_values(value: &JsonValue) -> SyncResult<Vec<Value>> {
    match value.get("values").and_then(JsonValue::as_array) {
        Some(entries) => entries.iter().map(decode_value).collect(),
        None => Ok(Vec::new()),
    }
}

fn decode_value(value: &JsonValue) -> SyncResult<Value> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected value object"))?;
    if object.contains_key("nullValue") {
        return Ok(Value::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(Value::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(Value::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => value
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(Value::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(Value::from_timestamp(parse_timestamp(timestamp)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(Value::from_string(value));
    }
    if object.contains_key("bytesValue") {
        return Ok(Value::from_bytes(decode_bytes(object.get("bytesValue"))?));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(Value::from_reference(value));
    }
    if let Some(array_value) = object.get("arrayValue") {
        return Ok(Value::from_array(decode_array_values(array_value)?));
    }
    if let Some(map_value) = object.get("mapValue") {
        let map = decode_map_value(map_value)?;
        return Ok(Value::from_map(map.fields().clone()));
    }

    Err(invalid_argument("Unknown value type"))
}

fn encode_timestamp(timestamp: &Timestamp) -> String {
    let datetime = Utc
        .timestamp_opt(timestamp.seconds, timestamp.nanos.max(0) as u32)
        .single()
        .unwrap_or_default();
    datetime.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> SyncResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}
