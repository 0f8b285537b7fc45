use serde_json::Value as JsonValue;

use crate::error::{invalid_argument, internal_error, SyncError, SyncResult};
use crate::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::remote::rpc_error::StatusPayload;
use crate::remote::serializer::{decode_bytes, JsonSerializer};

/// One decoded message from the watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

impl WatchChange {
    /// Global snapshot version carried by the message.
    ///
    /// Only a target change that names no targets marks a consistent snapshot;
    /// every other message yields `SnapshotVersion::min()`.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        match self {
            WatchChange::TargetChange(change)
                if change.target_ids.is_empty() && change.state == TargetChangeState::NoChange =>
            {
                change.read_time
            }
            _ => SnapshotVersion::min(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means "every target".
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: SnapshotVersion,
    pub cause: Option<SyncError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: SnapshotVersion::min(),
            cause: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

/// A document entering, changing in, or leaving targets.
///
/// `document` is a found document for updates, a no-document for deletes and
/// `None` when the server only stopped tracking the key for some targets.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub document: Option<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterParams>,
}

/// Raw bloom filter parameters; validated when the filter is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterParams {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

/// Decodes one watch response. Unknown message kinds decode to `None`.
pub fn decode_watch_change(
    serializer: &JsonSerializer,
    value: &JsonValue,
) -> SyncResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }
    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }
    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }
    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }
    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }
    Ok(None)
}

fn decode_target_change(serializer: &JsonSerializer, value: &JsonValue) -> SyncResult<WatchChange> {
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusPayload>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .map(StatusPayload::into_error);

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids: numeric_array(value.get("targetIds")),
        resume_token: decode_bytes(value.get("resumeToken"))?,
        read_time: serializer.decode_version(value.get("readTime"))?,
        cause,
    }))
}

fn decode_document_change(serializer: &JsonSerializer, value: &JsonValue) -> SyncResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document)?;
    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: document.key().clone(),
        document: Some(document),
    }))
}

fn decode_document_delete(serializer: &JsonSerializer, value: &JsonValue) -> SyncResult<WatchChange> {
    let key = document_name(serializer, value, "documentDelete")?;
    let read_time = serializer.decode_version(value.get("readTime"))?;
    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        document: Some(Document::new_no_document(key.clone(), read_time)),
        key,
    }))
}

fn decode_document_remove(serializer: &JsonSerializer, value: &JsonValue) -> SyncResult<WatchChange> {
    let key = document_name(serializer, value, "documentRemove")?;
    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        document: None,
    }))
}

fn document_name(serializer: &JsonSerializer, value: &JsonValue, kind: &str) -> SyncResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.document_key_from_name(name)
}

fn decode_filter_change(value: &JsonValue) -> SyncResult<WatchChange> {
    let target_id = int32_field(value, "targetId", "filter")?
        .ok_or_else(|| invalid_argument("filter missing targetId"))?;
    // Zero-valued fields are omitted on the wire.
    let count = int32_field(value, "count", "filter")?.unwrap_or(0);

    let unchanged_names = match value.get("unchangedNames") {
        Some(names) => {
            let bits = names.get("bits");
            let padding = match bits {
                Some(bits) => int32_field(bits, "padding", "bloom filter")?.unwrap_or(0),
                None => 0,
            };
            let hash_count = int32_field(names, "hashCount", "bloom filter")?.unwrap_or(0);
            // A bitmap that does not decode leaves the filter absent rather than failing the stream.
            decode_bytes(bits.and_then(|bits| bits.get("bitmap")))
                .ok()
                .map(|bitmap| BloomFilterParams {
                    bitmap,
                    padding,
                    hash_count,
                })
        }
        None => None,
    };

    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

/// Reads an optional 32-bit integer; anything present that is not one is an error.
fn int32_field(value: &JsonValue, field: &str, context: &str) -> SyncResult<Option<i32>> {
    match value.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(raw) => raw
            .as_i64()
            .and_then(|number| i32::try_from(number).ok())
            .map(Some)
            .ok_or_else(|| invalid_argument(format!("{context} has an invalid {field}: {raw}"))),
    }
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().and_then(|value| TargetId::try_from(value).ok()))
                .collect()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Add,
        "REMOVE" => TargetChangeState::Remove,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde_json::json;

    use super::*;
    use crate::error::SyncErrorCode;
    use crate::test_support::{key, version};

    fn serializer() -> JsonSerializer {
        JsonSerializer::new("projects/demo/databases/main")
    }

    fn decode(value: JsonValue) -> WatchChange {
        decode_watch_change(&serializer(), &value).unwrap().unwrap()
    }

    #[test]
    fn decodes_target_change() {
        let change = decode(json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": BASE64_STANDARD.encode([1u8, 2, 3]),
                "targetChangeType": "CURRENT"
            }
        }));
        match change {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn only_global_no_change_carries_a_snapshot_version() {
        let global = decode(json!({
            "targetChange": { "readTime": "1970-01-01T00:00:04Z" }
        }));
        assert_eq!(global.snapshot_version(), version(4));

        let targeted = decode(json!({
            "targetChange": { "targetIds": [2], "readTime": "1970-01-01T00:00:04Z" }
        }));
        assert!(targeted.snapshot_version().is_min());
    }

    #[test]
    fn decodes_rejection_cause() {
        let change = decode(json!({
            "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [4],
                "cause": { "code": 7, "message": "denied" }
            }
        }));
        let WatchChange::TargetChange(change) = change else {
            panic!("expected target change");
        };
        let cause = change.cause.unwrap();
        assert_eq!(cause.code, SyncErrorCode::PermissionDenied);
        assert_eq!(cause.message(), "denied");
    }

    #[test]
    fn deletes_and_removes_become_document_changes() {
        let delete = decode(json!({
            "documentDelete": {
                "document": "projects/demo/databases/main/documents/rooms/a",
                "readTime": "1970-01-01T00:00:09Z",
                "removedTargetIds": [2]
            }
        }));
        let WatchChange::DocumentChange(delete) = delete else {
            panic!("expected document change");
        };
        assert_eq!(delete.removed_target_ids, vec![2]);
        let document = delete.document.unwrap();
        assert!(document.is_no_document());
        assert_eq!(document.version(), version(9));

        let remove = decode(json!({
            "documentRemove": {
                "document": "projects/demo/databases/main/documents/rooms/a",
                "removedTargetIds": [2]
            }
        }));
        let WatchChange::DocumentChange(remove) = remove else {
            panic!("expected document change");
        };
        assert_eq!(remove.key, key("rooms/a"));
        assert!(remove.document.is_none());
    }

    #[test]
    fn decodes_existence_filter_with_bloom_filter() {
        let change = decode(json!({
            "filter": {
                "targetId": 2,
                "count": 3,
                "unchangedNames": {
                    "bits": { "bitmap": BASE64_STANDARD.encode([0xffu8]), "padding": 1 },
                    "hashCount": 2
                }
            }
        }));
        assert_eq!(
            change,
            WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 3,
                unchanged_names: Some(BloomFilterParams {
                    bitmap: vec![0xff],
                    padding: 1,
                    hash_count: 2,
                }),
            })
        );
    }

    #[test]
    fn filter_counts_outside_the_int32_range_are_rejected() {
        let oversized = json!({ "filter": { "targetId": 2, "count": 4_294_967_301i64 } });
        let err = decode_watch_change(&serializer(), &oversized).unwrap_err();
        assert_eq!(err.code, SyncErrorCode::InvalidArgument);

        let malformed_hash_count = json!({
            "filter": {
                "targetId": 2,
                "count": 1,
                "unchangedNames": {
                    "bits": { "bitmap": BASE64_STANDARD.encode([0x01u8]), "padding": 0 },
                    "hashCount": "many"
                }
            }
        });
        assert!(decode_watch_change(&serializer(), &malformed_hash_count).is_err());

        let huge_padding = json!({
            "filter": {
                "targetId": 2,
                "unchangedNames": { "bits": { "padding": 1_099_511_627_776i64 }, "hashCount": 1 }
            }
        });
        assert!(decode_watch_change(&serializer(), &huge_padding).is_err());
    }

    #[test]
    fn omitted_filter_count_means_zero() {
        let change = decode(json!({ "filter": { "targetId": 2 } }));
        assert_eq!(
            change,
            WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 0,
                unchanged_names: None,
            })
        );
    }

    #[test]
    fn unknown_messages_are_ignored() {
        assert!(decode_watch_change(&serializer(), &json!({ "heartbeat": {} }))
            .unwrap()
            .is_none());
    }
}
