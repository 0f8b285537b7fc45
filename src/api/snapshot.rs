use crate::core::SnapshotMetadata;
use crate::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::value::{MapValue, Value};

/// One document as read by [`Client::get_document`](crate::api::Client::get_document).
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    key: DocumentKey,
    data: Option<MapValue>,
    version: SnapshotVersion,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub fn new(key: DocumentKey, data: Option<MapValue>, version: SnapshotVersion, metadata: SnapshotMetadata) -> Self {
        Self {
            key,
            data,
            version,
            metadata,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&MapValue> {
        self.data.as_ref()
    }

    /// Value at `path`, if the document exists and has it.
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        self.data.as_ref()?.get(path)
    }

    /// Last server version the cache knows for this document.
    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn from_cache(&self) -> bool {
        self.metadata.from_cache()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.metadata.has_pending_writes()
    }
}
