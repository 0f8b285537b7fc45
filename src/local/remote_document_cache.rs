use std::collections::BTreeMap;

use crate::local::persistence::{StorageChange, Transaction};
use crate::model::{Document, DocumentKey, DocumentMap, ResourcePath, SnapshotVersion};

/// Last known server state of every cached document.
#[derive(Debug, Default)]
pub struct RemoteDocumentCache {
    documents: BTreeMap<DocumentKey, Document>,
    byte_size: usize,
}

impl RemoteDocumentCache {
    /// Cached entry for `key`, or an invalid document if nothing is cached.
    pub fn get(&self, key: &DocumentKey) -> Document {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| Document::new_invalid(key.clone()))
    }

    pub fn get_all<'a, I>(&self, keys: I) -> DocumentMap
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .map(|key| (key.clone(), self.get(key)))
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    /// Documents directly inside `collection` whose read time is after `since_read_time`.
    pub fn documents_in_collection(
        &self,
        collection: &ResourcePath,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        let start = DocumentKey::collection_range_start(collection);
        self.documents
            .range(start..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, document)| {
                collection.is_immediate_parent_of(key.path()) && document.read_time() > since_read_time
            })
            .map(|(key, document)| (key.clone(), document.clone()))
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.documents.keys()
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Estimated size in bytes of everything cached, used by the garbage collector.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub(crate) fn put(&mut self, document: Document) -> Option<Document> {
        self.byte_size += document.estimate_byte_size();
        let previous = self.documents.insert(document.key().clone(), document);
        if let Some(previous) = &previous {
            self.byte_size = self.byte_size.saturating_sub(previous.estimate_byte_size());
        }
        previous
    }

    pub(crate) fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        let previous = self.documents.remove(key);
        if let Some(previous) = &previous {
            self.byte_size = self.byte_size.saturating_sub(previous.estimate_byte_size());
        }
        previous
    }
}

impl Transaction<'_> {
    /// Caches `document` as of `read_time` and registers its collection as a parent.
    pub fn put_document(&mut self, mut document: Document, read_time: SnapshotVersion) {
        document.set_read_time(read_time);
        self.add_to_collection_parent_index(document.key().collection_path());
        self.record(StorageChange::PutDocument(document));
    }

    pub fn remove_document(&mut self, key: &DocumentKey) {
        if self.remote_documents().contains_key(key) {
            self.record(StorageChange::RemoveDocument(key.clone()));
        }
    }
}
