use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::core::{FieldFilter, Operator, Query};
use crate::local::persistence::{StorageChange, Transaction};
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::model::{Document, DocumentKey, DocumentKeySet, FieldPath, ResourcePath};
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKind {
    Ascending,
    Descending,
    /// Indexes each element of an array field separately.
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSegment {
    pub field: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field: FieldPath, kind: IndexKind) -> Self {
        Self { field, kind }
    }
}

/// A composite index over documents of one collection group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
}

impl FieldIndex {
    pub fn new(index_id: i32, collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id,
            collection_group: collection_group.into(),
            segments,
        }
    }

    /// Whether every filter of `query` is answered by exactly one segment of this index.
    pub fn covers(&self, query: &Query) -> bool {
        if query.collection_id() != Some(self.collection_group.as_str())
            || query.filters().is_empty()
            || query.filters().len() != self.segments.len()
        {
            return false;
        }
        self.segments.iter().all(|segment| {
            let mut matching = query
                .filters()
                .iter()
                .filter(|filter| filter.field == segment.field);
            match (matching.next(), matching.next()) {
                (Some(filter), None) => segment_kind_for(filter) == Some(segment.kind)
                    || (segment.kind == IndexKind::Descending
                        && segment_kind_for(filter) == Some(IndexKind::Ascending)),
                _ => false,
            }
        })
    }

    /// Entry rows `document` contributes. Empty when a segment's field is missing.
    fn rows_for(&self, document: &Document) -> Vec<IndexRow> {
        if !document.is_found_document() {
            return Vec::new();
        }
        let mut columns = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            let Some(value) = document.field(&segment.field) else {
                return Vec::new();
            };
            let column = match segment.kind {
                IndexKind::Contains => match value.as_array() {
                    Some(array) => array
                        .values()
                        .iter()
                        .map(Value::canonical_id)
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect(),
                    None => return Vec::new(),
                },
                IndexKind::Ascending | IndexKind::Descending => vec![value.canonical_id()],
            };
            columns.push(column);
        }
        cartesian(columns)
    }
}

type IndexRow = Vec<String>;

/// Collection-parent index plus the field indexes used to answer queries without a
/// full collection scan.
#[derive(Debug, Default)]
pub struct IndexManager {
    collection_parents: BTreeMap<String, BTreeSet<ResourcePath>>,
    field_indexes: BTreeMap<i32, FieldIndex>,
    entries: BTreeMap<i32, BTreeMap<IndexRow, DocumentKeySet>>,
    rows_by_document: BTreeMap<DocumentKey, Vec<(i32, IndexRow)>>,
}

impl IndexManager {
    /// Parent paths of every known collection named `collection_id`.
    pub fn collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_collection_parent(&self, collection_path: &ResourcePath) -> bool {
        match collection_path.last_segment() {
            Some(collection_id) => self
                .collection_parents
                .get(collection_id)
                .is_some_and(|parents| parents.contains(&collection_path.without_last())),
            None => true,
        }
    }

    pub fn field_indexes(&self) -> impl Iterator<Item = &FieldIndex> {
        self.field_indexes.values()
    }

    pub fn field_index(&self, index_id: i32) -> Option<&FieldIndex> {
        self.field_indexes.get(&index_id)
    }

    pub fn next_index_id(&self) -> i32 {
        self.field_indexes.keys().next_back().map_or(1, |id| id + 1)
    }

    pub fn index_for_query(&self, query: &Query) -> Option<&FieldIndex> {
        self.field_indexes.values().find(|index| index.covers(query))
    }

    /// Keys whose indexed values satisfy the filters of `query`, or `None` when no
    /// index covers it. Results may include documents outside the query's path.
    pub fn documents_matching_query(&self, query: &Query) -> Option<DocumentKeySet> {
        let index = self.index_for_query(query)?;
        let mut columns = Vec::with_capacity(index.segments.len());
        for segment in &index.segments {
            let filter = query
                .filters()
                .iter()
                .find(|filter| filter.field == segment.field)?;
            columns.push(filter_candidates(filter));
        }

        let entries = self.entries.get(&index.index_id)?;
        let mut keys = DocumentKeySet::new();
        for row in cartesian(columns) {
            if let Some(matched) = entries.get(&row) {
                keys.extend(matched.iter().cloned());
            }
        }
        Some(keys)
    }

    pub(crate) fn add_collection_parent(&mut self, collection_path: &ResourcePath) -> bool {
        let Some(collection_id) = collection_path.last_segment() else {
            return false;
        };
        self.collection_parents
            .entry(collection_id.to_string())
            .or_default()
            .insert(collection_path.without_last())
    }

    pub(crate) fn remove_collection_parent(&mut self, collection_path: &ResourcePath) -> bool {
        let Some(collection_id) = collection_path.last_segment() else {
            return false;
        };
        let Some(parents) = self.collection_parents.get_mut(collection_id) else {
            return false;
        };
        let removed = parents.remove(&collection_path.without_last());
        if parents.is_empty() {
            self.collection_parents.remove(collection_id);
        }
        removed
    }

    /// Registers `index` and backfills it from every cached document.
    pub(crate) fn put_field_index(
        &mut self,
        index: FieldIndex,
        documents: &RemoteDocumentCache,
    ) -> Option<FieldIndex> {
        let previous = self.remove_field_index(index.index_id);
        let index_id = index.index_id;
        self.field_indexes.insert(index_id, index);
        for document in documents.documents() {
            self.index_document_for(index_id, document);
        }
        previous
    }

    pub(crate) fn remove_field_index(&mut self, index_id: i32) -> Option<FieldIndex> {
        let removed = self.field_indexes.remove(&index_id)?;
        self.entries.remove(&index_id);
        for rows in self.rows_by_document.values_mut() {
            rows.retain(|(id, _)| *id != index_id);
        }
        self.rows_by_document.retain(|_, rows| !rows.is_empty());
        Some(removed)
    }

    pub(crate) fn index_document(&mut self, document: &Document) {
        self.unindex_document(document.key());
        let index_ids: Vec<i32> = self
            .field_indexes
            .values()
            .filter(|index| index.collection_group == document.key().collection_group())
            .map(|index| index.index_id)
            .collect();
        for index_id in index_ids {
            self.index_document_for(index_id, document);
        }
    }

    pub(crate) fn unindex_document(&mut self, key: &DocumentKey) {
        let Some(rows) = self.rows_by_document.remove(key) else {
            return;
        };
        for (index_id, row) in rows {
            let Some(entries) = self.entries.get_mut(&index_id) else {
                continue;
            };
            if let Some(keys) = entries.get_mut(&row) {
                keys.remove(key);
                if keys.is_empty() {
                    entries.remove(&row);
                }
            }
        }
    }

    fn index_document_for(&mut self, index_id: i32, document: &Document) {
        let Some(index) = self.field_indexes.get(&index_id) else {
            return;
        };
        if index.collection_group != document.key().collection_group() {
            return;
        }
        let rows = index.rows_for(document);
        if rows.is_empty() {
            return;
        }
        let entries = self.entries.entry(index_id).or_default();
        let document_rows = self.rows_by_document.entry(document.key().clone()).or_default();
        for row in rows {
            entries
                .entry(row.clone())
                .or_default()
                .insert(document.key().clone());
            document_rows.push((index_id, row));
        }
    }
}

impl Transaction<'_> {
    pub fn add_to_collection_parent_index(&mut self, collection_path: ResourcePath) {
        if !self.index_manager().has_collection_parent(&collection_path) {
            self.record(StorageChange::AddCollectionParent(collection_path));
        }
    }

    /// Creates an index answering `query`'s filters, unless one exists or the
    /// filters cannot be indexed. Returns whether an index was created.
    pub fn create_target_indexes(&mut self, query: &Query) -> bool {
        if self.index_manager().index_for_query(query).is_some() {
            return false;
        }
        let Some(collection_group) = query.collection_id().map(str::to_string) else {
            return false;
        };
        let Some(segments) = index_segments_for(query) else {
            return false;
        };
        let index = FieldIndex::new(self.index_manager().next_index_id(), collection_group, segments);
        debug!(
            "Creating field index {} on '{}' for query {}",
            index.index_id,
            index.collection_group,
            query.canonical_id()
        );
        self.record(StorageChange::PutFieldIndex(index));
        true
    }

    pub fn delete_field_index(&mut self, index_id: i32) {
        if self.index_manager().field_index(index_id).is_some() {
            self.record(StorageChange::RemoveFieldIndex(index_id));
        }
    }
}

fn segment_kind_for(filter: &FieldFilter) -> Option<IndexKind> {
    if filter.field.is_key_field() {
        return None;
    }
    match filter.op {
        Operator::Equal | Operator::In => Some(IndexKind::Ascending),
        Operator::ArrayContains | Operator::ArrayContainsAny => Some(IndexKind::Contains),
        _ => None,
    }
}

/// Segments of an index answering every filter of `query`, one per field.
fn index_segments_for(query: &Query) -> Option<Vec<IndexSegment>> {
    if query.filters().is_empty() {
        return None;
    }
    let mut seen = BTreeSet::new();
    let mut segments = Vec::new();
    for filter in query.filters() {
        let kind = segment_kind_for(filter)?;
        if !seen.insert(filter.field.clone()) {
            return None;
        }
        segments.push(IndexSegment::new(filter.field.clone(), kind));
    }
    Some(segments)
}

fn filter_candidates(filter: &FieldFilter) -> Vec<String> {
    match filter.op {
        Operator::In | Operator::ArrayContainsAny => filter
            .value
            .as_array()
            .map(|array| array.values().iter().map(Value::canonical_id).collect())
            .unwrap_or_default(),
        _ => vec![filter.value.canonical_id()],
    }
}

fn cartesian(columns: Vec<Vec<String>>) -> Vec<IndexRow> {
    columns.into_iter().fold(vec![Vec::new()], |rows, column| {
        rows.iter()
            .flat_map(|row| {
                column.iter().map(move |value| {
                    let mut extended = row.clone();
                    extended.push(value.clone());
                    extended
                })
            })
            .collect()
    })
}
