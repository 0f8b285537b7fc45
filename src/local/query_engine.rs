use log::debug;

use crate::core::{LimitType, Query};
use crate::local::persistence::Transaction;
use crate::model::{Document, DocumentKeySet, DocumentMap, SnapshotVersion, BATCH_ID_UNKNOWN};

pub const DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE: usize = 100;
pub const DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT: f64 = 2.0;

/// Counters collected while running one query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryContext {
    pub documents_read_count: usize,
}

/// Picks the cheapest way to answer a query from the local cache.
///
/// In order: a field index covering the filters, the previous result set plus
/// everything changed since the last limbo-free snapshot, and finally a full scan of
/// the collection. Full scans that read far more documents than they return create
/// an index for next time.
#[derive(Clone, Debug)]
pub struct QueryEngine {
    index_auto_creation_enabled: bool,
    index_auto_creation_min_collection_size: usize,
    relative_index_read_cost_per_document: f64,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self {
            index_auto_creation_enabled: true,
            index_auto_creation_min_collection_size: DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
            relative_index_read_cost_per_document: DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
        }
    }
}

impl QueryEngine {
    pub fn new(
        index_auto_creation_enabled: bool,
        index_auto_creation_min_collection_size: usize,
        relative_index_read_cost_per_document: f64,
    ) -> Self {
        Self {
            index_auto_creation_enabled,
            index_auto_creation_min_collection_size,
            relative_index_read_cost_per_document,
        }
    }

    /// All local documents matching `query`, unsorted and without the limit applied.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut Transaction<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> DocumentMap {
        if let Some(results) = self.perform_query_using_index(txn, query) {
            return results;
        }
        if let Some(results) =
            self.perform_query_using_remote_keys(txn, query, last_limbo_free_snapshot_version, remote_keys)
        {
            return results;
        }

        let mut context = QueryContext::default();
        let results = txn.get_documents_matching_query(
            query,
            SnapshotVersion::min(),
            BATCH_ID_UNKNOWN,
            Some(&mut context),
        );
        if self.index_auto_creation_enabled {
            self.create_cache_indexes(txn, query, &context, results.len());
        }
        results
    }

    fn perform_query_using_index(&self, txn: &mut Transaction<'_>, query: &Query) -> Option<DocumentMap> {
        if query.is_document_query() {
            return None;
        }
        let mut candidates = txn.index_manager().documents_matching_query(query)?;
        let collection_overlays = match query.collection_group_id() {
            Some(group) => txn
                .document_overlays()
                .overlays_for_collection_group(group, BATCH_ID_UNKNOWN),
            None => txn
                .document_overlays()
                .overlays_for_collection(query.path(), BATCH_ID_UNKNOWN),
        };
        candidates.extend(collection_overlays.into_keys());

        debug!(
            "Answering query {} from an index ({} candidates)",
            query.canonical_id(),
            candidates.len()
        );
        let documents = txn.get_local_documents(&candidates);
        Some(
            documents
                .into_iter()
                .filter(|(_, document)| query.matches(document))
                .collect(),
        )
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut Transaction<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> Option<DocumentMap> {
        if matches_all_documents(query) || last_limbo_free_snapshot_version.is_min() {
            return None;
        }

        let previous = txn.get_local_documents(remote_keys);
        let mut previous_results: Vec<Document> = previous
            .into_values()
            .filter(|document| query.matches(document))
            .collect();
        previous_results.sort_by(|left, right| query.compare(left, right));

        if query.has_limit()
            && needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version)
        {
            return None;
        }

        debug!(
            "Re-using previous result from {last_limbo_free_snapshot_version} to execute query {}",
            query.canonical_id()
        );
        let mut results =
            txn.get_documents_matching_query(query, last_limbo_free_snapshot_version, BATCH_ID_UNKNOWN, None);
        for document in previous_results {
            results.insert(document.key().clone(), document);
        }
        Some(results)
    }

    fn create_cache_indexes(
        &self,
        txn: &mut Transaction<'_>,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) {
        if context.documents_read_count < self.index_auto_creation_min_collection_size {
            return;
        }
        let read_cost = self.relative_index_read_cost_per_document * result_size as f64;
        if read_cost < context.documents_read_count as f64 {
            debug!(
                "Full scan of query {} read {} documents for {result_size} results; creating an index",
                query.canonical_id(),
                context.documents_read_count
            );
            txn.create_target_indexes(query);
        }
    }
}

/// Whether the query matches a whole collection, in which case a scan is cheapest.
fn matches_all_documents(query: &Query) -> bool {
    query.filters().is_empty()
        && !query.has_limit()
        && !query.is_document_query()
        && query
            .normalized_order_by()
            .iter()
            .all(|order| order.field.is_key_field())
}

/// A limit query can only reuse its previous results if none of them left the
/// result set and the document at the edge has not changed since.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[Document],
    remote_keys: &DocumentKeySet,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
        None => false,
    }
}
