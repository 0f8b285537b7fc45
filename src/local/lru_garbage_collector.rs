use std::collections::{BTreeSet, BinaryHeap};

use log::{debug, info};

use crate::local::persistence::{PersistenceState, StorageChange, Transaction};
use crate::model::{DocumentKey, DocumentKeySet, ListenSequenceNumber, TargetId, LISTEN_SEQUENCE_INVALID};

/// Disables collection entirely when used as the cache size threshold.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;

pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
const DEFAULT_PERCENTILE_TO_COLLECT: u32 = 10;
const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Collection only runs once the cache holds more than this many bytes.
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: DEFAULT_PERCENTILE_TO_COLLECT,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }
}

impl LruParams {
    pub fn with_cache_size(cache_size_bytes: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size_bytes,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(CACHE_SIZE_UNLIMITED)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub fn did_not_run() -> Self {
        Self::default()
    }
}

impl Transaction<'_> {
    /// Stamps `key` with the transaction's sequence number.
    pub fn touch_document(&mut self, key: &DocumentKey) {
        let sequence_number = self.sequence_number();
        self.record(StorageChange::PutDocumentSequenceNumber {
            key: key.clone(),
            sequence_number,
        });
    }

    /// Runs one collection pass.
    ///
    /// `active_target_ids` are targets with live listeners; `local_view_keys` are
    /// documents currently held by a view. Neither is ever collected.
    pub fn collect_garbage(
        &mut self,
        params: &LruParams,
        active_target_ids: &BTreeSet<TargetId>,
        local_view_keys: &DocumentKeySet,
    ) -> LruResults {
        if params.cache_size_collection_threshold == CACHE_SIZE_UNLIMITED {
            debug!("Garbage collection skipped; cache size is unlimited");
            return LruResults::did_not_run();
        }
        let cache_size = self.remote_documents().byte_size() as i64;
        if cache_size <= params.cache_size_collection_threshold {
            debug!(
                "Garbage collection skipped; cache size {cache_size} is within threshold {}",
                params.cache_size_collection_threshold
            );
            return LruResults::did_not_run();
        }

        let count = sequence_number_count(self.state(), local_view_keys);
        let mut to_collect = (params.percentile_to_collect as usize * count) / 100;
        if to_collect > params.maximum_sequence_numbers_to_collect {
            debug!(
                "Capping sequence numbers to collect at {} (would be {to_collect})",
                params.maximum_sequence_numbers_to_collect
            );
            to_collect = params.maximum_sequence_numbers_to_collect;
        }

        let upper_bound = nth_sequence_number(self.state(), to_collect, local_view_keys);
        let targets_removed = self.remove_targets(upper_bound, active_target_ids);
        let documents_removed = self.remove_orphaned_documents(upper_bound, local_view_keys);

        info!(
            "Garbage collection removed {targets_removed} targets and {documents_removed} documents \
             (upper bound sequence number {upper_bound})"
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        }
    }

    /// Removes inactive targets whose sequence number is at or below `upper_bound`.
    pub fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize {
        let doomed: Vec<TargetId> = self
            .target_cache()
            .targets()
            .filter(|target| {
                target.sequence_number <= upper_bound && !active_target_ids.contains(&target.target_id)
            })
            .map(|target| target.target_id)
            .collect();
        for target_id in &doomed {
            let keys = self.target_cache().matching_keys_for_target_id(*target_id);
            for key in keys {
                self.record(StorageChange::RemoveTargetDocument {
                    target_id: *target_id,
                    key,
                });
            }
            self.record(StorageChange::RemoveTarget(*target_id));
        }
        doomed.len()
    }

    /// Removes cached documents nothing pins anymore.
    pub fn remove_orphaned_documents(
        &mut self,
        upper_bound: ListenSequenceNumber,
        local_view_keys: &DocumentKeySet,
    ) -> usize {
        let doomed: Vec<DocumentKey> = self
            .remote_documents()
            .keys()
            .filter(|key| !is_pinned(self.state(), key, upper_bound, local_view_keys))
            .cloned()
            .collect();
        for key in &doomed {
            self.record(StorageChange::RemoveDocument(key.clone()));
            if self.state().document_sequence_number(key).is_some() {
                self.record(StorageChange::RemoveDocumentSequenceNumber(key.clone()));
            }
        }
        doomed.len()
    }
}

/// Targets plus orphaned documents, each contributing one sequence number.
pub fn sequence_number_count(state: &PersistenceState, local_view_keys: &DocumentKeySet) -> usize {
    state.target_cache().target_count() + orphaned_sequence_numbers(state, local_view_keys).count()
}

/// The `n`-th smallest sequence number among targets and orphaned documents.
pub fn nth_sequence_number(
    state: &PersistenceState,
    n: usize,
    local_view_keys: &DocumentKeySet,
) -> ListenSequenceNumber {
    if n == 0 {
        return LISTEN_SEQUENCE_INVALID;
    }
    let mut smallest = BinaryHeap::with_capacity(n + 1);
    let candidates = state
        .target_cache()
        .targets()
        .map(|target| target.sequence_number)
        .chain(orphaned_sequence_numbers(state, local_view_keys));
    for sequence_number in candidates {
        smallest.push(sequence_number);
        if smallest.len() > n {
            smallest.pop();
        }
    }
    smallest.peek().copied().unwrap_or(LISTEN_SEQUENCE_INVALID)
}

fn orphaned_sequence_numbers<'a>(
    state: &'a PersistenceState,
    local_view_keys: &'a DocumentKeySet,
) -> impl Iterator<Item = ListenSequenceNumber> + 'a {
    state
        .document_sequence_numbers
        .iter()
        .filter(move |(key, sequence_number)| !is_pinned(state, key, **sequence_number, local_view_keys))
        .map(|(_, sequence_number)| *sequence_number)
}

/// A document is pinned while any user's queued mutation, any cached target or any
/// live view references it, or while it was touched after `upper_bound`.
fn is_pinned(
    state: &PersistenceState,
    key: &DocumentKey,
    upper_bound: ListenSequenceNumber,
    local_view_keys: &DocumentKeySet,
) -> bool {
    state
        .users()
        .any(|(_, queues)| queues.mutation_queue().contains_key(key))
        || local_view_keys.contains(key)
        || state.target_cache().contains_key(key)
        || state
            .document_sequence_number(key)
            .is_some_and(|sequence_number| sequence_number > upper_bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::persistence::MemoryPersistence;
    use crate::local::target_data::{TargetData, TargetPurpose};
    use crate::model::Timestamp;
    use crate::test_support::{doc, key, query, set_mutation, version};

    fn params(percentile: u32) -> LruParams {
        LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: percentile,
            maximum_sequence_numbers_to_collect: 1_000,
        }
    }

    fn add_target(persistence: &mut MemoryPersistence, path: &str, target_id: TargetId, sequence_number: ListenSequenceNumber, keys: &[&str]) {
        persistence
            .run_transaction("target", "anonymous", |txn| {
                txn.add_target_data(TargetData::new(query(path), target_id, TargetPurpose::Listen, sequence_number));
                for path in keys {
                    txn.put_document(doc(path, 1, &[]), version(1));
                }
                let keys: DocumentKeySet = keys.iter().map(|path| key(path)).collect();
                txn.add_matching_keys(&keys, target_id);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn collects_the_oldest_inactive_target_first() {
        let mut persistence = MemoryPersistence::new();
        add_target(&mut persistence, "a", 2, 10, &["a/1"]);
        add_target(&mut persistence, "b", 4, 20, &["b/1"]);
        add_target(&mut persistence, "c", 6, 30, &["c/1"]);
        let active = BTreeSet::from([6]);

        let results = persistence
            .run_transaction("gc", "anonymous", |txn| {
                Ok(txn.collect_garbage(&params(50), &active, &DocumentKeySet::new()))
            })
            .unwrap();

        assert!(results.did_run);
        assert_eq!(results.sequence_numbers_collected, 1);
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 1);
        let state = persistence.state();
        assert!(state.target_cache().target_data_for_id(2).is_none());
        assert!(state.target_cache().target_data_for_id(4).is_some());
        assert!(!state.remote_documents().contains_key(&key("a/1")));
        assert!(state.remote_documents().contains_key(&key("b/1")));
    }

    #[test]
    fn never_collects_documents_with_pending_mutations_or_active_targets() {
        let mut persistence = MemoryPersistence::new();
        add_target(&mut persistence, "a", 2, 1, &["a/1"]);
        add_target(&mut persistence, "b", 4, 2, &["b/1", "b/2"]);
        persistence
            .run_transaction("write", "uid:other", |txn| {
                txn.add_mutation_batch(Timestamp::new(1, 0), Vec::new(), vec![set_mutation("a/1", &[])])
            })
            .unwrap();
        let active = BTreeSet::from([4]);

        let results = persistence
            .run_transaction("gc", "anonymous", |txn| {
                Ok(txn.collect_garbage(&params(100), &active, &DocumentKeySet::new()))
            })
            .unwrap();

        assert!(results.did_run);
        let documents = persistence.state().remote_documents();
        assert!(documents.contains_key(&key("a/1")));
        assert!(documents.contains_key(&key("b/1")));
        assert!(documents.contains_key(&key("b/2")));
        assert!(persistence.state().target_cache().target_data_for_id(4).is_some());
    }

    #[test]
    fn skips_when_under_threshold_or_unlimited() {
        let mut persistence = MemoryPersistence::new();
        add_target(&mut persistence, "a", 2, 1, &["a/1"]);
        let none = BTreeSet::new();
        let results = persistence
            .run_transaction("gc", "anonymous", |txn| {
                let unlimited = txn.collect_garbage(&LruParams::disabled(), &none, &DocumentKeySet::new());
                let large = txn.collect_garbage(&LruParams::default(), &none, &DocumentKeySet::new());
                Ok((unlimited, large))
            })
            .unwrap();
        assert_eq!(results, (LruResults::did_not_run(), LruResults::did_not_run()));
    }

    #[test]
    fn nth_sequence_number_of_zero_is_invalid() {
        let persistence = MemoryPersistence::new();
        assert_eq!(
            nth_sequence_number(persistence.state(), 0, &DocumentKeySet::new()),
            LISTEN_SEQUENCE_INVALID
        );
    }
}
