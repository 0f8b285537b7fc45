use std::collections::{BTreeMap, BTreeSet};

use crate::error::{failed_precondition, invalid_argument, SyncResult};
use crate::local::persistence::{StorageChange, Transaction};
use crate::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, ResourcePath, Timestamp, BATCH_ID_UNKNOWN,
};

/// Pending write batches of one user, ordered by batch id.
#[derive(Debug, Default)]
pub struct MutationQueue {
    batches: BTreeMap<BatchId, MutationBatch>,
    batches_by_key: BTreeSet<(DocumentKey, BatchId)>,
    next_batch_id: BatchId,
}

impl MutationQueue {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn next_batch_id(&self) -> BatchId {
        self.next_batch_id.max(1)
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches.get(&batch_id)
    }

    /// First queued batch with an id greater than `batch_id`.
    pub fn next_mutation_batch_after(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches
            .range(batch_id.saturating_add(1)..)
            .next()
            .map(|(_, batch)| batch)
    }

    pub fn first_batch_id(&self) -> Option<BatchId> {
        self.batches.keys().next().copied()
    }

    /// Id of the newest queued batch, or [`BATCH_ID_UNKNOWN`] when the queue is empty.
    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.batches
            .keys()
            .next_back()
            .copied()
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn all_mutation_batches(&self) -> impl Iterator<Item = &MutationBatch> {
        self.batches.values()
    }

    pub fn all_mutation_batches_affecting_key(&self, key: &DocumentKey) -> Vec<&MutationBatch> {
        self.all_mutation_batches_affecting_keys(std::iter::once(key))
    }

    /// Batches touching any of `keys`, in batch id order.
    pub fn all_mutation_batches_affecting_keys<'a, I>(&self, keys: I) -> Vec<&MutationBatch>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            batch_ids.extend(self.batch_ids_for_key(key));
        }
        batch_ids
            .into_iter()
            .filter_map(|batch_id| self.batches.get(&batch_id))
            .collect()
    }

    /// Batches touching a document directly inside `collection`, in batch id order.
    pub fn all_mutation_batches_affecting_collection(
        &self,
        collection: &ResourcePath,
    ) -> Vec<&MutationBatch> {
        let start = (DocumentKey::collection_range_start(collection), BatchId::MIN);
        let batch_ids: BTreeSet<BatchId> = self
            .batches_by_key
            .range(start..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, _)| collection.is_immediate_parent_of(key.path()))
            .map(|(_, batch_id)| *batch_id)
            .collect();
        batch_ids
            .into_iter()
            .filter_map(|batch_id| self.batches.get(&batch_id))
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batch_ids_for_key(key).next().is_some()
    }

    fn batch_ids_for_key<'a>(&'a self, key: &DocumentKey) -> impl Iterator<Item = BatchId> + 'a {
        let key = key.clone();
        self.batches_by_key
            .range((key.clone(), BatchId::MIN)..)
            .take_while(move |(candidate, _)| *candidate == key)
            .map(|(_, batch_id)| *batch_id)
    }

    pub(crate) fn put(&mut self, batch: MutationBatch) -> Option<MutationBatch> {
        self.next_batch_id = self.next_batch_id.max(batch.batch_id + 1);
        for key in batch.keys() {
            self.batches_by_key.insert((key, batch.batch_id));
        }
        self.batches.insert(batch.batch_id, batch)
    }

    pub(crate) fn remove(&mut self, batch_id: BatchId) -> Option<MutationBatch> {
        let batch = self.batches.remove(&batch_id)?;
        for key in batch.keys() {
            self.batches_by_key.remove(&(key, batch_id));
        }
        Some(batch)
    }
}

impl Transaction<'_> {
    /// Queues a new batch for the transaction's user and returns it with its assigned id.
    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> SyncResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(invalid_argument("A mutation batch needs at least one mutation"));
        }
        let batch_id = self.mutation_queue().next_batch_id();
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for mutation in &batch.mutations {
            self.add_to_collection_parent_index(mutation.key.collection_path());
        }
        self.record(StorageChange::PutMutationBatch {
            user: self.user().to_string(),
            batch: batch.clone(),
        });
        Ok(batch)
    }

    /// Removes `batch`, which must be the oldest queued batch.
    pub fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> SyncResult<()> {
        if self.mutation_queue().first_batch_id() != Some(batch.batch_id) {
            return Err(failed_precondition(format!(
                "Only the oldest queued batch can be removed, got batch {}",
                batch.batch_id
            )));
        }
        self.record(StorageChange::RemoveMutationBatch {
            user: self.user().to_string(),
            batch_id: batch.batch_id,
        });
        for key in batch.keys() {
            self.touch_document(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::persistence::MemoryPersistence;
    use crate::test_support::{key, set_mutation};

    fn add(persistence: &mut MemoryPersistence, user: &str, paths: &[&str]) -> MutationBatch {
        let mutations = paths.iter().map(|path| set_mutation(path, &[])).collect();
        persistence
            .run_transaction("add", user, |txn| {
                txn.add_mutation_batch(Timestamp::new(1, 0), Vec::new(), mutations)
            })
            .unwrap()
    }

    #[test]
    fn assigns_increasing_batch_ids() {
        let mut persistence = MemoryPersistence::new();
        let first = add(&mut persistence, "anonymous", &["rooms/a"]);
        let second = add(&mut persistence, "anonymous", &["rooms/b"]);
        assert_eq!(first.batch_id, 1);
        assert_eq!(second.batch_id, 2);

        let queue = persistence.state().user_queues("anonymous").mutation_queue();
        assert_eq!(queue.highest_unacknowledged_batch_id(), 2);
        assert_eq!(queue.next_mutation_batch_after(1).map(|b| b.batch_id), Some(2));
        assert_eq!(queue.next_mutation_batch_after(BATCH_ID_UNKNOWN).map(|b| b.batch_id), Some(1));
    }

    #[test]
    fn finds_batches_by_key_and_collection() {
        let mut persistence = MemoryPersistence::new();
        add(&mut persistence, "anonymous", &["rooms/a", "users/u"]);
        add(&mut persistence, "anonymous", &["rooms/b"]);
        add(&mut persistence, "anonymous", &["rooms/a/messages/m"]);

        let queue = persistence.state().user_queues("anonymous").mutation_queue();
        let by_key: Vec<_> = queue
            .all_mutation_batches_affecting_key(&key("rooms/a"))
            .iter()
            .map(|batch| batch.batch_id)
            .collect();
        assert_eq!(by_key, vec![1]);

        let rooms = ResourcePath::from_string("rooms").unwrap();
        let by_collection: Vec<_> = queue
            .all_mutation_batches_affecting_collection(&rooms)
            .iter()
            .map(|batch| batch.batch_id)
            .collect();
        assert_eq!(by_collection, vec![1, 2]);
    }

    #[test]
    fn only_the_oldest_batch_can_be_removed() {
        let mut persistence = MemoryPersistence::new();
        let first = add(&mut persistence, "anonymous", &["rooms/a"]);
        let second = add(&mut persistence, "anonymous", &["rooms/b"]);

        let err = persistence
            .run_transaction("remove", "anonymous", |txn| txn.remove_mutation_batch(&second))
            .unwrap_err();
        assert_eq!(err.code_str(), "sync/failed-precondition");

        persistence
            .run_transaction("remove", "anonymous", |txn| txn.remove_mutation_batch(&first))
            .unwrap();
        let queue = persistence.state().user_queues("anonymous").mutation_queue();
        assert!(!queue.contains_key(&key("rooms/a")));
        assert!(queue.contains_key(&key("rooms/b")));
    }

    #[test]
    fn queues_are_partitioned_by_user() {
        let mut persistence = MemoryPersistence::new();
        add(&mut persistence, "uid:alice", &["rooms/a"]);
        let bob = add(&mut persistence, "uid:bob", &["rooms/b"]);
        assert_eq!(bob.batch_id, 1);
        assert!(persistence
            .state()
            .user_queues("uid:alice")
            .mutation_queue()
            .contains_key(&key("rooms/a")));
        assert!(persistence
            .state()
            .user_queues("uid:carol")
            .mutation_queue()
            .is_empty());
    }
}
