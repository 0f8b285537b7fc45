use crate::model::{BatchId, DocumentKey, Mutation};

/// Net effect of all pending local writes on one document, tagged with the newest
/// batch that contributed to it.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.mutation.key
    }
}
