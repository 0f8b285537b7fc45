use crate::model::TargetId;

/// Hands out target ids from one of two disjoint sequences.
///
/// Targets persisted by the local cache use even ids; limbo-resolution targets owned
/// by the sync engine use odd ids, so the two never collide.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    previous_id: TargetId,
}

impl TargetIdGenerator {
    /// Even sequence starting after `highest_target_id` (2, 4, 6, ... on a fresh cache).
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        let seed = if highest_target_id <= 0 {
            0
        } else if highest_target_id % 2 == 0 {
            highest_target_id
        } else {
            highest_target_id - 1
        };
        Self { previous_id: seed }
    }

    /// Odd sequence: 1, 3, 5, ...
    pub fn for_sync_engine() -> Self {
        Self { previous_id: -1 }
    }

    pub fn next(&mut self) -> TargetId {
        self.previous_id += 2;
        self.previous_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_do_not_overlap() {
        let mut cache = TargetIdGenerator::for_target_cache(0);
        let mut engine = TargetIdGenerator::for_sync_engine();
        assert_eq!([cache.next(), cache.next()], [2, 4]);
        assert_eq!([engine.next(), engine.next()], [1, 3]);
    }

    #[test]
    fn resumes_after_persisted_highest_id() {
        let mut cache = TargetIdGenerator::for_target_cache(8);
        assert_eq!(cache.next(), 10);
    }
}
