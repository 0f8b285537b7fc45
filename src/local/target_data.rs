use crate::core::Query;
use crate::model::{ListenSequenceNumber, SnapshotVersion, TargetId};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after the server's existence filter disagreed with the local count.
    ExistenceFilterMismatch,
    /// Re-listen after a bloom filter check found a false positive.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

/// Everything the cache tracks about one listened target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Query,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Version of the last consistent snapshot received for this target.
    pub snapshot_version: SnapshotVersion,
    /// Last version at which the target's view had no documents in limbo.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque server token for resuming the target. Empty when unknown.
    pub resume_token: Vec<u8>,
    /// Number of documents the client believes match, sent when resuming.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Query,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// New resume point. Clears any expected count tied to the old one.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: TargetPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}
