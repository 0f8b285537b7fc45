mod document;
mod document_key;
mod field_path;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod timestamp;

pub use document::{Document, DocumentKeySet, DocumentMap, DocumentState, DocumentType};
pub use document_key::DocumentKey;
pub use field_path::{FieldPath, IntoFieldPath};
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationKind, MutationResult,
    Precondition, TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult, OverlayedDocument};
pub use overlay::Overlay;
pub use resource_path::ResourcePath;
pub use timestamp::{SnapshotVersion, Timestamp};

pub type BatchId = i32;
pub type TargetId = i32;
pub type ListenSequenceNumber = i64;

pub const BATCH_ID_UNKNOWN: BatchId = -1;
pub const LISTEN_SEQUENCE_INVALID: ListenSequenceNumber = -1;
