//! Fixtures shared by the crate's unit tests.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::core::Query;
use crate::model::{Document, DocumentKey, FieldMask, FieldPath, Mutation, SnapshotVersion, Timestamp};
use crate::util::backoff::ExponentialBackoff;
use crate::value::{MapValue, Value};

#[cfg(not(target_arch = "wasm32"))]
mod sink;

#[cfg(not(target_arch = "wasm32"))]
pub use sink::{offline_remote_store, RecordingSink};

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

pub fn map(fields: &[(&str, Value)]) -> MapValue {
    MapValue::new(
        fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// Found document at `version(seconds)`.
pub fn doc(path: &str, seconds: i64, fields: &[(&str, Value)]) -> Document {
    Document::new_found(key(path), version(seconds), map(fields))
}

pub fn deleted_doc(path: &str, seconds: i64) -> Document {
    Document::new_no_document(key(path), version(seconds))
}

pub fn query(path: &str) -> Query {
    Query::collection(path).unwrap()
}

pub fn set_mutation(path: &str, fields: &[(&str, Value)]) -> Mutation {
    Mutation::set(key(path), map(fields))
}

/// Patch whose mask is exactly the given fields.
pub fn patch_mutation(path: &str, fields: &[(&str, Value)]) -> Mutation {
    let mask = FieldMask::new(
        fields
            .iter()
            .map(|(name, _)| FieldPath::from_dot_separated(name).unwrap()),
    );
    Mutation::patch(key(path), map(fields), mask)
}

pub fn delete_mutation(path: &str) -> Mutation {
    Mutation::delete(key(path))
}

/// Deterministic backoff: immediate first retry, 10 ms base, 100 ms cap.
pub fn test_backoff() -> ExponentialBackoff {
    ExponentialBackoff::with_rng(
        Duration::from_millis(10),
        1.5,
        Duration::from_millis(100),
        StdRng::seed_from_u64(17),
    )
}
