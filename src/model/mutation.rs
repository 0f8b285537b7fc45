use std::collections::BTreeSet;

use crate::model::{Document, DocumentKey, FieldPath, SnapshotVersion, Timestamp};
use crate::value::{MapValue, Value, ValueKind};

/// Set of field paths touched by a write.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when `path` equals or is nested under one of the mask entries.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with<'a, I>(mut self, other: I) -> Self
    where
        I: IntoIterator<Item = &'a FieldPath>,
    {
        self.fields.extend(other.into_iter().cloned());
        self
    }
}

/// Condition the stored document must satisfy for a write to apply.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &Document) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<Value>),
    ArrayRemove(Vec<Value>),
    NumericIncrement(Value),
}

impl TransformOperation {
    /// Result of the transform before the server has seen it.
    pub fn apply_to_local_view(&self, previous: Option<&Value>, local_write_time: Timestamp) -> Value {
        match self {
            TransformOperation::ServerTimestamp => {
                Value::server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
        }
    }

    /// Result once the server reported `transform_result` for this transform.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&Value>,
        transform_result: Option<&Value>,
    ) -> Value {
        match (self, transform_result) {
            (TransformOperation::ArrayUnion(elements), _) => array_union(previous, elements),
            (TransformOperation::ArrayRemove(elements), _) => array_remove(previous, elements),
            (_, Some(result)) => result.clone(),
            (TransformOperation::NumericIncrement(operand), None) => {
                numeric_increment(previous, operand)
            }
            (TransformOperation::ServerTimestamp, None) => Value::null(),
        }
    }

    /// Value that a non-idempotent transform should be replayed against.
    pub fn compute_base_value(&self, previous: Option<&Value>) -> Option<Value> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => Value::from_integer(0),
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: MapValue },
    /// Writes the fields listed in `field_mask`; mask entries missing from `data` are deleted.
    Patch { data: MapValue, field_mask: FieldMask },
    Delete,
    /// Checks the precondition without changing anything.
    Verify,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub key: DocumentKey,
    pub kind: MutationKind,
    pub precondition: Precondition,
    pub field_transforms: Vec<FieldTransform>,
}

/// Per-write outcome reported by the server on acknowledgement.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<Value>,
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self {
            key,
            kind: MutationKind::Set { value },
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// Partial update that requires the document to exist.
    pub fn patch(key: DocumentKey, data: MapValue, field_mask: FieldMask) -> Self {
        Self {
            key,
            kind: MutationKind::Patch { data, field_mask },
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn verify(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            kind: MutationKind::Verify,
            precondition: Precondition::UpdateTime(version),
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transform(mut self, field: FieldPath, operation: TransformOperation) -> Self {
        self.field_transforms.push(FieldTransform::new(field, operation));
        self
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, MutationKind::Delete)
    }

    /// Fields this mutation writes, or `None` when it replaces the whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { field_mask, .. } => Some(field_mask.clone()),
            _ => None,
        }
    }

    /// Applies the write to the local view of `document`.
    ///
    /// `previous_mask` is the set of fields already changed by earlier writes (`None`
    /// meaning the whole document); the returned mask includes the fields touched here.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }

        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                data.set_all(transform_results);
                let version = document.version();
                document.convert_to_found(version, data).set_has_local_mutations();
                None
            }
            MutationKind::Patch { data, field_mask } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut new_data = document.data().clone();
                new_data.set_all(patch_entries(data, field_mask));
                new_data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found(version, new_data)
                    .set_has_local_mutations();
                previous_mask.map(|mask| {
                    mask.union_with(field_mask.fields())
                        .union_with(self.field_transforms.iter().map(|transform| &transform.field))
                })
            }
            MutationKind::Delete => {
                let version = document.version();
                document.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Applies the acknowledged write to the cached remote document.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationResult) {
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.server_transform_results(document, result);
                let mut data = value.clone();
                data.set_all(transform_results);
                document
                    .convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { data, field_mask } => {
                if !self.precondition.is_valid_for(document) {
                    // The server applied the patch against a document we have never seen.
                    document.convert_to_unknown(result.version);
                    return;
                }
                let transform_results = self.server_transform_results(document, result);
                let mut new_data = document.data().clone();
                new_data.set_all(patch_entries(data, field_mask));
                new_data.set_all(transform_results);
                document
                    .convert_to_found(result.version, new_data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Base values for transforms that are not idempotent (numeric increments), so that
    /// replaying this write against a newer server document stays stable.
    pub fn extract_transform_base_value(&self, document: &Document) -> Option<MapValue> {
        let mut base: Option<MapValue> = None;
        for transform in &self.field_transforms {
            let existing = document.field(&transform.field);
            if let Some(coerced) = transform.operation.compute_base_value(existing) {
                base.get_or_insert_with(MapValue::empty)
                    .set(&transform.field, coerced);
            }
        }
        base
    }

    fn local_transform_results(
        &self,
        document: &Document,
        local_write_time: Timestamp,
    ) -> Vec<(FieldPath, Option<Value>)> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(&transform.field);
                let value = transform
                    .operation
                    .apply_to_local_view(previous, local_write_time);
                (transform.field.clone(), Some(value))
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &Document,
        result: &MutationResult,
    ) -> Vec<(FieldPath, Option<Value>)> {
        self.field_transforms
            .iter()
            .enumerate()
            .map(|(index, transform)| {
                let previous = document.field(&transform.field);
                let value = transform
                    .operation
                    .apply_to_remote_document(previous, result.transform_results.get(index));
                (transform.field.clone(), Some(value))
            })
            .collect()
    }
}

/// Collapses the local changes of `document` into a single overlay write.
///
/// Returns `None` when the document carries no local changes or `mask` is empty.
pub fn calculate_overlay_mutation(document: &Document, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() || mask.map(FieldMask::is_empty).unwrap_or(false) {
        return None;
    }

    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };

    let data = document.data();
    let mut patch_value = MapValue::empty();
    let mut mask_set = BTreeSet::new();
    for path in mask.fields() {
        if mask_set.contains(path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = data.get(&path).cloned();
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = data.get(&parent).cloned();
                path = parent;
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value),
            None => patch_value.delete(&path),
        }
        mask_set.insert(path);
    }

    Some(
        Mutation::patch(document.key().clone(), patch_value, FieldMask::new(mask_set))
            .with_precondition(Precondition::None),
    )
}

fn patch_entries(data: &MapValue, field_mask: &FieldMask) -> Vec<(FieldPath, Option<Value>)> {
    field_mask
        .fields()
        .iter()
        .map(|path| (path.clone(), data.get(path).cloned()))
        .collect()
}

fn coerce_to_array(previous: Option<&Value>) -> Vec<Value> {
    match previous.map(Value::kind) {
        Some(ValueKind::Array(array)) => array.values().to_vec(),
        _ => Vec::new(),
    }
}

fn array_union(previous: Option<&Value>, additions: &[Value]) -> Value {
    let mut values = coerce_to_array(previous);
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    Value::from_array(values)
}

fn array_remove(previous: Option<&Value>, removals: &[Value]) -> Value {
    let values = coerce_to_array(previous)
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
        .collect();
    Value::from_array(values)
}

fn numeric_increment(previous: Option<&Value>, operand: &Value) -> Value {
    let base = match previous {
        Some(value) if value.is_number() => value.kind().clone(),
        _ => ValueKind::Integer(0),
    };
    match (base, operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            Value::from_integer(current.saturating_add(*delta))
        }
        (ValueKind::Integer(current), ValueKind::Double(delta)) => {
            Value::from_double(current as f64 + delta)
        }
        (ValueKind::Double(current), ValueKind::Integer(delta)) => {
            Value::from_double(current + *delta as f64)
        }
        (ValueKind::Double(current), ValueKind::Double(delta)) => Value::from_double(current + delta),
        (base, _) => value_from_kind(base),
    }
}

fn value_from_kind(kind: ValueKind) -> Value {
    match kind {
        ValueKind::Integer(value) => Value::from_integer(value),
        ValueKind::Double(value) => Value::from_double(value),
        _ => Value::from_integer(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn map(entries: &[(&str, Value)]) -> MapValue {
        let mut result = MapValue::empty();
        for (field, value) in entries {
            result.set(&path(field), value.clone());
        }
        result
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn set_replaces_document_locally() {
        let mut document = Document::new_found(key(), version(1), map(&[("a", Value::from_integer(1))]));
        let mutation = Mutation::set(key(), map(&[("b", Value::from_integer(2))]));
        let mask = mutation.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        assert!(mask.is_none());
        assert!(document.has_local_mutations());
        assert!(document.field(&path("a")).is_none());
        assert_eq!(document.field(&path("b")), Some(&Value::from_integer(2)));
    }

    #[test]
    fn patch_requires_existing_document() {
        let mut document = Document::new_invalid(key());
        let mutation = Mutation::patch(
            key(),
            map(&[("a", Value::from_integer(1))]),
            FieldMask::new([path("a")]),
        );
        let mask = mutation.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(!document.is_valid_document());
    }

    #[test]
    fn patch_deletes_masked_fields_missing_from_data() {
        let mut document = Document::new_found(
            key(),
            version(1),
            map(&[("a", Value::from_integer(1)), ("b", Value::from_integer(2))]),
        );
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::new([path("a")]));
        let mask = mutation.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::new([path("a")])));
        assert!(document.field(&path("a")).is_none());
        assert_eq!(document.field(&path("b")), Some(&Value::from_integer(2)));
    }

    #[test]
    fn server_timestamp_placeholder_then_server_value() {
        let mut document = Document::new_found(key(), version(1), MapValue::empty());
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty())
            .with_transform(path("at"), TransformOperation::ServerTimestamp);
        mutation.apply_to_local_view(&mut document, None, Timestamp::new(5, 0));
        assert!(document.field(&path("at")).unwrap().is_server_timestamp());

        let mut remote = Document::new_found(key(), version(1), MapValue::empty());
        let server_time = Value::from_timestamp(Timestamp::new(6, 0));
        mutation.apply_to_remote_document(
            &mut remote,
            &MutationResult {
                version: version(6),
                transform_results: vec![server_time.clone()],
            },
        );
        assert_eq!(remote.field(&path("at")), Some(&server_time));
        assert!(remote.has_committed_mutations());
    }

    #[test]
    fn increments_and_array_transforms() {
        let mut document = Document::new_found(
            key(),
            version(1),
            map(&[
                ("count", Value::from_integer(2)),
                ("tags", Value::from_array(vec![Value::from_string("a")])),
            ]),
        );
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty())
            .with_transform(path("count"), TransformOperation::NumericIncrement(Value::from_integer(3)))
            .with_transform(
                path("tags"),
                TransformOperation::ArrayUnion(vec![Value::from_string("a"), Value::from_string("b")]),
            );
        mutation.apply_to_local_view(&mut document, None, Timestamp::now());
        assert_eq!(document.field(&path("count")), Some(&Value::from_integer(5)));
        assert_eq!(
            document.field(&path("tags")),
            Some(&Value::from_array(vec![Value::from_string("a"), Value::from_string("b")]))
        );
    }

    #[test]
    fn patch_ack_on_unseen_document_becomes_unknown() {
        let mut document = Document::new_invalid(key());
        let mutation = Mutation::patch(key(), map(&[("a", Value::from_integer(1))]), FieldMask::new([path("a")]));
        mutation.apply_to_remote_document(
            &mut document,
            &MutationResult {
                version: version(4),
                transform_results: Vec::new(),
            },
        );
        assert!(document.is_unknown_document());
    }

    #[test]
    fn overlay_for_whole_document_and_patch() {
        let mut document = Document::new_found(key(), version(1), map(&[("a", Value::from_integer(1))]));
        document.set_has_local_mutations();
        let overlay = calculate_overlay_mutation(&document, None).unwrap();
        assert!(matches!(overlay.kind, MutationKind::Set { .. }));

        let overlay =
            calculate_overlay_mutation(&document, Some(&FieldMask::new([path("a"), path("gone.x")])))
                .unwrap();
        match overlay.kind {
            MutationKind::Patch { data, field_mask } => {
                assert_eq!(data.get(&path("a")), Some(&Value::from_integer(1)));
                assert!(field_mask.fields().contains(&path("gone")));
            }
            other => panic!("unexpected overlay: {other:?}"),
        }
        assert!(calculate_overlay_mutation(&document, Some(&FieldMask::empty())).is_none());

        let mut deleted = Document::new_no_document(key(), SnapshotVersion::min());
        deleted.set_has_local_mutations();
        assert!(calculate_overlay_mutation(&deleted, None).unwrap().is_delete());
    }
}
