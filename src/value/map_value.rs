use std::collections::BTreeMap;

use crate::model::FieldPath;
use crate::value::{Value, ValueKind};

/// Document contents: a tree of named fields addressed by [`FieldPath`].
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, Value>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        find_in_map(&self.fields, path.segments())
    }

    /// Writes `value` at `path`, replacing any non-map parents on the way.
    pub fn set(&mut self, path: &FieldPath, value: Value) {
        set_value_at_segments(&mut self.fields, path.segments(), value);
    }

    /// Removes the value at `path`. Parents left empty by the removal are kept.
    pub fn delete(&mut self, path: &FieldPath) {
        remove_value_at_segments(&mut self.fields, path.segments());
    }

    /// Applies a batch of sets (`Some`) and deletes (`None`).
    pub fn set_all<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (FieldPath, Option<Value>)>,
    {
        for (path, value) in entries {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    pub fn estimate_byte_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(key, value)| key.len() + value.estimate_byte_size())
            .sum()
    }
}

fn find_in_map<'a>(fields: &'a BTreeMap<String, Value>, segments: &[String]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let value = fields.get(first)?;
    if rest.is_empty() {
        Some(value)
    } else if let ValueKind::Map(child) = value.kind() {
        find_in_map(child.fields(), rest)
    } else {
        None
    }
}

fn set_value_at_segments(fields: &mut BTreeMap<String, Value>, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let entry = fields
        .entry(first.clone())
        .or_insert_with(|| Value::from_map(BTreeMap::new()));

    let mut child_fields = match entry.kind() {
        ValueKind::Map(map) => map.fields().clone(),
        _ => BTreeMap::new(),
    };

    set_value_at_segments(&mut child_fields, rest, value);
    *entry = Value::from_map(child_fields);
}

fn remove_value_at_segments(fields: &mut BTreeMap<String, Value>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(value) = fields.get(first).cloned() {
        if let ValueKind::Map(child_map) = value.kind() {
            let mut child_fields = child_map.fields().clone();
            remove_value_at_segments(&mut child_fields, rest);
            fields.insert(first.clone(), Value::from_map(child_fields));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn sets_nested_values() {
        let mut map = MapValue::empty();
        map.set(&path("author.name"), Value::from_string("ada"));
        map.set(&path("author.age"), Value::from_integer(36));
        assert_eq!(map.get(&path("author.name")), Some(&Value::from_string("ada")));
        assert_eq!(map.get(&path("author.age")), Some(&Value::from_integer(36)));
        assert!(map.get(&path("author.missing")).is_none());
    }

    #[test]
    fn set_replaces_scalar_parent() {
        let mut map = MapValue::empty();
        map.set(&path("a"), Value::from_integer(1));
        map.set(&path("a.b"), Value::from_bool(true));
        assert_eq!(map.get(&path("a.b")), Some(&Value::from_bool(true)));
    }

    #[test]
    fn delete_keeps_parent_map() {
        let mut map = MapValue::empty();
        map.set(&path("a.b"), Value::from_integer(1));
        map.delete(&path("a.b"));
        assert!(map.get(&path("a.b")).is_none());
        assert!(map.get(&path("a")).is_some());
    }
}
