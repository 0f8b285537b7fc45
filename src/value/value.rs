use std::cmp::Ordering;
use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::model::Timestamp;
use crate::value::{ArrayValue, MapValue};

#[derive(Clone, Debug, PartialEq)]
pub struct Value {
    kind: ValueKind,
}

/// Local placeholder for a server-assigned timestamp that has not been acknowledged yet.
///
/// Keeps the write time used for ordering and whatever value the field held before
/// the write, so listeners may choose to show either.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerTimestampValue {
    pub local_write_time: Timestamp,
    pub previous_value: Option<Box<Value>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    ServerTimestamp(ServerTimestampValue),
    String(String),
    Bytes(Vec<u8>),
    Reference(String),
    Array(ArrayValue),
    Map(MapValue),
}

impl Value {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ValueKind::Bytes(value.into()),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_array(values: Vec<Value>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn server_timestamp(local_write_time: Timestamp, previous_value: Option<Value>) -> Self {
        // Nested placeholders collapse onto the last real value.
        let previous_value = previous_value.and_then(|value| match value.kind {
            ValueKind::ServerTimestamp(inner) => inner.previous_value.map(|boxed| *boxed),
            _ => Some(value),
        });
        Self {
            kind: ValueKind::ServerTimestamp(ServerTimestampValue {
                local_write_time,
                previous_value: previous_value.map(Box::new),
            }),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_server_timestamp(&self) -> bool {
        matches!(self.kind, ValueKind::ServerTimestamp(_))
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    fn type_order(&self) -> u8 {
        match &self.kind {
            ValueKind::Null => 0,
            ValueKind::Boolean(_) => 1,
            ValueKind::Integer(_) | ValueKind::Double(_) => 2,
            ValueKind::Timestamp(_) => 3,
            ValueKind::ServerTimestamp(_) => 4,
            ValueKind::String(_) => 5,
            ValueKind::Bytes(_) => 6,
            ValueKind::Reference(_) => 7,
            ValueKind::Array(_) => 8,
            ValueKind::Map(_) => 9,
        }
    }

    /// Stable textual form, equal for values that compare equal with `==`.
    pub fn canonical_id(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => format!("{value:?}"),
            ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
            ValueKind::ServerTimestamp(value) => format!(
                "serverTimestamp({},{})",
                value.local_write_time.seconds, value.local_write_time.nanos
            ),
            ValueKind::String(value) => format!("{value:?}"),
            ValueKind::Bytes(value) => format!("bytes({})", BASE64_STANDARD.encode(value)),
            ValueKind::Reference(value) => format!("ref({value})"),
            ValueKind::Array(array) => {
                let parts: Vec<String> = array.values().iter().map(Value::canonical_id).collect();
                format!("[{}]", parts.join(","))
            }
            ValueKind::Map(map) => {
                let parts: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{key}:{}", value.canonical_id()))
                    .collect();
                format!("{{{}}}", parts.join(","))
            }
        }
    }

    /// Rough in-memory footprint used for cache accounting.
    pub fn estimate_byte_size(&self) -> usize {
        match &self.kind {
            ValueKind::Null => 4,
            ValueKind::Boolean(_) => 4,
            ValueKind::Integer(_) | ValueKind::Double(_) => 8,
            ValueKind::Timestamp(_) => 16,
            ValueKind::ServerTimestamp(value) => {
                16 + value
                    .previous_value
                    .as_ref()
                    .map(|previous| previous.estimate_byte_size())
                    .unwrap_or(0)
            }
            ValueKind::String(value) => value.len() * 2,
            ValueKind::Bytes(value) => value.len(),
            ValueKind::Reference(value) => value.len() * 2,
            ValueKind::Array(array) => array.values().iter().map(Value::estimate_byte_size).sum(),
            ValueKind::Map(map) => map.estimate_byte_size(),
        }
    }
}

/// Total order over values: first by type, then within the type.
///
/// Integers and doubles share one numeric type; NaN sorts before every other number.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    let type_ordering = left.type_order().cmp(&right.type_order());
    if type_ordering != Ordering::Equal {
        return type_ordering;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_doubles(*a as f64, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_doubles(*a, *b as f64),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::ServerTimestamp(a), ValueKind::ServerTimestamp(b)) => {
            a.local_write_time.cmp(&b.local_write_time)
        }
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => a.split('/').cmp(b.split('/')),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (l, r) in a.values().iter().zip(b.values().iter()) {
                let ordering = compare_values(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.values().len().cmp(&b.values().len())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            for ((lk, lv), (rk, rv)) in a.fields().iter().zip(b.fields().iter()) {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.fields().len().cmp(&b.fields().len())
        }
        _ => Ordering::Equal,
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match left.partial_cmp(&right) {
        Some(ordering) => ordering,
        None => match (left.is_nan(), right.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            _ => Ordering::Greater,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_across_types() {
        let values = [
            Value::null(),
            Value::from_bool(false),
            Value::from_integer(3),
            Value::from_timestamp(Timestamp::new(1, 0)),
            Value::server_timestamp(Timestamp::new(0, 0), None),
            Value::from_string("a"),
            Value::from_bytes(vec![1u8]),
            Value::from_array(vec![]),
            Value::from_map(BTreeMap::new()),
        ];
        for pair in values.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn mixes_integers_and_doubles() {
        assert_eq!(
            compare_values(&Value::from_integer(2), &Value::from_double(2.5)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::from_double(f64::NAN), &Value::from_integer(-100)),
            Ordering::Less
        );
        assert_ne!(Value::from_integer(1), Value::from_double(1.0));
        assert_ne!(
            Value::from_integer(1).canonical_id(),
            Value::from_double(1.0).canonical_id()
        );
    }

    #[test]
    fn server_timestamp_keeps_last_concrete_previous_value() {
        let first = Value::server_timestamp(Timestamp::new(1, 0), Some(Value::from_integer(7)));
        let second = Value::server_timestamp(Timestamp::new(2, 0), Some(first));
        match second.kind() {
            ValueKind::ServerTimestamp(value) => {
                assert_eq!(value.previous_value.as_deref(), Some(&Value::from_integer(7)));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
