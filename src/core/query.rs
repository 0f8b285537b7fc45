use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::error::{invalid_argument, SyncResult};
use crate::model::{Document, DocumentKey, FieldPath, IntoFieldPath, ResourcePath};
use crate::value::{compare_values, Value, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: Operator,
    pub value: Value,
}

impl FieldFilter {
    pub fn matches(&self, document: &Document) -> bool {
        match field_value(document, &self.field) {
            Some(value) => self.matches_value(&value),
            None => false,
        }
    }

    fn matches_value(&self, value: &Value) -> bool {
        match self.op {
            Operator::Equal => value == &self.value,
            Operator::NotEqual => !value.is_null() && value != &self.value,
            Operator::LessThan => same_type_compare(value, &self.value) == Some(Ordering::Less),
            Operator::LessThanOrEqual => matches!(
                same_type_compare(value, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::GreaterThan => {
                same_type_compare(value, &self.value) == Some(Ordering::Greater)
            }
            Operator::GreaterThanOrEqual => matches!(
                same_type_compare(value, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::ArrayContains => value
                .as_array()
                .map(|array| array.contains(&self.value))
                .unwrap_or(false),
            Operator::ArrayContainsAny => match (value.as_array(), self.value.as_array()) {
                (Some(array), Some(needles)) => {
                    needles.values().iter().any(|needle| array.contains(needle))
                }
                _ => false,
            },
            Operator::In => self
                .value
                .as_array()
                .map(|values| values.contains(value))
                .unwrap_or(false),
            Operator::NotIn => match self.value.as_array() {
                Some(values) => !value.is_null() && !values.contains(value),
                None => false,
            },
        }
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            self.value.canonical_id()
        )
    }
}

/// Range comparisons only match values of the same type class.
fn same_type_compare(left: &Value, right: &Value) -> Option<Ordering> {
    let comparable = matches!(
        (left.kind(), right.kind()),
        (
            ValueKind::Integer(_) | ValueKind::Double(_),
            ValueKind::Integer(_) | ValueKind::Double(_)
        ) | (ValueKind::Boolean(_), ValueKind::Boolean(_))
            | (ValueKind::Timestamp(_), ValueKind::Timestamp(_))
            | (ValueKind::String(_), ValueKind::String(_))
            | (ValueKind::Bytes(_), ValueKind::Bytes(_))
            | (ValueKind::Reference(_), ValueKind::Reference(_))
            | (ValueKind::Array(_), ValueKind::Array(_))
            | (ValueKind::Map(_), ValueKind::Map(_))
    );
    comparable.then(|| compare_values(left, right))
}

fn field_value(document: &Document, field: &FieldPath) -> Option<Value> {
    if field.is_key_field() {
        return Some(Value::from_reference(
            document.key().path().canonical_string(),
        ));
    }
    document.field(field).cloned()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitType {
    First,
    Last,
}

/// A listenable selection of documents: collection (or collection group, or a single
/// document), filters, ordering and an optional limit.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<usize>,
    limit_type: LimitType,
}

impl Query {
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
        }
    }

    pub fn collection(path: &str) -> SyncResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 != 1 {
            return Err(invalid_argument(format!(
                "Collection paths must have an odd number of segments, got '{path}'"
            )));
        }
        Ok(Self::new(path))
    }

    /// Matches every collection named `collection_id` anywhere under `parent`.
    pub fn collection_group(parent: ResourcePath, collection_id: impl Into<String>) -> Self {
        let mut query = Self::new(parent);
        query.collection_group = Some(collection_id.into());
        query
    }

    /// Query matching exactly one document.
    pub fn document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn where_field(
        mut self,
        field: impl IntoFieldPath,
        op: Operator,
        value: Value,
    ) -> SyncResult<Self> {
        let field = field.into_field_path()?;
        if matches!(op, Operator::In | Operator::NotIn | Operator::ArrayContainsAny)
            && value.as_array().is_none()
        {
            return Err(invalid_argument(format!(
                "Filter '{}' requires an array value",
                op.as_str()
            )));
        }
        self.filters.push(FieldFilter { field, op, value });
        Ok(self)
    }

    pub fn order_by(mut self, field: impl IntoFieldPath, direction: Direction) -> SyncResult<Self> {
        let field = field.into_field_path()?;
        self.explicit_order_by.push(OrderBy { field, direction });
        Ok(self)
    }

    pub fn limit_to_first(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    /// Id of the collection the results live in.
    pub fn collection_id(&self) -> Option<&str> {
        match &self.collection_group {
            Some(group) => Some(group.as_str()),
            None if self.is_document_query() => self.path.segment(self.path.len() - 2),
            None => self.path.last_segment(),
        }
    }

    /// Explicit ordering, followed by inequality fields and finally the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> =
            result.iter().map(|order| order.field.clone()).collect();
        let last_direction = result
            .last()
            .map(|order| order.direction)
            .unwrap_or(Direction::Ascending);

        let inequality_fields: BTreeSet<FieldPath> = self
            .filters
            .iter()
            .filter(|filter| filter.op.is_inequality())
            .map(|filter| filter.field.clone())
            .collect();
        for field in inequality_fields {
            if !field.is_key_field() && seen.insert(field.clone()) {
                result.push(OrderBy {
                    field,
                    direction: last_direction,
                });
            }
        }

        if !seen.contains(&FieldPath::key_field()) {
            result.push(OrderBy {
                field: FieldPath::key_field(),
                direction: last_direction,
            });
        }
        result
    }

    /// Ordering sent to the server. Limit-to-last queries are executed reversed.
    pub fn server_order_by(&self) -> Vec<OrderBy> {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => order_by,
            LimitType::Last => order_by
                .into_iter()
                .map(|order| OrderBy {
                    field: order.field,
                    direction: order.direction.flipped(),
                })
                .collect(),
        }
    }

    pub fn matches_path(&self, key: &DocumentKey) -> bool {
        let document_path = key.path();
        match &self.collection_group {
            Some(group) => key.has_collection_id(group) && self.path.is_prefix_of(document_path),
            None if self.path.is_document_path() => &self.path == document_path,
            None => self.path.is_immediate_parent_of(document_path),
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
    }

    fn matches_order_by(&self, document: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field.is_key_field() || document.field(&order.field).is_some())
    }

    /// Orders two matching documents the way results are presented.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Stable identity of the query, used to deduplicate targets and views.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        let filters: Vec<String> = self.filters.iter().map(FieldFilter::canonical_id).collect();
        id.push_str(&filters.join(","));
        id.push_str("|ob:");
        let order: Vec<String> = self
            .normalized_order_by()
            .iter()
            .map(|order| {
                let direction = match order.direction {
                    Direction::Ascending => "asc",
                    Direction::Descending => "desc",
                };
                format!("{}{}", order.field.canonical_string(), direction)
            })
            .collect();
        id.push_str(&order.join(","));
        if let Some(limit) = self.limit {
            let kind = match self.limit_type {
                LimitType::First => "f",
                LimitType::Last => "l",
            };
            id.push_str(&format!("|l:{limit}|lt:{kind}"));
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SnapshotVersion, Timestamp};
    use crate::value::MapValue;

    fn doc(path: &str, fields: &[(&str, Value)]) -> Document {
        let mut data = MapValue::empty();
        for (field, value) in fields {
            data.set(&FieldPath::from_dot_separated(field).unwrap(), value.clone());
        }
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    #[test]
    fn matches_collection_members_only() {
        let query = Query::collection("rooms/eros/messages").unwrap();
        assert!(query.matches(&doc("rooms/eros/messages/1", &[])));
        assert!(!query.matches(&doc("rooms/other/messages/1", &[])));
        assert!(!query.matches(&doc("rooms/eros/messages/1/replies/2", &[])));
    }

    #[test]
    fn collection_group_matches_any_parent() {
        let query = Query::collection_group(ResourcePath::root(), "messages");
        assert!(query.matches(&doc("rooms/a/messages/1", &[])));
        assert!(query.matches(&doc("users/b/messages/1", &[])));
        assert!(!query.matches(&doc("rooms/a", &[])));
    }

    #[test]
    fn filters_and_orders() {
        let query = Query::collection("cities")
            .unwrap()
            .where_field("population", Operator::GreaterThan, Value::from_integer(10))
            .unwrap();
        let small = doc("cities/a", &[("population", Value::from_integer(5))]);
        let big = doc("cities/b", &[("population", Value::from_integer(50))]);
        let bigger = doc("cities/c", &[("population", Value::from_double(75.5))]);
        let text = doc("cities/d", &[("population", Value::from_string("many"))]);
        assert!(!query.matches(&small));
        assert!(query.matches(&big));
        assert!(query.matches(&bigger));
        assert!(!query.matches(&text));
        assert_eq!(query.compare(&big, &bigger), Ordering::Less);

        let order = query.normalized_order_by();
        assert_eq!(order.len(), 2);
        assert!(order[1].field.is_key_field());
    }

    #[test]
    fn explicit_order_by_requires_field() {
        let query = Query::collection("cities")
            .unwrap()
            .order_by("name", Direction::Descending)
            .unwrap();
        assert!(!query.matches(&doc("cities/a", &[])));
        let a = doc("cities/a", &[("name", Value::from_string("a"))]);
        let b = doc("cities/b", &[("name", Value::from_string("b"))]);
        assert_eq!(query.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn in_and_array_filters() {
        let tags = Value::from_array(vec![Value::from_string("x"), Value::from_string("y")]);
        let document = doc("posts/1", &[("tags", tags), ("kind", Value::from_string("note"))]);
        let contains = Query::collection("posts")
            .unwrap()
            .where_field("tags", Operator::ArrayContains, Value::from_string("y"))
            .unwrap();
        assert!(contains.matches(&document));
        let in_query = Query::collection("posts")
            .unwrap()
            .where_field(
                "kind",
                Operator::In,
                Value::from_array(vec![Value::from_string("note"), Value::from_string("memo")]),
            )
            .unwrap();
        assert!(in_query.matches(&document));
        assert!(Query::collection("posts")
            .unwrap()
            .where_field("kind", Operator::In, Value::from_string("note"))
            .is_err());
    }

    #[test]
    fn canonical_ids_distinguish_limits() {
        let base = Query::collection("rooms").unwrap();
        let first = base.clone().limit_to_first(2);
        let last = base.clone().limit_to_last(2);
        assert_ne!(base.canonical_id(), first.canonical_id());
        assert_ne!(first.canonical_id(), last.canonical_id());
        assert_eq!(first.canonical_id(), base.limit_to_first(2).canonical_id());
    }

    #[test]
    fn document_query_matches_single_key() {
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        let query = Query::document(&key);
        assert!(query.is_document_query());
        assert!(query.matches(&doc("rooms/eros", &[])));
        assert!(!query.matches(&doc("rooms/other", &[])));
        assert_eq!(query.collection_id(), Some("rooms"));
    }
}
