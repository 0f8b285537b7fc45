use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, DocumentKeySet};

/// Two-way index of (document key, id) references.
///
/// Ids are target ids or batch ids depending on the owner. Lookups work in both
/// directions: all keys held by one id, or whether any id still holds a key.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeMap<DocumentKey, BTreeSet<i32>>,
    by_id: BTreeMap<i32, DocumentKeySet>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_key.entry(key.clone()).or_default().insert(id);
        self.by_id.entry(id).or_default().insert(key);
    }

    pub fn add_references<'a, I>(&mut self, keys: I, id: i32)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    /// Returns whether the reference existed.
    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) -> bool {
        let mut removed = false;
        if let Some(ids) = self.by_key.get_mut(key) {
            removed = ids.remove(&id);
            if ids.is_empty() {
                self.by_key.remove(key);
            }
        }
        if let Some(keys) = self.by_id.get_mut(&id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_id.remove(&id);
            }
        }
        removed
    }

    pub fn remove_references<'a, I>(&mut self, keys: I, id: i32)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the keys it referenced.
    pub fn remove_references_for_id(&mut self, id: i32) -> DocumentKeySet {
        let keys = self.by_id.remove(&id).unwrap_or_default();
        for key in &keys {
            if let Some(ids) = self.by_key.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        keys
    }

    pub fn remove_all_references(&mut self) -> DocumentKeySet {
        let keys = self.by_key.keys().cloned().collect();
        self.by_key.clear();
        self.by_id.clear();
        keys
    }

    pub fn references_for_id(&self, id: i32) -> DocumentKeySet {
        self.by_id.get(&id).cloned().unwrap_or_default()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Every key referenced by at least one id.
    pub fn keys(&self) -> DocumentKeySet {
        self.by_key.keys().cloned().collect()
    }

    pub fn contains_reference(&self, key: &DocumentKey, id: i32) -> bool {
        self.by_key
            .get(key)
            .map(|ids| ids.contains(&id))
            .unwrap_or(false)
    }

    pub fn ids_for_key(&self, key: &DocumentKey) -> Vec<i32> {
        self.by_key
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_in_both_directions() {
        let mut set = ReferenceSet::new();
        set.add_reference(key("rooms/a"), 1);
        set.add_reference(key("rooms/b"), 1);
        set.add_reference(key("rooms/a"), 2);

        assert!(set.contains_key(&key("rooms/a")));
        assert_eq!(set.references_for_id(1).len(), 2);
        assert_eq!(set.ids_for_key(&key("rooms/a")), vec![1, 2]);

        set.remove_references_for_id(1);
        assert!(set.contains_key(&key("rooms/a")));
        assert!(!set.contains_key(&key("rooms/b")));

        assert!(set.remove_reference(&key("rooms/a"), 2));
        assert!(set.is_empty());
    }
}
