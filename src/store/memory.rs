//! In-process store backend.
//!
//! One write lock around the whole store makes every trait call atomic,
//! which is exactly the single-document guarantee the transaction protocol
//! assumes. The lock is never held across calls.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde_json::Value;

use crate::document::get_path;
use crate::Document;

use super::{DocumentStore, Filter, FindOptions, Mutation, StoreError};

/// Indexable scalar values. Numbers are keyed by their canonical rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ScalarKey {
    Bool(bool),
    Number(String),
    String(String),
}

impl ScalarKey {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(ScalarKey::Bool(*b)),
            Value::Number(n) => Some(ScalarKey::Number(n.to_string())),
            Value::String(s) => Some(ScalarKey::String(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct MemCollection {
    next_slot: u64,
    docs: BTreeMap<u64, Document>,
    /// Unique index per field path: value key → owning slot.
    unique: HashMap<String, HashMap<ScalarKey, u64>>,
}

impl MemCollection {
    fn first_match(&self, filter: &Filter) -> Option<u64> {
        self.docs
            .iter()
            .find(|(_, doc)| filter.matches(doc))
            .map(|(slot, _)| *slot)
    }

    fn matches(&self, filter: &Filter) -> Vec<u64> {
        self.docs
            .iter()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(slot, _)| *slot)
            .collect()
    }

    /// Check that replacing `slot`'s document with `candidate` keeps every
    /// unique index consistent.
    fn check_unique(&self, slot: Option<u64>, candidate: &Document) -> Result<(), StoreError> {
        for (field, index) in &self.unique {
            let Some(value) = get_path(candidate, field) else {
                continue;
            };
            let Some(key) = ScalarKey::from_value(value) else {
                continue;
            };
            if let Some(owner) = index.get(&key) {
                if Some(*owner) != slot {
                    return Err(StoreError::DuplicateKey {
                        index: field.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn unindex(&mut self, slot: u64, doc: &Document) {
        for (field, index) in self.unique.iter_mut() {
            if let Some(key) = get_path(doc, field).and_then(ScalarKey::from_value) {
                if index.get(&key) == Some(&slot) {
                    index.remove(&key);
                }
            }
        }
    }

    fn index(&mut self, slot: u64, doc: &Document) {
        for (field, index) in self.unique.iter_mut() {
            if let Some(key) = get_path(doc, field).and_then(ScalarKey::from_value) {
                index.insert(key, slot);
            }
        }
    }

    fn replace(&mut self, slot: u64, doc: Document) {
        let old = self.docs.remove(&slot).expect("slot exists");
        self.unindex(slot, &old);
        self.index(slot, &doc);
        self.docs.insert(slot, doc);
    }

    fn remove(&mut self, slot: u64) {
        if let Some(old) = self.docs.remove(&slot) {
            self.unindex(slot, &old);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, MemCollection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn ensure_index(&self, _collection: &str, _field: &str) -> Result<(), StoreError> {
        // Point lookups scan in this backend; auxiliary indexes are not
        // needed for correctness.
        Ok(())
    }

    fn ensure_unique_index(&self, collection: &str, field: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();
        if coll.unique.contains_key(field) {
            return Ok(());
        }
        let mut index = HashMap::new();
        for (slot, doc) in &coll.docs {
            if let Some(key) = get_path(doc, field).and_then(ScalarKey::from_value) {
                if index.insert(key, *slot).is_some() {
                    return Err(StoreError::Backend(format!(
                        "cannot build unique index `{field}` on `{collection}`: duplicate values"
                    )));
                }
            }
        }
        coll.unique.insert(field.to_string(), index);
        Ok(())
    }

    fn insert_one(&self, collection: &str, doc: Document) -> Result<(), StoreError> {
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();
        coll.check_unique(None, &doc)?;
        let slot = coll.next_slot;
        coll.next_slot += 1;
        coll.index(slot, &doc);
        coll.docs.insert(slot, doc);
        Ok(())
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read();
        let Some(coll) = collections.get(collection) else {
            return Ok(None);
        };
        Ok(coll
            .first_match(filter)
            .and_then(|slot| coll.docs.get(&slot))
            .cloned())
    }

    fn find_many(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read();
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let iter = coll
            .docs
            .values()
            .filter(|doc| filter.matches(doc))
            .skip(options.skip)
            .cloned();
        Ok(match options.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        mutation: &Mutation,
    ) -> Result<bool, StoreError> {
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let Some(slot) = coll.first_match(filter) else {
            return Ok(false);
        };
        let mut doc = coll.docs.get(&slot).expect("matched slot").clone();
        mutation.apply(&mut doc);
        coll.check_unique(Some(slot), &doc)?;
        coll.replace(slot, doc);
        Ok(true)
    }

    fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        mutation: &Mutation,
    ) -> Result<u64, StoreError> {
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut modified = 0;
        for slot in coll.matches(filter) {
            let mut doc = coll.docs.get(&slot).expect("matched slot").clone();
            mutation.apply(&mut doc);
            coll.check_unique(Some(slot), &doc)?;
            coll.replace(slot, doc);
            modified += 1;
        }
        Ok(modified)
    }

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool, StoreError> {
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let Some(slot) = coll.first_match(filter) else {
            return Ok(false);
        };
        coll.remove(slot);
        Ok(true)
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let slots = coll.matches(filter);
        let removed = slots.len() as u64;
        for slot in slots {
            coll.remove(slot);
        }
        Ok(removed)
    }
}
