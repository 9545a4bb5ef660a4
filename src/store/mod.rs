//! The document-store seam.
//!
//! The records layer assumes a store with conditional single-document
//! updates, unique indexes with duplicate-key signaling, and point queries.
//! Everything it needs from such a store is captured by [`DocumentStore`];
//! the transaction protocol's correctness rests solely on each trait call
//! being atomic with respect to concurrent callers.

pub mod memory;

use serde_json::Value;
use thiserror::Error;

use crate::document::{get_path, set_path, unset_path};
use crate::Document;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique index rejected a write. `index` is the violated field path,
    /// `value` the colliding value.
    #[error("duplicate key for unique index `{index}`")]
    DuplicateKey { index: String, value: Value },

    #[error("{0}")]
    Backend(String),
}

/// A conjunction of per-path conditions, matched against one document.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    conditions: Vec<Condition>,
}

#[derive(Debug, Clone)]
enum Condition {
    Eq(String, Value),
    Exists(String, bool),
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(path.into(), value.into()));
        self
    }

    pub fn exists(mut self, path: impl Into<String>, present: bool) -> Self {
        self.conditions.push(Condition::Exists(path.into(), present));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(path, value) => get_path(doc, path) == Some(value),
            Condition::Exists(path, present) => get_path(doc, path).is_some() == *present,
        })
    }
}

/// Mutations applied atomically to a single matched document.
#[derive(Debug, Clone, Default)]
pub struct Mutation {
    actions: Vec<Action>,
}

#[derive(Debug, Clone)]
enum Action {
    Set(String, Value),
    Unset(String),
    Inc(String, u64),
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.actions.push(Action::Set(path.into(), value.into()));
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.actions.push(Action::Unset(path.into()));
        self
    }

    /// Increment a numeric path; a missing or non-numeric value counts as 0.
    pub fn inc(mut self, path: impl Into<String>, by: u64) -> Self {
        self.actions.push(Action::Inc(path.into(), by));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn apply(&self, doc: &mut Document) {
        for action in &self.actions {
            match action {
                Action::Set(path, value) => set_path(doc, path, value.clone()),
                Action::Unset(path) => unset_path(doc, path),
                Action::Inc(path, by) => {
                    let current = get_path(doc, path).and_then(Value::as_u64).unwrap_or(0);
                    set_path(doc, path, Value::from(current + by));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    pub skip: usize,
    pub limit: Option<usize>,
}

/// Minimal document-store contract.
///
/// Every method is a single atomic step; the records layer never asks the
/// store to coordinate more than one document at a time.
pub trait DocumentStore: Send + Sync {
    /// Declare a non-unique index. Backends that do not need auxiliary
    /// indexes may treat this as a no-op; it exists so real stores can
    /// build the lookup paths the recovery scans rely on.
    fn ensure_index(&self, collection: &str, field: &str) -> Result<(), StoreError>;

    /// Declare a unique index over a (dotted) field path. Idempotent.
    fn ensure_unique_index(&self, collection: &str, field: &str) -> Result<(), StoreError>;

    fn insert_one(&self, collection: &str, doc: Document) -> Result<(), StoreError>;

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, StoreError>;

    fn find_many(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    /// Apply `mutation` to the first document matching `filter`. Returns
    /// whether a document was modified.
    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        mutation: &Mutation,
    ) -> Result<bool, StoreError>;

    fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        mutation: &Mutation,
    ) -> Result<u64, StoreError>;

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool, StoreError>;

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;
}
