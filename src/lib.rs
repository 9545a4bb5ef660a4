mod collection;
mod config;
mod document;
mod errors;
mod store;
mod txn;

pub use crate::collection::{Lookup, Record, RecordCollection, UpdateRequest};
pub use crate::config::CollectionConfig;
pub use crate::errors::{DuplicateError, RecordStoreError};
pub use crate::store::memory::MemoryStore;
pub use crate::store::{DocumentStore, Filter, FindOptions, Mutation, StoreError};

pub type Document = serde_json::Map<String, serde_json::Value>;
