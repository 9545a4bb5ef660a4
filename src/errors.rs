use serde_json::Value;
use thiserror::Error;

use crate::store::StoreError;
use crate::Document;

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("record not found")]
    NotFound,

    #[error(transparent)]
    Duplicate(#[from] DuplicateError),

    #[error("record sequence does not match (expected {expected}, actual {actual})")]
    InvalidState { expected: u64, actual: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal retry signal; caught by the outer retry loop and never
    /// returned from the public API.
    #[error("transaction attempt aborted")]
    Abort,

    #[error("transaction retry budget exhausted after {0} attempts")]
    RetriesExhausted(usize),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RecordStoreError {
    pub(crate) fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

/// A unique-constraint violation that persisted after any pending
/// transaction on the conflicting record was resolved.
#[derive(Debug, Clone, Error)]
#[error("duplicate value for unique field `{unique_field}` on record `{record_id}`")]
pub struct DuplicateError {
    /// The id of the record whose write collided.
    pub record_id: String,
    /// The configured payload key of the collection (e.g. `"account"`).
    pub data_field: String,
    pub unique_field: String,
    pub unique_value: Value,
}

impl DuplicateError {
    /// Conflict details in document form:
    /// `{recordId, <dataField>, uniqueField, uniqueValue}`.
    pub fn details(&self) -> Document {
        let mut details = Document::new();
        details.insert("recordId".into(), Value::String(self.record_id.clone()));
        details.insert(
            self.data_field.clone(),
            Value::String(self.record_id.clone()),
        );
        details.insert(
            "uniqueField".into(),
            Value::String(self.unique_field.clone()),
        );
        details.insert("uniqueValue".into(), self.unique_value.clone());
        details
    }
}
