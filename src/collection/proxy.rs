use std::sync::Arc;

use serde_json::Value;

use crate::config::CollectionConfig;
use crate::errors::{DuplicateError, RecordStoreError};
use crate::store::{DocumentStore, Filter, Mutation, StoreError};
use crate::txn::{ProxyOp, TxnDescriptor};
use crate::Document;

/// One auxiliary collection per unique field.
///
/// Rows map a unique value to the owning record id and may carry a staged
/// `_txn` marker while a transaction moves the value. Rows are created and
/// removed only through the operations here; domain code never mutates them.
#[derive(Clone)]
pub(crate) struct ProxyCollection {
    store: Arc<dyn DocumentStore>,
    name: String,
    unique_field: String,
    owner_field: String,
    data_field: String,
}

impl ProxyCollection {
    pub(crate) fn new(store: Arc<dyn DocumentStore>, config: &CollectionConfig, field: &str) -> Self {
        Self {
            store,
            name: config.proxy_collection_name(field),
            unique_field: field.to_string(),
            owner_field: config.owner_id_field(),
            data_field: config.data_field.clone(),
        }
    }

    pub(crate) fn field(&self) -> &str {
        &self.unique_field
    }

    pub(crate) fn ensure_indexes(&self) -> Result<(), RecordStoreError> {
        self.store
            .ensure_unique_index(&self.name, &self.unique_field)?;
        self.store.ensure_index(&self.name, &self.owner_field)?;
        self.store.ensure_index(&self.name, "_txn.id")?;
        Ok(())
    }

    /// Stage a new mapping `(value → record_id)` under the transaction. A
    /// unique-index rejection surfaces as `DuplicateError` naming the
    /// record that attempted the write.
    pub(crate) fn insert(
        &self,
        value: &Value,
        record_id: &str,
        txn: &TxnDescriptor,
    ) -> Result<(), RecordStoreError> {
        let mut row = Document::new();
        row.insert(self.unique_field.clone(), value.clone());
        row.insert(self.owner_field.clone(), Value::String(record_id.into()));
        row.insert("_txn".into(), self.marker(txn, ProxyOp::Insert));
        self.store.insert_one(&self.name, row).map_err(|e| match e {
            StoreError::DuplicateKey { value, .. } => {
                RecordStoreError::Duplicate(DuplicateError {
                    record_id: record_id.to_string(),
                    data_field: self.data_field.clone(),
                    unique_field: self.unique_field.clone(),
                    unique_value: value,
                })
            }
            other => RecordStoreError::Store(other),
        })
    }

    /// The mapping row for a record id and/or value, if any.
    pub(crate) fn find(
        &self,
        record_id: Option<&str>,
        value: Option<&Value>,
    ) -> Result<Option<Document>, RecordStoreError> {
        if record_id.is_none() && value.is_none() {
            return Err(RecordStoreError::invalid_request(
                "a record id or a unique value is required",
            ));
        }
        let mut filter = Filter::new();
        if let Some(record_id) = record_id {
            filter = filter.eq(self.owner_field.as_str(), record_id);
        }
        if let Some(value) = value {
            filter = filter.eq(self.unique_field.as_str(), value.clone());
        }
        Ok(self.store.find_one(&self.name, &filter)?)
    }

    pub(crate) fn get(
        &self,
        record_id: Option<&str>,
        value: Option<&Value>,
    ) -> Result<Document, RecordStoreError> {
        self.find(record_id, value)?
            .ok_or(RecordStoreError::NotFound)
    }

    /// Mark the record's existing row for deletion, but only if no other
    /// transaction already claimed it. Returns whether the stamp applied.
    pub(crate) fn prepare_delete(
        &self,
        record_id: &str,
        txn: &TxnDescriptor,
        value: Option<&Value>,
    ) -> Result<bool, RecordStoreError> {
        let mut filter = Filter::new()
            .eq(self.owner_field.as_str(), record_id)
            .exists("_txn", false);
        if let Some(value) = value {
            filter = filter.eq(self.unique_field.as_str(), value.clone());
        }
        let mutation = Mutation::new().set("_txn", self.marker(txn, ProxyOp::Delete));
        Ok(self.store.update_one(&self.name, &filter, &mutation)?)
    }

    /// Undo every change staged under `txn_id`: staged inserts are removed,
    /// staged deletes unmarked. Rows that no longer match are skipped, so
    /// repeating a rollback is harmless. Values, when known, narrow the
    /// selection.
    pub(crate) fn rollback_change(
        &self,
        txn_id: &str,
        new_value: Option<&Value>,
        old_value: Option<&Value>,
    ) -> Result<(), RecordStoreError> {
        self.store
            .delete_many(&self.name, &self.op_filter(txn_id, ProxyOp::Insert, new_value))?;
        self.store.update_many(
            &self.name,
            &self.op_filter(txn_id, ProxyOp::Delete, old_value),
            &Mutation::new().unset("_txn"),
        )?;
        Ok(())
    }

    /// Finalize every change staged under `txn_id`: staged inserts become
    /// plain rows, staged deletes disappear. Idempotent like rollback.
    pub(crate) fn complete_change(
        &self,
        txn_id: &str,
        new_value: Option<&Value>,
        old_value: Option<&Value>,
    ) -> Result<(), RecordStoreError> {
        self.store.update_many(
            &self.name,
            &self.op_filter(txn_id, ProxyOp::Insert, new_value),
            &Mutation::new().unset("_txn"),
        )?;
        self.store
            .delete_many(&self.name, &self.op_filter(txn_id, ProxyOp::Delete, old_value))?;
        Ok(())
    }

    pub(crate) fn owner_of(&self, row: &Document) -> Option<String> {
        row.get(&self.owner_field)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn op_filter(&self, txn_id: &str, op: ProxyOp, value: Option<&Value>) -> Filter {
        let mut filter = Filter::new()
            .eq("_txn.id", txn_id)
            .eq("_txn.op", op.as_str());
        if let Some(value) = value {
            filter = filter.eq(self.unique_field.as_str(), value.clone());
        }
        filter
    }

    fn marker(&self, txn: &TxnDescriptor, op: ProxyOp) -> Value {
        let mut marker = Document::new();
        marker.insert("id".into(), Value::String(txn.id.clone()));
        marker.insert("recordId".into(), Value::String(txn.record_id.clone()));
        marker.insert("op".into(), Value::String(op.as_str().into()));
        Value::Object(marker)
    }
}
