use std::sync::Arc;

use serde_json::Value;

use crate::config::CollectionConfig;
use crate::document::{get_path, now_millis};
use crate::errors::{DuplicateError, RecordStoreError};
use crate::store::{DocumentStore, Filter, FindOptions, Mutation, StoreError};
use crate::txn::TxnDescriptor;
use crate::Document;

/// One conditional write against the primary collection.
///
/// `old_txn: None` requires `_txn` to be absent; `Some(descriptor)` requires
/// the stored id and both protocol flags to match it exactly.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordUpdate<'a> {
    pub id: &'a str,
    pub data: Option<&'a Document>,
    pub meta: Option<&'a Document>,
    pub expected_sequence: Option<u64>,
    pub old_txn: Option<&'a TxnDescriptor>,
    pub set_txn: Option<&'a TxnDescriptor>,
    pub clear_txn: bool,
    pub toggle_pending: Option<bool>,
}

impl<'a> RecordUpdate<'a> {
    pub(crate) fn new(id: &'a str) -> Self {
        Self {
            id,
            data: None,
            meta: None,
            expected_sequence: None,
            old_txn: None,
            set_txn: None,
            clear_txn: false,
            toggle_pending: None,
        }
    }
}

/// Low-level operations on the primary collection. Understands the document
/// layout (payload field, meta, `_pending`, `_txn`) but carries no
/// multi-document policy.
#[derive(Clone)]
pub(crate) struct RecordHelper {
    store: Arc<dyn DocumentStore>,
    config: CollectionConfig,
}

impl RecordHelper {
    pub(crate) fn new(store: Arc<dyn DocumentStore>, config: CollectionConfig) -> Self {
        Self { store, config }
    }

    pub(crate) fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub(crate) fn ensure_indexes(&self) -> Result<(), RecordStoreError> {
        let name = &self.config.collection_name;
        self.store.ensure_unique_index(name, &self.config.id_path())?;
        for field in &self.config.unique_fields {
            self.store
                .ensure_unique_index(name, &self.config.data_path(field))?;
        }
        self.store.ensure_index(name, "_txn.id")?;
        Ok(())
    }

    pub(crate) fn insert(&self, doc: Document) -> Result<(), RecordStoreError> {
        let record_id = get_path(&doc, &self.config.id_path())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.store
            .insert_one(&self.config.collection_name, doc)
            .map_err(|e| self.map_store_error(e, &record_id))
    }

    /// Point query by id and/or unique field value. Rows flagged `_pending`
    /// are invisible unless `allow_pending`.
    pub(crate) fn find(
        &self,
        id: Option<&str>,
        unique: Option<(&str, &Value)>,
        allow_pending: bool,
    ) -> Result<Option<Document>, RecordStoreError> {
        let mut filter = Filter::new();
        if let Some(id) = id {
            filter = filter.eq(self.config.id_path(), id);
        }
        if let Some((field, value)) = unique {
            filter = filter.eq(self.config.data_path(field), value.clone());
        }
        if !allow_pending {
            filter = filter.exists("_pending", false);
        }
        Ok(self.store.find_one(&self.config.collection_name, &filter)?)
    }

    /// All non-pending rows matching `filter`.
    pub(crate) fn find_all(
        &self,
        filter: Filter,
        options: FindOptions,
    ) -> Result<Vec<Document>, RecordStoreError> {
        let filter = filter.exists("_pending", false);
        Ok(self
            .store
            .find_many(&self.config.collection_name, &filter, options)?)
    }

    /// Every row currently carrying a transaction marker.
    pub(crate) fn find_marked(&self) -> Result<Vec<Document>, RecordStoreError> {
        let filter = Filter::new().exists("_txn", true);
        Ok(self
            .store
            .find_many(&self.config.collection_name, &filter, FindOptions::default())?)
    }

    /// Conditional single-document update. Returns whether a row was
    /// modified; a zero-row outcome with a known expected sequence is
    /// re-checked so a genuine divergence surfaces as `InvalidState`.
    pub(crate) fn update(&self, req: &RecordUpdate<'_>) -> Result<bool, RecordStoreError> {
        let has_txn_change = req.set_txn.is_some() || req.clear_txn || req.toggle_pending.is_some();
        if req.data.is_none() && req.meta.is_none() && !has_txn_change {
            return Err(RecordStoreError::invalid_request(
                "update requires data, meta, or a transaction change",
            ));
        }
        if let Some(data) = req.data {
            let data_id = data.get("id").and_then(Value::as_str);
            if data_id != Some(req.id) {
                return Err(RecordStoreError::invalid_request(
                    "data.id does not match the record id",
                ));
            }
        }
        let expected = self.derive_expected(req.data, req.meta, req.expected_sequence)?;

        let mut filter = Filter::new().eq(self.config.id_path(), req.id);
        if let Some(expected) = expected {
            filter = filter.eq(self.config.sequence_path(), expected);
        }
        filter = match req.old_txn {
            None => filter.exists("_txn", false),
            Some(txn) => {
                let mut f = filter.eq("_txn.id", txn.id.as_str());
                f = if txn.committed {
                    f.eq("_txn.committed", true)
                } else {
                    f.exists("_txn.committed", false)
                };
                if txn.rollback {
                    f.eq("_txn.rollback", true)
                } else {
                    f.exists("_txn.rollback", false)
                }
            }
        };

        let now = now_millis();
        let mut mutation = Mutation::new();
        if let Some(data) = req.data {
            mutation = mutation.set(self.config.data_field.as_str(), Value::Object(data.clone()));
        }
        match req.meta {
            Some(meta) => {
                let mut meta = meta.clone();
                meta.insert("updated".into(), Value::from(now));
                mutation = mutation.set("meta", Value::Object(meta));
            }
            None if req.data.is_some() => {
                mutation = mutation.set("meta.updated", Value::from(now));
            }
            None => {}
        }
        if let Some(txn) = req.set_txn {
            mutation = mutation.set("_txn", txn.to_value());
        } else if req.clear_txn {
            mutation = mutation.unset("_txn");
        }
        match req.toggle_pending {
            Some(true) => mutation = mutation.set("_pending", true),
            Some(false) => mutation = mutation.unset("_pending"),
            None => {}
        }

        // The sequence advances when this write commits a transaction or no
        // transaction is involved at all. When the written part already
        // carries the new sequence the set above covers it; otherwise bump
        // the stored value in place.
        let commits = req.set_txn.map(|t| t.committed).unwrap_or(false);
        let transactional = req.old_txn.is_some() || req.set_txn.is_some() || req.clear_txn;
        let carried = if self.config.sequence_in_data {
            req.data.is_some()
        } else {
            req.meta.is_some()
        };
        if (commits || !transactional) && expected.is_some() && !carried {
            mutation = mutation.inc(self.config.sequence_path(), 1);
        }

        let modified = self
            .store
            .update_one(&self.config.collection_name, &filter, &mutation)
            .map_err(|e| self.map_store_error(e, req.id))?;

        if !modified {
            if let Some(expected) = expected {
                if let Some(doc) = self.find(Some(req.id), None, true)? {
                    let actual = get_path(&doc, &self.config.sequence_path())
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    if actual != expected {
                        return Err(RecordStoreError::InvalidState { expected, actual });
                    }
                }
            }
        }
        Ok(modified)
    }

    /// Delete only while the record still carries the given transaction.
    pub(crate) fn delete_by_txn(&self, id: &str, txn_id: &str) -> Result<bool, RecordStoreError> {
        let filter = Filter::new()
            .eq(self.config.id_path(), id)
            .eq("_txn.id", txn_id);
        Ok(self.store.delete_one(&self.config.collection_name, &filter)?)
    }

    /// Targeted write of `meta.status`. Status flips are metadata and do not
    /// consume a sequence number.
    pub(crate) fn set_status(&self, id: &str, status: &str) -> Result<(), RecordStoreError> {
        let filter = Filter::new()
            .eq(self.config.id_path(), id)
            .exists("_pending", false);
        let mutation = Mutation::new()
            .set("meta.status", status)
            .set("meta.updated", Value::from(now_millis()));
        let modified = self
            .store
            .update_one(&self.config.collection_name, &filter, &mutation)?;
        if !modified {
            return Err(RecordStoreError::NotFound);
        }
        Ok(())
    }

    /// Delete only while no transaction is attached to the record.
    pub(crate) fn delete_stable(&self, id: &str) -> Result<bool, RecordStoreError> {
        let filter = Filter::new()
            .eq(self.config.id_path(), id)
            .exists("_txn", false);
        Ok(self.store.delete_one(&self.config.collection_name, &filter)?)
    }

    /// Expected-before sequence for a conditional update: the explicit
    /// value, or derived from the part configured to carry the sequence
    /// (which must then hold the next sequence). Both together must agree.
    pub(crate) fn derive_expected(
        &self,
        data: Option<&Document>,
        meta: Option<&Document>,
        explicit: Option<u64>,
    ) -> Result<Option<u64>, RecordStoreError> {
        let carrying_part = if self.config.sequence_in_data {
            data
        } else {
            meta
        };
        let derived = match carrying_part {
            None => None,
            Some(part) => {
                let Some(sequence) = part.get("sequence").and_then(Value::as_u64) else {
                    return Err(RecordStoreError::invalid_request(
                        "the part carrying the sequence must hold a non-negative integer sequence",
                    ));
                };
                if sequence == 0 {
                    return Err(RecordStoreError::invalid_request(
                        "an updated sequence must be greater than zero",
                    ));
                }
                Some(sequence - 1)
            }
        };
        match (explicit, derived) {
            (Some(explicit), Some(derived)) if explicit != derived => {
                Err(RecordStoreError::invalid_request(
                    "expected sequence disagrees with the supplied sequence",
                ))
            }
            (explicit, derived) => Ok(explicit.or(derived)),
        }
    }

    fn map_store_error(&self, err: StoreError, record_id: &str) -> RecordStoreError {
        match err {
            StoreError::DuplicateKey { index, value } => {
                let prefix = format!("{}.", self.config.data_field);
                let unique_field = match index.strip_prefix(&prefix) {
                    Some(field) => field.to_string(),
                    None => index,
                };
                RecordStoreError::Duplicate(DuplicateError {
                    record_id: record_id.to_string(),
                    data_field: self.config.data_field.clone(),
                    unique_field,
                    unique_value: value,
                })
            }
            other => RecordStoreError::Store(other),
        }
    }
}
