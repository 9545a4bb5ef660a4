use std::sync::Arc;

use serde_json::Value;

use crate::config::CollectionConfig;
use crate::document::{get_path, is_scalar, now_millis};
use crate::errors::RecordStoreError;
use crate::store::{DocumentStore, Filter, FindOptions};
use crate::txn::processor::TxnProcessor;
use crate::Document;

pub(crate) mod helper;
pub(crate) mod proxy;

/// A stored record: domain payload plus metadata, internal bookkeeping
/// fields omitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub data: Document,
    pub meta: Document,
}

/// How to address a single record: by id, or by the value of a configured
/// unique field.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Id(&'a str),
    Unique { field: &'a str, value: &'a Value },
}

/// Parameters for [`RecordCollection::update`]. The id may be given
/// explicitly or taken from `data.id`; a mismatch between the two is a
/// contract error.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub id: Option<String>,
    pub data: Option<Document>,
    pub meta: Option<Document>,
    pub expected_sequence: Option<u64>,
}

/// A collection of records with unique-field constraints enforced across
/// concurrent writers.
///
/// Each logical write that moves unique values runs as a small recoverable
/// transaction spanning the primary collection and one proxy collection per
/// unique field. Readers and writers that encounter a transaction another
/// writer abandoned drive it to completion or rollback before proceeding.
pub struct RecordCollection {
    processor: TxnProcessor,
}

impl RecordCollection {
    /// Create the collection handle and declare the indexes the protocol
    /// relies on: a unique id index plus one unique index per unique field
    /// on the primary collection, and a unique value index per proxy
    /// collection.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: CollectionConfig,
    ) -> Result<Self, RecordStoreError> {
        let processor = TxnProcessor::new(store, config);
        processor.ensure_indexes()?;
        Ok(Self { processor })
    }

    /// Insert a new record. `data.id` is required; `meta.created`,
    /// `meta.updated` and the initial sequence of 0 are stamped here, and
    /// `meta.status` defaults to `"active"`. Returns the record as stored.
    pub fn insert(&self, record: Record) -> Result<Record, RecordStoreError> {
        let Record { mut data, mut meta } = record;
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RecordStoreError::invalid_request("data.id must be a string"))?
            .to_string();
        self.check_unique_values(&data)?;

        let now = now_millis();
        meta.insert("created".into(), Value::from(now));
        meta.insert("updated".into(), Value::from(now));
        meta.entry("status")
            .or_insert_with(|| Value::String("active".into()));
        if self.config().sequence_in_data {
            data.insert("sequence".into(), Value::from(0u64));
        } else {
            meta.insert("sequence".into(), Value::from(0u64));
        }

        self.processor.insert(&id, &data, &meta)?;
        Ok(Record { data, meta })
    }

    /// Fetch one record. Pending records are invisible; a stranded
    /// transaction on the path is resolved before the read returns.
    pub fn get(&self, lookup: Lookup<'_>) -> Result<Record, RecordStoreError> {
        let doc = match lookup {
            Lookup::Id(id) => self.processor.get_by_id(id)?,
            Lookup::Unique { field, value } => self.processor.get_by_unique(field, value)?,
        };
        Ok(self.to_record(doc))
    }

    pub fn exists(&self, lookup: Lookup<'_>) -> Result<bool, RecordStoreError> {
        match self.get(lookup) {
            Ok(_) => Ok(true),
            Err(RecordStoreError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Exact-match scan over the collection. Pending records are excluded;
    /// records are returned as stored, without resolving in-flight
    /// transactions.
    pub fn get_all(
        &self,
        filter: Filter,
        options: FindOptions,
    ) -> Result<Vec<Record>, RecordStoreError> {
        Ok(self
            .processor
            .helper()
            .find_all(filter, options)?
            .into_iter()
            .map(|doc| self.to_record(doc))
            .collect())
    }

    /// Replace a record's data and/or meta under optimistic concurrency.
    /// The expected sequence comes from the request, or from the part
    /// configured to carry the sequence (holding the next value). Unique
    /// field values that change are moved through the proxy collections
    /// atomically with the write.
    pub fn update(&self, request: UpdateRequest) -> Result<bool, RecordStoreError> {
        if request.data.is_none() && request.meta.is_none() {
            return Err(RecordStoreError::invalid_request(
                "update requires data or meta",
            ));
        }
        let data_id = request
            .data
            .as_ref()
            .and_then(|data| data.get("id").and_then(Value::as_str));
        let id = match (&request.id, data_id) {
            (Some(id), Some(data_id)) if id != data_id => {
                return Err(RecordStoreError::invalid_request(
                    "id does not match data.id",
                ));
            }
            (Some(id), _) => id.clone(),
            (None, Some(data_id)) => data_id.to_string(),
            (None, None) => {
                return Err(RecordStoreError::invalid_request("a record id is required"));
            }
        };
        if let Some(data) = &request.data {
            self.check_unique_values(data)?;
        }
        self.processor.update(
            &id,
            request.data.as_ref(),
            request.meta.as_ref(),
            request.expected_sequence,
        )
    }

    /// Remove a record and every proxy row that points at it.
    pub fn delete(&self, id: &str) -> Result<bool, RecordStoreError> {
        self.processor.delete(id)
    }

    pub fn set_status(&self, id: &str, status: &str) -> Result<bool, RecordStoreError> {
        self.processor.helper().set_status(id, status)?;
        Ok(true)
    }

    /// Sweep for records still carrying transaction markers and drive each
    /// to its end state. Returns how many transactions were processed.
    pub fn repair(&self) -> Result<usize, RecordStoreError> {
        self.processor.repair()
    }

    fn config(&self) -> &CollectionConfig {
        self.processor.helper().config()
    }

    fn to_record(&self, doc: Document) -> Record {
        let data = get_path(&doc, &self.config().data_field)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let meta = doc
            .get("meta")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Record { data, meta }
    }

    fn check_unique_values(&self, data: &Document) -> Result<(), RecordStoreError> {
        for field in &self.config().unique_fields {
            if let Some(value) = data.get(field) {
                if !value.is_null() && !is_scalar(value) {
                    return Err(RecordStoreError::invalid_request(format!(
                        "unique field `{field}` must hold a scalar value"
                    )));
                }
            }
        }
        Ok(())
    }
}
