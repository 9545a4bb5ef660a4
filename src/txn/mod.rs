//! Transaction descriptors and proxy-row markers.
//!
//! A transaction is coordinated entirely through small `_txn` documents
//! written into the primary record and the proxy rows it touches. The
//! descriptor on the primary record is the source of truth; proxy markers
//! reference it by id.

pub(crate) mod processor;

use serde_json::Value;
use uuid::Uuid;

use crate::document::get_path;
use crate::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnKind {
    Insert,
    Update,
    Delete,
}

impl TxnKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            TxnKind::Insert => "insert",
            TxnKind::Update => "update",
            TxnKind::Delete => "delete",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(TxnKind::Insert),
            "update" => Some(TxnKind::Update),
            "delete" => Some(TxnKind::Delete),
            _ => None,
        }
    }
}

/// The `_txn` document on a primary record:
/// `{id, type, recordId, committed?, rollback?}`. The boolean flags are
/// stored only once set, so conditional updates can require their absence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TxnDescriptor {
    pub id: String,
    pub kind: TxnKind,
    pub record_id: String,
    pub committed: bool,
    pub rollback: bool,
}

impl TxnDescriptor {
    pub(crate) fn new(kind: TxnKind, record_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            record_id: record_id.to_string(),
            committed: false,
            rollback: false,
        }
    }

    pub(crate) fn with_committed(&self) -> Self {
        Self {
            committed: true,
            ..self.clone()
        }
    }

    pub(crate) fn with_rollback(&self) -> Self {
        Self {
            rollback: true,
            ..self.clone()
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut doc = Document::new();
        doc.insert("id".into(), Value::String(self.id.clone()));
        doc.insert("type".into(), Value::String(self.kind.as_str().into()));
        doc.insert("recordId".into(), Value::String(self.record_id.clone()));
        if self.committed {
            doc.insert("committed".into(), Value::Bool(true));
        }
        if self.rollback {
            doc.insert("rollback".into(), Value::Bool(true));
        }
        Value::Object(doc)
    }

    /// Read the descriptor from a primary record document, if present.
    pub(crate) fn from_record(doc: &Document) -> Option<Self> {
        let txn = doc.get("_txn")?.as_object()?;
        Some(Self {
            id: txn.get("id")?.as_str()?.to_string(),
            kind: TxnKind::parse(txn.get("type")?.as_str()?)?,
            record_id: txn.get("recordId")?.as_str()?.to_string(),
            committed: txn.get("committed").and_then(Value::as_bool).unwrap_or(false),
            rollback: txn.get("rollback").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyOp {
    Insert,
    Delete,
}

impl ProxyOp {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ProxyOp::Insert => "insert",
            ProxyOp::Delete => "delete",
        }
    }
}

/// The `_txn` marker on a proxy row: `{id, recordId, op}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProxyMarker {
    pub id: String,
    pub record_id: String,
}

impl ProxyMarker {
    /// Read the marker from a proxy row, if present. The `op` field is not
    /// carried here; finalization selects rows by `(_txn.id, _txn.op)`
    /// directly.
    pub(crate) fn from_row(row: &Document) -> Option<Self> {
        Some(Self {
            id: get_path(row, "_txn.id")?.as_str()?.to_string(),
            record_id: get_path(row, "_txn.recordId")?.as_str()?.to_string(),
        })
    }
}

#[cfg(test)]
mod tests;
