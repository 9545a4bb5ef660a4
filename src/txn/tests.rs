use std::sync::Arc;

use serde_json::json;

use crate::config::CollectionConfig;
use crate::store::memory::MemoryStore;
use crate::Document;

use super::processor::TxnProcessor;
use super::{ProxyMarker, TxnDescriptor, TxnKind};

fn doc(value: serde_json::Value) -> Document {
    value.as_object().expect("object").clone()
}

fn processor() -> TxnProcessor {
    TxnProcessor::new(
        Arc::new(MemoryStore::new()),
        CollectionConfig {
            collection_name: "accounts".into(),
            data_field: "account".into(),
            sequence_in_data: false,
            unique_fields: vec!["email".into(), "username".into()],
        },
    )
}

#[test]
fn descriptor_value_omits_unset_flags() {
    let txn = TxnDescriptor::new(TxnKind::Update, "A");
    let value = txn.to_value();
    let fields = value.as_object().unwrap();
    assert_eq!(fields.get("type"), Some(&json!("update")));
    assert_eq!(fields.get("recordId"), Some(&json!("A")));
    assert!(!fields.contains_key("committed"));
    assert!(!fields.contains_key("rollback"));

    let committed = txn.with_committed().to_value();
    assert_eq!(
        committed.as_object().unwrap().get("committed"),
        Some(&json!(true))
    );
}

#[test]
fn descriptor_round_trips_through_a_record() {
    let txn = TxnDescriptor::new(TxnKind::Delete, "A").with_rollback();
    let mut record = doc(json!({"account": {"id": "A"}}));
    record.insert("_txn".into(), txn.to_value());

    let parsed = TxnDescriptor::from_record(&record).unwrap();
    assert_eq!(parsed, txn);
}

#[test]
fn fresh_descriptors_get_distinct_ids() {
    let a = TxnDescriptor::new(TxnKind::Insert, "A");
    let b = TxnDescriptor::new(TxnKind::Insert, "A");
    assert_ne!(a.id, b.id);
}

#[test]
fn marker_reads_id_and_record() {
    let row = doc(json!({
        "email": "a@x",
        "accountId": "A",
        "_txn": {"id": "t1", "recordId": "A", "op": "insert"},
    }));
    let marker = ProxyMarker::from_row(&row).unwrap();
    assert_eq!(marker.id, "t1");
    assert_eq!(marker.record_id, "A");

    let plain = doc(json!({"email": "a@x", "accountId": "A"}));
    assert!(ProxyMarker::from_row(&plain).is_none());
}

#[test]
fn move_ops_cover_only_changed_values() {
    let processor = processor();
    let current = doc(json!({"id": "A", "email": "a@x", "username": "alpha"}));
    let new_data = doc(json!({"id": "A", "email": "b@x", "username": "alpha"}));

    let ops = processor.move_ops(&current, &new_data);
    let summaries = TxnProcessor::op_summaries(&ops);
    assert_eq!(
        summaries,
        vec![
            ("email".into(), "insert", json!("b@x")),
            ("email".into(), "remove", json!("a@x")),
        ]
    );
}

#[test]
fn move_ops_handle_added_and_removed_values() {
    let processor = processor();
    let current = doc(json!({"id": "A", "email": "a@x"}));
    let new_data = doc(json!({"id": "A", "username": "alpha"}));

    let ops = processor.move_ops(&current, &new_data);
    let summaries = TxnProcessor::op_summaries(&ops);
    assert_eq!(
        summaries,
        vec![
            ("email".into(), "remove", json!("a@x")),
            ("username".into(), "insert", json!("alpha")),
        ]
    );
}

#[test]
fn claim_ops_skip_absent_and_null_values() {
    let processor = processor();
    let data = doc(json!({"id": "A", "email": "a@x", "username": null}));
    let summaries = TxnProcessor::op_summaries(&processor.claim_ops(&data));
    assert_eq!(summaries, vec![("email".into(), "insert", json!("a@x"))]);
}
