//! Multi-writer behavior over a shared store: uniqueness holds under
//! contention, sequences advance one step per successful write, and writers
//! drive each other's stranded transactions instead of deadlocking.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde_json::json;

use recordstore::{
    CollectionConfig, Document, DocumentStore, Filter, FindOptions, Lookup, MemoryStore, Record,
    RecordCollection, RecordStoreError, UpdateRequest,
};

fn doc(value: serde_json::Value) -> Document {
    value.as_object().expect("object").clone()
}

fn accounts() -> (Arc<MemoryStore>, RecordCollection) {
    let store = Arc::new(MemoryStore::new());
    let collection = RecordCollection::new(
        store.clone(),
        CollectionConfig {
            collection_name: "accounts".into(),
            data_field: "account".into(),
            sequence_in_data: false,
            unique_fields: vec!["email".into()],
        },
    )
    .unwrap();
    (store, collection)
}

fn jitter() {
    let micros = rand::thread_rng().gen_range(0..50);
    thread::sleep(Duration::from_micros(micros));
}

#[test]
fn concurrent_inserts_agree_on_a_single_owner() {
    let (store, collection) = accounts();
    let writers = 4;

    let results: Vec<Result<(), RecordStoreError>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..writers)
            .map(|n| {
                let collection = &collection;
                scope.spawn(move || {
                    jitter();
                    collection
                        .insert(Record {
                            data: doc(json!({"id": format!("W{n}"), "email": "hot@x"})),
                            meta: Document::new(),
                        })
                        .map(|_| ())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    for result in &results {
        if let Err(err) = result {
            assert!(
                matches!(
                    err,
                    RecordStoreError::Duplicate(_) | RecordStoreError::RetriesExhausted(_)
                ),
                "unexpected error: {err}"
            );
        }
    }

    // Exactly one settled proxy row maps the value, and it points at a
    // record that holds it.
    let rows = store
        .find_many(
            "accounts-email",
            &Filter::new().eq("email", "hot@x"),
            FindOptions::default(),
        )
        .unwrap();
    assert_eq!(rows.len(), 1);
    let owner = collection
        .get(Lookup::Unique {
            field: "email",
            value: &json!("hot@x"),
        })
        .unwrap();
    assert_eq!(owner.data.get("email"), Some(&json!("hot@x")));
    assert_eq!(
        rows[0].get("accountId"),
        Some(owner.data.get("id").unwrap())
    );
}

#[test]
fn concurrent_updates_advance_the_sequence_one_step_at_a_time() {
    let (_, collection) = accounts();
    collection
        .insert(Record {
            data: doc(json!({"id": "A", "email": "a@x"})),
            meta: Document::new(),
        })
        .unwrap();

    let writers = 4;
    let updates_per_writer = 5;

    thread::scope(|scope| {
        for _ in 0..writers {
            let collection = &collection;
            scope.spawn(move || {
                for _ in 0..updates_per_writer {
                    let mut attempts = 0;
                    loop {
                        attempts += 1;
                        assert!(attempts < 1000, "writer starved");
                        let current = collection.get(Lookup::Id("A")).unwrap();
                        let sequence = current
                            .meta
                            .get("sequence")
                            .and_then(|v| v.as_u64())
                            .unwrap();
                        let mut meta = current.meta.clone();
                        meta.insert("sequence".into(), json!(sequence + 1));
                        match collection.update(UpdateRequest {
                            id: Some("A".into()),
                            meta: Some(meta),
                            ..UpdateRequest::default()
                        }) {
                            Ok(true) => break,
                            Ok(false) => continue,
                            Err(RecordStoreError::InvalidState { .. }) => continue,
                            Err(RecordStoreError::RetriesExhausted(_)) => continue,
                            Err(err) => panic!("unexpected error: {err}"),
                        }
                    }
                    jitter();
                }
            });
        }
    });

    let final_record = collection.get(Lookup::Id("A")).unwrap();
    assert_eq!(
        final_record.meta.get("sequence"),
        Some(&json!(writers * updates_per_writer))
    );
}

#[test]
fn concurrent_value_moves_on_disjoint_records() {
    let (store, collection) = accounts();
    for n in 0..4 {
        collection
            .insert(Record {
                data: doc(json!({"id": format!("R{n}"), "email": format!("old{n}@x")})),
                meta: Document::new(),
            })
            .unwrap();
    }

    thread::scope(|scope| {
        for n in 0..4 {
            let collection = &collection;
            scope.spawn(move || {
                jitter();
                let id = format!("R{n}");
                assert!(collection
                    .update(UpdateRequest {
                        id: Some(id.clone()),
                        data: Some(doc(
                            json!({"id": id, "email": format!("new{n}@x")})
                        )),
                        expected_sequence: Some(0),
                        ..UpdateRequest::default()
                    })
                    .unwrap());
            });
        }
    });

    for n in 0..4 {
        let old = store
            .find_one(
                "accounts-email",
                &Filter::new().eq("email", format!("old{n}@x")),
            )
            .unwrap();
        assert!(old.is_none());
        let row = store
            .find_one(
                "accounts-email",
                &Filter::new().eq("email", format!("new{n}@x")),
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.get("accountId"), Some(&json!(format!("R{n}"))));
        assert!(row.get("_txn").is_none());

        let record = collection.get(Lookup::Id(&format!("R{n}"))).unwrap();
        assert_eq!(record.meta.get("sequence"), Some(&json!(1)));
    }
}

#[test]
fn a_freed_value_becomes_claimable() {
    let (_, collection) = accounts();
    collection
        .insert(Record {
            data: doc(json!({"id": "A", "email": "shared@x"})),
            meta: Document::new(),
        })
        .unwrap();

    thread::scope(|scope| {
        let remover = {
            let collection = &collection;
            scope.spawn(move || {
                jitter();
                let mut attempts = 0;
                loop {
                    attempts += 1;
                    assert!(attempts < 1000, "remover starved");
                    match collection.delete("A") {
                        Ok(_) => break,
                        // The claimer may have driven our committed delete to
                        // completion already.
                        Err(RecordStoreError::NotFound) => break,
                        Err(RecordStoreError::RetriesExhausted(_)) => {
                            thread::sleep(Duration::from_micros(200));
                        }
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
            })
        };

        let claimer = {
            let collection = &collection;
            scope.spawn(move || {
                let mut attempts = 0;
                loop {
                    attempts += 1;
                    assert!(attempts < 1000, "claimer starved");
                    match collection.insert(Record {
                        data: doc(json!({"id": "B", "email": "shared@x"})),
                        meta: Document::new(),
                    }) {
                        Ok(_) => break,
                        Err(RecordStoreError::Duplicate(_))
                        | Err(RecordStoreError::RetriesExhausted(_)) => {
                            thread::sleep(Duration::from_micros(200));
                        }
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
            })
        };

        remover.join().unwrap();
        claimer.join().unwrap();
    });

    let owner = collection
        .get(Lookup::Unique {
            field: "email",
            value: &json!("shared@x"),
        })
        .unwrap();
    assert_eq!(owner.data.get("id"), Some(&json!("B")));
    assert!(!collection.exists(Lookup::Id("A")).unwrap());
}
