use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::Document;

/// Look up a dotted path (`"meta.sequence"`, `"_txn.id"`) in a document.
pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed. A non-object
/// intermediate value is replaced.
pub(crate) fn set_path(doc: &mut Document, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().expect("path is never empty");
    let mut current = doc;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if !entry.is_object() {
            *entry = Value::Object(Document::new());
        }
        current = entry.as_object_mut().expect("just ensured an object");
    }
    current.insert(last.to_string(), value);
}

/// Remove a dotted path. Missing intermediates are a no-op.
pub(crate) fn unset_path(doc: &mut Document, path: &str) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().expect("path is never empty");
    let mut current = doc;
    for segment in segments {
        match current.get_mut(segment).and_then(Value::as_object_mut) {
            Some(next) => current = next,
            None => return,
        }
    }
    current.remove(last);
}

/// Unique values must be scalars so the store can index them.
pub(crate) fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

/// Milliseconds since the Unix epoch, the timestamp format used in `meta`.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().expect("object").clone()
    }

    #[test]
    fn get_path_walks_nested_objects() {
        let d = doc(json!({"meta": {"sequence": 3}, "flat": true}));
        assert_eq!(get_path(&d, "meta.sequence"), Some(&json!(3)));
        assert_eq!(get_path(&d, "flat"), Some(&json!(true)));
        assert_eq!(get_path(&d, "meta.missing"), None);
        assert_eq!(get_path(&d, "flat.too.deep"), None);
    }

    #[test]
    fn set_path_creates_intermediates() {
        let mut d = Document::new();
        set_path(&mut d, "_txn.id", json!("t1"));
        set_path(&mut d, "_txn.committed", json!(true));
        assert_eq!(get_path(&d, "_txn.id"), Some(&json!("t1")));
        assert_eq!(get_path(&d, "_txn.committed"), Some(&json!(true)));
    }

    #[test]
    fn unset_path_removes_leaf_only() {
        let mut d = doc(json!({"_txn": {"id": "t1", "committed": true}}));
        unset_path(&mut d, "_txn.committed");
        assert_eq!(get_path(&d, "_txn.id"), Some(&json!("t1")));
        assert_eq!(get_path(&d, "_txn.committed"), None);
        unset_path(&mut d, "_txn");
        assert!(d.is_empty());
    }

    #[test]
    fn scalar_classification() {
        assert!(is_scalar(&json!("a@x")));
        assert!(is_scalar(&json!(7)));
        assert!(!is_scalar(&json!(null)));
        assert!(!is_scalar(&json!({"nested": 1})));
        assert!(!is_scalar(&json!([1, 2])));
    }
}
