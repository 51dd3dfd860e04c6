//! Pipeline data items.
//!
//! An [`Item`] is one unit of data flowing through a workflow: an unordered
//! key/value map with JSON values. Nodes consume and produce *batches*
//! (ordered `Vec<Item>`); batch order is significant for positional merges
//! such as sub-flow output mapping.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// One unit of pipeline data: a key → JSON value mapping.
pub type Item = FxHashMap<String, Value>;

/// Create an empty item map with the crate-standard hasher.
#[must_use]
pub fn new_item() -> Item {
    FxHashMap::default()
}

/// Defensively copy a batch, item by item.
///
/// Every node invocation receives its own copy of the caller's batch, so a
/// misbehaving node can never mutate what the caller still holds.
#[must_use]
pub fn copy_batch(items: &[Item]) -> Vec<Item> {
    items.iter().cloned().collect()
}

/// Fetch a string field from an item, treating missing and non-string as
/// absent.
#[must_use]
pub fn str_field<'a>(item: &'a Item, key: &str) -> Option<&'a str> {
    item.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn copy_batch_is_independent() {
        let mut item = new_item();
        item.insert("k".into(), json!(1));
        let batch = vec![item];
        let mut copied = copy_batch(&batch);
        copied[0].insert("k".into(), json!(2));
        assert_eq!(batch[0]["k"], json!(1));
    }

    #[test]
    fn str_field_ignores_non_strings() {
        let mut item = new_item();
        item.insert("a".into(), json!("text"));
        item.insert("b".into(), json!(7));
        assert_eq!(str_field(&item, "a"), Some("text"));
        assert_eq!(str_field(&item, "b"), None);
        assert_eq!(str_field(&item, "missing"), None);
    }
}
