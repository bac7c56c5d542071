//! JSON merge patch (RFC 7386) diffing
//!
//! Applying a patch is `json_patch::merge`; this module produces them.

use serde_json::{Map, Value};

/// Smallest merge patch turning `before` into `after`.
///
/// Removed keys map to `null`; nested objects recurse; every other change
/// replaces the value wholesale, lists included. Returns an empty object
/// when nothing changed.
pub fn merge_patch_diff(before: &Value, after: &Value) -> Value {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut patch = Map::new();
            for key in b.keys() {
                if !a.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, new) in a {
                match b.get(key) {
                    None => {
                        patch.insert(key.clone(), new.clone());
                    }
                    Some(old) if old == new => {}
                    Some(old @ Value::Object(_)) if new.is_object() => {
                        let nested = merge_patch_diff(old, new);
                        if !is_empty_patch(&nested) {
                            patch.insert(key.clone(), nested);
                        }
                    }
                    Some(_) => {
                        patch.insert(key.clone(), new.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => after.clone(),
    }
}

pub(crate) fn is_empty_patch(patch: &Value) -> bool {
    matches!(patch, Value::Object(m) if m.is_empty())
}
