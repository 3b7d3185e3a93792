//! Structural diff of resources into minimal MongoDB updates.
//!
//! The diff is computed with `json-patch` and folded into `$set`/`$unset` paths.
//! Insertions into and removals from arrays rewrite the whole array, since
//! `$unset` on an element would leave a `null` behind.

use serde_json::Value;

use crate::store::UpdateDocument;

/// Builds the update turning `original` into `updated`.
///
/// Returns `None` when the two are deep-equal, which is how callers avoid
/// writing (and versioning) documents that did not change.
pub fn update_for(original: &Value, updated: &Value) -> Option<UpdateDocument> {
    if original == updated {
        return None;
    }
    let patch = json_patch::diff(original, updated);
    let operations = match serde_json::to_value(&patch) {
        Ok(Value::Array(operations)) => operations,
        _ => return non_empty(top_level_update(original, updated)),
    };

    let mut update = UpdateDocument::default();
    for operation in &operations {
        let op = operation.get("op").and_then(Value::as_str).unwrap_or_default();
        let tokens = decode_pointer(operation.get("path").and_then(Value::as_str).unwrap_or_default());
        let Some((last, parent)) = tokens.split_last() else {
            return non_empty(top_level_update(original, updated));
        };

        let parent_doc = if op == "remove" { original } else { updated };
        let parent_is_array = lookup(parent_doc, parent).is_some_and(Value::is_array);
        if parent_is_array && (op == "add" || op == "remove" || last == "-") {
            let path = parent.join(".");
            match lookup(updated, parent) {
                Some(array) => {
                    update.set.insert(path, array.clone());
                }
                None => {
                    update.unset.insert(path);
                }
            }
            continue;
        }

        let path = tokens.join(".");
        match op {
            "remove" => {
                update.unset.insert(path);
            }
            _ => match lookup(updated, &tokens) {
                Some(value) => {
                    update.set.insert(path, value.clone());
                }
                None => {
                    update.unset.insert(path);
                }
            },
        }
    }

    non_empty(drop_covered_paths(update))
}

fn non_empty(update: UpdateDocument) -> Option<UpdateDocument> {
    (!update.is_empty()).then_some(update)
}

fn decode_pointer(pointer: &str) -> Vec<String> {
    if pointer.is_empty() {
        return Vec::new();
    }
    pointer
        .trim_start_matches('/')
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect()
}

fn lookup<'a>(value: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    tokens.iter().try_fold(value, |current, token| match current {
        Value::Object(map) => map.get(token),
        Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn top_level_update(original: &Value, updated: &Value) -> UpdateDocument {
    let mut update = UpdateDocument::default();
    if let (Some(before), Some(after)) = (original.as_object(), updated.as_object()) {
        for (key, value) in after {
            if before.get(key) != Some(value) {
                update.set.insert(key.clone(), value.clone());
            }
        }
        for key in before.keys() {
            if !after.contains_key(key) {
                update.unset.insert(key.clone());
            }
        }
    }
    update
}

/// Removes paths already covered by a `$set` of one of their ancestors.
fn drop_covered_paths(update: UpdateDocument) -> UpdateDocument {
    let set_paths: Vec<String> = update.set.keys().cloned().collect();
    let covered = |path: &str| {
        set_paths
            .iter()
            .any(|other| path.len() > other.len() && path.starts_with(other.as_str()) && path.as_bytes()[other.len()] == b'.')
    };
    UpdateDocument {
        set: update
            .set
            .into_iter()
            .filter(|(path, _)| !covered(path))
            .collect(),
        unset: update.unset.into_iter().filter(|path| !covered(path)).collect(),
    }
}
