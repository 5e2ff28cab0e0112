use serde_json::{Map, Value};

use crate::model::Document;
use crate::resolver::{ConflictResolver, Resolution};

/// Recursive structural merge.
///
/// Objects union their keys and recurse per key; arrays whose elements are all
/// objects carrying an `id` field merge as keyed bags (the keying rule applies
/// at every depth); everything else falls back to last-write-wins, the newer
/// document supplying the value. Tombstones never merge: a delete with the
/// greater timestamp wins outright and a stale delete is ignored.
pub struct MergeResolver;

impl ConflictResolver for MergeResolver {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn resolve(&self, stored: &Document, incoming: &Document) -> Resolution {
        if stored.is_deleted || incoming.is_deleted {
            return if incoming.updated_at > stored.updated_at {
                Resolution::AcceptIncoming
            } else {
                Resolution::KeepStored
            };
        }

        let incoming_is_newer = incoming.updated_at > stored.updated_at;
        let (older, newer) = if incoming_is_newer {
            (&stored.content, &incoming.content)
        } else {
            (&incoming.content, &stored.content)
        };

        let merged = merge_values(older, newer);
        if merged == stored.content {
            Resolution::KeepStored
        } else if merged == incoming.content {
            Resolution::AcceptIncoming
        } else {
            Resolution::Merged(merged)
        }
    }
}

fn merge_values(older: &Value, newer: &Value) -> Value {
    match (older, newer) {
        (Value::Object(older_map), Value::Object(newer_map)) => {
            Value::Object(merge_objects(older_map, newer_map))
        }
        (Value::Array(older_items), Value::Array(newer_items)) => {
            if is_keyed_bag(older_items) && is_keyed_bag(newer_items) {
                Value::Array(merge_keyed_bags(older_items, newer_items))
            } else {
                // Arrays of scalars (or mixed shapes): the newer write takes
                // the whole array.
                Value::Array(newer_items.clone())
            }
        }
        // Scalar or type mismatch: last write wins.
        (_, newer) => newer.clone(),
    }
}

fn merge_objects(older: &Map<String, Value>, newer: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = Map::new();
    for (key, newer_value) in newer {
        match older.get(key) {
            Some(older_value) => {
                merged.insert(key.clone(), merge_values(older_value, newer_value));
            }
            None => {
                merged.insert(key.clone(), newer_value.clone());
            }
        }
    }
    for (key, older_value) in older {
        if !newer.contains_key(key) {
            merged.insert(key.clone(), older_value.clone());
        }
    }
    merged
}

fn is_keyed_bag(items: &[Value]) -> bool {
    !items.is_empty()
        && items.iter().all(|item| {
            item.as_object()
                .map(|object| object.contains_key("id"))
                .unwrap_or(false)
        })
}

fn element_id(item: &Value) -> &Value {
    &item["id"]
}

/// Keyed-bag union: the newer array drives the order, matching ids recurse,
/// and ids only one side carries survive.
fn merge_keyed_bags(older: &[Value], newer: &[Value]) -> Vec<Value> {
    let mut merged = Vec::with_capacity(newer.len() + older.len());
    for newer_item in newer {
        let matching = older
            .iter()
            .find(|older_item| element_id(older_item) == element_id(newer_item));
        match matching {
            Some(older_item) => merged.push(merge_values(older_item, newer_item)),
            None => merged.push(newer_item.clone()),
        }
    }
    for older_item in older {
        let known = newer
            .iter()
            .any(|newer_item| element_id(newer_item) == element_id(older_item));
        if !known {
            merged.push(older_item.clone());
        }
    }
    merged
}
