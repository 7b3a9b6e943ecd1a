//! Dotted path navigation over JSON documents.
//!
//! A segment addresses an object key, or an array slot when it is a
//! decimal index. Writing through a missing or null intermediate creates an
//! object; writing past the end of an array pads it with nulls.

use serde_json::{Map, Value as JsonValue};

use crate::error::StoreError;

/// The value at `path`, if present.
pub fn get<'d>(document: &'d Map<String, JsonValue>, path: &str) -> Option<&'d JsonValue> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutable value at `path`, if present. Nothing is created.
pub fn get_mut<'d>(document: &'d mut Map<String, JsonValue>, path: &str) -> Option<&'d mut JsonValue> {
    let mut segments = path.split('.');
    let mut current = document.get_mut(segments.next()?)?;
    for segment in segments {
        current = match current {
            JsonValue::Object(map) => map.get_mut(segment)?,
            JsonValue::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutable slot at `path`, created as null along with any missing parents.
///
/// # Errors
///
/// Returns [`StoreError::PathConflict`] if the path runs through a scalar
/// or indexes an array with a non-numeric segment.
pub fn slot<'d>(document: &'d mut Map<String, JsonValue>, path: &str) -> Result<&'d mut JsonValue, StoreError> {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or(path);
    let mut current = document.entry(first.to_owned()).or_insert(JsonValue::Null);
    for segment in segments {
        current = child_slot(current, segment, path)?;
    }
    Ok(current)
}

fn child_slot<'v>(
    container: &'v mut JsonValue,
    segment: &str,
    path: &str,
) -> Result<&'v mut JsonValue, StoreError> {
    let conflict = || StoreError::PathConflict {
        path: path.to_owned(),
        segment: segment.to_owned(),
    };

    if container.is_null() {
        *container = JsonValue::Object(Map::new());
    }
    match container {
        JsonValue::Object(map) => Ok(map.entry(segment.to_owned()).or_insert(JsonValue::Null)),
        JsonValue::Array(items) => {
            let index = segment.parse::<usize>().ok().ok_or_else(conflict)?;
            while items.len() <= index {
                items.push(JsonValue::Null);
            }
            items.get_mut(index).ok_or_else(conflict)
        }
        _ => Err(conflict()),
    }
}

/// Remove the value at `path`. Array slots are nulled, keeping positions.
///
/// Returns whether anything was there.
pub fn unset(document: &mut Map<String, JsonValue>, path: &str) -> bool {
    let Some((parent, last)) = path.rsplit_once('.') else {
        return document.remove(path).is_some();
    };
    match get_mut(document, parent) {
        Some(JsonValue::Object(map)) => map.remove(last).is_some(),
        Some(JsonValue::Array(items)) => last
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get_mut(index))
            .map(|value| *value = JsonValue::Null)
            .is_some(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn get_walks_objects_and_arrays() {
        let doc = document(json!({"items": [{"tags": ["a", "b"]}]}));
        assert_eq!(get(&doc, "items.0.tags.1"), Some(&json!("b")));
        assert_eq!(get(&doc, "items.1"), None);
        assert_eq!(get(&doc, "items.x"), None);
    }

    #[test]
    fn slot_creates_parents_and_pads_arrays() {
        let mut doc = document(json!({"list": ["a"]}));
        if let Ok(value) = slot(&mut doc, "address.city") {
            *value = json!("Bonn");
        }
        if let Ok(value) = slot(&mut doc, "list.2") {
            *value = json!("c");
        }
        assert_eq!(
            JsonValue::Object(doc),
            json!({"address": {"city": "Bonn"}, "list": ["a", null, "c"]})
        );
    }

    #[test]
    fn slot_refuses_to_traverse_scalars() {
        let mut doc = document(json!({"name": "x"}));
        assert!(matches!(
            slot(&mut doc, "name.first"),
            Err(StoreError::PathConflict { .. })
        ));
    }

    #[test]
    fn unset_nulls_array_slots() {
        let mut doc = document(json!({"tags": ["a", "b", "c"], "name": "x"}));
        assert!(unset(&mut doc, "tags.1"));
        assert!(unset(&mut doc, "name"));
        assert!(!unset(&mut doc, "missing.path"));
        assert_eq!(JsonValue::Object(doc), json!({"tags": ["a", null, "c"]}));
    }
}
