//! Filter matching.
//!
//! A criterion is either a literal compared for equality, or `{"$exists":
//! bool}`. A literal `null` also matches a missing field.

use serde_json::{Map, Value as JsonValue};

use docmap_types::Filter;

use crate::path;

/// Whether `document` satisfies every criterion of `filter`.
pub fn matches(document: &Map<String, JsonValue>, filter: &Filter) -> bool {
    filter
        .iter()
        .all(|(field, criterion)| satisfies(path::get(document, field), criterion))
}

fn satisfies(value: Option<&JsonValue>, criterion: &JsonValue) -> bool {
    if let Some(exists) = exists_condition(criterion) {
        return value.is_some() == exists;
    }
    value.map_or_else(|| criterion.is_null(), |value| value == criterion)
}

fn exists_condition(criterion: &JsonValue) -> Option<bool> {
    match criterion {
        JsonValue::Object(condition) if condition.len() == 1 => {
            condition.get("$exists").and_then(JsonValue::as_bool)
        }
        _ => None,
    }
}

/// Equality criteria usable to seed an upserted document.
pub fn equalities(filter: &Filter) -> impl Iterator<Item = (&String, &JsonValue)> {
    filter
        .iter()
        .filter(|(_, criterion)| exists_condition(criterion).is_none())
}
