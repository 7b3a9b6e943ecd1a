//! The in-memory store.
//!
//! Documents live in insertion order per collection. Every update is
//! applied to a copy of the matched document and only committed when all
//! of its operators succeed, so a failing command leaves the store
//! untouched.
//!
//! # Compatibility switches
//!
//! | Switch                   | Rejects                                          |
//! |--------------------------|--------------------------------------------------|
//! | `reject_identifier_noop` | any `$set` of the identifier, even to itself     |
//! | `reject_empty_set`       | an operator with no fields, such as `{$set: {}}` |
//!
//! Both are off by default. Turning them on reproduces older stores, which
//! is what the identifier-only upsert fallback exists for.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use docmap_types::{
    CommandExecutor, CommandResult, ExecutorError, InsertCommand, UpdateCommand, UpdateOperator,
};

use crate::error::StoreError;
use crate::filter;
use crate::operators;
use crate::path;

/// Behaviors of older stores that can be switched on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct StoreCompat {
    /// Reject any update that sets the identifier field.
    #[serde(default)]
    pub reject_identifier_noop: bool,
    /// Reject operators that carry no fields.
    #[serde(default)]
    pub reject_empty_set: bool,
}

impl StoreCompat {
    /// Parse compatibility switches from YAML.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, StoreError> {
        Ok(serde_yml::from_str(yaml)?)
    }
}

/// JSON documents grouped by collection, executing docmap commands.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    collections: BTreeMap<String, Vec<Map<String, JsonValue>>>,
    identifier_field: String,
    compat: StoreCompat,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty store using `_id` as identifier field.
    pub fn new() -> Self {
        Self {
            collections: BTreeMap::new(),
            identifier_field: "_id".to_owned(),
            compat: StoreCompat::default(),
        }
    }

    /// Switch on compatibility behaviors.
    #[must_use]
    pub const fn with_compat(mut self, compat: StoreCompat) -> Self {
        self.compat = compat;
        self
    }

    /// Load compatibility switches from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be read, or
    /// [`StoreError::Config`] if it is not valid YAML.
    pub fn with_compat_file(self, file: &Path) -> Result<Self, StoreError> {
        let contents = std::fs::read_to_string(file)?;
        Ok(self.with_compat(StoreCompat::parse(&contents)?))
    }

    /// Active compatibility switches.
    pub const fn compat(&self) -> StoreCompat {
        self.compat
    }

    /// Documents of a collection, in insertion order.
    pub fn documents(&self, collection: &str) -> &[Map<String, JsonValue>] {
        self.collections
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// A document by identifier.
    pub fn find_by_id(&self, collection: &str, id: &JsonValue) -> Option<&Map<String, JsonValue>> {
        self.documents(collection)
            .iter()
            .find(|document| document.get(&self.identifier_field) == Some(id))
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.documents(collection).len()
    }

    fn check_update(&self, command: &UpdateCommand) -> Result<(), ExecutorError> {
        if command.update.is_empty() {
            return Err(ExecutorError::EmptyUpdate);
        }
        if self.compat.reject_empty_set && command.update.iter().any(|(_, fields)| fields.is_empty()) {
            return Err(ExecutorError::EmptyUpdate);
        }
        if self.compat.reject_identifier_noop && self.touches_identifier(command) {
            return Err(self.identifier_modification());
        }
        Ok(())
    }

    fn touches_identifier(&self, command: &UpdateCommand) -> bool {
        command
            .update
            .get(UpdateOperator::Set, &self.identifier_field)
            .is_some()
    }

    fn identifier_modification(&self) -> ExecutorError {
        ExecutorError::IdentifierModification {
            field: self.identifier_field.clone(),
        }
    }

    fn upsert_document(&self, command: &UpdateCommand) -> Result<Map<String, JsonValue>, ExecutorError> {
        let mut document = Map::new();
        for (field, value) in filter::equalities(&command.filter) {
            *path::slot(&mut document, field)? = value.clone();
        }
        operators::apply(&mut document, &command.update, true)?;
        if !document.contains_key(&self.identifier_field) {
            return Err(ExecutorError::Malformed(format!(
                "upsert into {} without {} in filter or update",
                command.collection, self.identifier_field
            )));
        }
        Ok(document)
    }
}

impl CommandExecutor for MemoryStore {
    fn insert(&mut self, command: &InsertCommand) -> Result<CommandResult, ExecutorError> {
        let id = command
            .document
            .get(&self.identifier_field)
            .cloned()
            .ok_or_else(|| {
                ExecutorError::Malformed(format!(
                    "insert into {} without {}",
                    command.collection, self.identifier_field
                ))
            })?;

        if self.find_by_id(&command.collection, &id).is_some() {
            return Err(ExecutorError::DuplicateKey {
                collection: command.collection.clone(),
                id: id.to_string(),
            });
        }

        self.collections
            .entry(command.collection.clone())
            .or_default()
            .push(command.document.clone());

        tracing::trace!(collection = %command.collection, id = %id, "Inserted document");
        Ok(CommandResult {
            matched_count: 0,
            modified_count: 1,
            upserted_id: None,
        })
    }

    fn update(&mut self, command: &UpdateCommand) -> Result<CommandResult, ExecutorError> {
        self.check_update(command)?;

        let position = self
            .documents(&command.collection)
            .iter()
            .position(|document| filter::matches(document, &command.filter));

        let Some(position) = position else {
            if !command.upsert {
                tracing::trace!(collection = %command.collection, "Update matched nothing");
                return Ok(CommandResult::default());
            }
            let document = self.upsert_document(command)?;
            let id = document.get(&self.identifier_field).cloned();
            self.collections
                .entry(command.collection.clone())
                .or_default()
                .push(document);
            tracing::trace!(collection = %command.collection, "Upsert inserted document");
            return Ok(CommandResult {
                matched_count: 0,
                modified_count: 0,
                upserted_id: id,
            });
        };

        let identifier_field = self.identifier_field.clone();
        let identifier_modification = self.identifier_modification();
        let slot = self
            .collections
            .get_mut(&command.collection)
            .and_then(|documents| documents.get_mut(position))
            .ok_or_else(|| ExecutorError::Backend("matched document disappeared".to_owned()))?;

        let mut updated = slot.clone();
        let changed = operators::apply(&mut updated, &command.update, false)?;
        if updated.get(&identifier_field) != slot.get(&identifier_field) {
            return Err(identifier_modification);
        }
        *slot = updated;

        tracing::trace!(collection = %command.collection, changed, "Updated document");
        Ok(CommandResult {
            matched_count: 1,
            modified_count: u64::from(changed),
            upserted_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmap_types::{CompiledUpdate, Filter};
    use serde_json::json;

    fn insert(store: &mut MemoryStore, document: JsonValue) {
        if let JsonValue::Object(document) = document {
            let command = InsertCommand {
                collection: "users".to_owned(),
                document,
            };
            assert!(store.insert(&command).is_ok());
        }
    }

    fn set(path: &str, value: JsonValue) -> CompiledUpdate {
        let mut update = CompiledUpdate::new();
        update.set(path, value);
        update
    }

    #[test]
    fn duplicate_identifiers_are_rejected() {
        let mut store = MemoryStore::new();
        insert(&mut store, json!({"_id": "u1"}));
        let again = InsertCommand {
            collection: "users".to_owned(),
            document: Map::from_iter([("_id".to_owned(), json!("u1"))]),
        };
        assert!(matches!(
            store.insert(&again),
            Err(ExecutorError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn update_applies_to_the_matching_document() {
        let mut store = MemoryStore::new();
        insert(&mut store, json!({"_id": "u1", "name": "a"}));
        insert(&mut store, json!({"_id": "u2", "name": "b"}));

        let command = UpdateCommand::new("users", Filter::by_id("_id", json!("u2")), set("name", json!("c")));
        let result = store.update(&command);

        assert_eq!(result.map(|r| (r.matched_count, r.modified_count)).ok(), Some((1, 1)));
        assert_eq!(
            store.find_by_id("users", &json!("u2")).and_then(|d| d.get("name")),
            Some(&json!("c"))
        );
    }

    #[test]
    fn no_match_without_upsert_changes_nothing() {
        let mut store = MemoryStore::new();
        let command = UpdateCommand::new("users", Filter::by_id("_id", json!("u1")), set("name", json!("x")));
        assert_eq!(store.update(&command).ok(), Some(CommandResult::default()));
        assert_eq!(store.count("users"), 0);
    }

    #[test]
    fn upsert_seeds_from_filter() {
        let mut store = MemoryStore::new();
        let mut update = set("name", json!("x"));
        update.insert(UpdateOperator::SetOnInsert, "bio", JsonValue::Null);
        let command = UpdateCommand {
            upsert: true,
            ..UpdateCommand::new("users", Filter::by_id("_id", json!("u1")), update)
        };

        let result = store.update(&command);
        assert_eq!(result.ok().and_then(|r| r.upserted_id), Some(json!("u1")));
        assert_eq!(
            store.find_by_id("users", &json!("u1")).cloned().map(JsonValue::Object),
            Some(json!({"_id": "u1", "name": "x", "bio": null}))
        );
    }

    #[test]
    fn empty_updates_are_rejected() {
        let mut store = MemoryStore::new();
        let command = UpdateCommand::new("users", Filter::by_id("_id", json!("u1")), CompiledUpdate::new());
        assert_eq!(store.update(&command), Err(ExecutorError::EmptyUpdate));
    }

    #[test]
    fn compat_switches_reject_identifier_noop_and_empty_set() {
        let compat = StoreCompat::parse("reject_identifier_noop: true\nreject_empty_set: true\n");
        assert!(compat.is_ok());
        let mut store = MemoryStore::new().with_compat(compat.unwrap_or_default());
        insert(&mut store, json!({"_id": "u1"}));

        let noop = UpdateCommand::new("users", Filter::by_id("_id", json!("u1")), set("_id", json!("u1")));
        let empty = UpdateCommand::new("users", Filter::by_id("_id", json!("u1")), CompiledUpdate::empty_set());

        assert!(matches!(
            store.update(&noop),
            Err(ExecutorError::IdentifierModification { .. })
        ));
        assert_eq!(store.update(&empty), Err(ExecutorError::EmptyUpdate));
    }

    #[test]
    fn changing_the_identifier_is_always_rejected() {
        let mut store = MemoryStore::new();
        insert(&mut store, json!({"_id": "u1"}));

        let same = UpdateCommand::new("users", Filter::by_id("_id", json!("u1")), set("_id", json!("u1")));
        let other = UpdateCommand::new("users", Filter::by_id("_id", json!("u1")), set("_id", json!("u2")));

        assert_eq!(store.update(&same).map(|r| r.modified_count).ok(), Some(0));
        assert!(matches!(
            store.update(&other),
            Err(ExecutorError::IdentifierModification { .. })
        ));
        assert!(store.find_by_id("users", &json!("u1")).is_some());
    }

    #[test]
    fn failed_operators_leave_the_document_untouched() {
        let mut store = MemoryStore::new();
        insert(&mut store, json!({"_id": "u1", "name": "a", "tags": "x"}));

        let mut update = set("name", json!("b"));
        update.insert(UpdateOperator::Push, "tags", json!("y"));
        let command = UpdateCommand::new("users", Filter::by_id("_id", json!("u1")), update);

        assert!(matches!(store.update(&command), Err(ExecutorError::Malformed(_))));
        assert_eq!(
            store.find_by_id("users", &json!("u1")).and_then(|d| d.get("name")),
            Some(&json!("a"))
        );
    }

    #[test]
    fn compat_switches_load_from_a_yaml_file() {
        let file = std::env::temp_dir().join(format!("docmap-store-compat-{}.yaml", std::process::id()));
        assert!(std::fs::write(&file, "reject_identifier_noop: true\n").is_ok());

        let store = MemoryStore::new().with_compat_file(&file);
        let _ = std::fs::remove_file(&file);

        assert_eq!(
            store.map(|s| s.compat()).ok(),
            Some(StoreCompat {
                reject_identifier_noop: true,
                reject_empty_set: false,
            })
        );
    }

    #[test]
    fn missing_compat_file_is_io_error() {
        let store = MemoryStore::new().with_compat_file(Path::new("/nonexistent/docmap-store.yaml"));
        assert!(matches!(store, Err(StoreError::Io(_))));
    }
}
