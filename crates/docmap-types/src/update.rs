//! Compiled atomic updates, match filters, and write commands.
//!
//! A [`CompiledUpdate`] maps each update operator to the dotted paths it
//! touches. A path lives under at most one operator: inserting it under a
//! second operator moves it there and reports the operator it displaced.
//!
//! # Wire format
//!
//! ```text
//! {
//!   "$inc":   { "version": 1 },
//!   "$set":   { "address.city": "Berlin" },
//!   "$unset": { "nickname": true }
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

/// An atomic update operator understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UpdateOperator {
    /// Replace a field value.
    #[serde(rename = "$set")]
    Set,
    /// Remove a field.
    #[serde(rename = "$unset")]
    Unset,
    /// Add a delta to a numeric field.
    #[serde(rename = "$inc")]
    Inc,
    /// Append to an array, optionally `$each`.
    #[serde(rename = "$push")]
    Push,
    /// Legacy append of a list of values.
    #[serde(rename = "$pushAll")]
    PushAll,
    /// Append to an array unless already present, optionally `$each`.
    #[serde(rename = "$addToSet")]
    AddToSet,
    /// Remove array elements equal to a value.
    #[serde(rename = "$pull")]
    Pull,
    /// Replace a field value only when an upsert inserts.
    #[serde(rename = "$setOnInsert")]
    SetOnInsert,
}

impl UpdateOperator {
    /// Return the wire name of the operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Set => "$set",
            Self::Unset => "$unset",
            Self::Inc => "$inc",
            Self::Push => "$push",
            Self::PushAll => "$pushAll",
            Self::AddToSet => "$addToSet",
            Self::Pull => "$pull",
            Self::SetOnInsert => "$setOnInsert",
        }
    }

    /// Parse a wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "$set" => Some(Self::Set),
            "$unset" => Some(Self::Unset),
            "$inc" => Some(Self::Inc),
            "$push" => Some(Self::Push),
            "$pushAll" => Some(Self::PushAll),
            "$addToSet" => Some(Self::AddToSet),
            "$pull" => Some(Self::Pull),
            "$setOnInsert" => Some(Self::SetOnInsert),
            _ => None,
        }
    }
}

impl core::fmt::Display for UpdateOperator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Compiled update
// ---------------------------------------------------------------------------

/// An atomic update document: operator to dotted path to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompiledUpdate {
    operators: BTreeMap<UpdateOperator, Map<String, JsonValue>>,
}

impl CompiledUpdate {
    /// Create an empty update.
    pub const fn new() -> Self {
        Self {
            operators: BTreeMap::new(),
        }
    }

    /// An update consisting of one empty `$set` object.
    ///
    /// Older stores accept this as an upsert no-op where they reject an
    /// entirely empty update.
    pub fn empty_set() -> Self {
        let mut operators = BTreeMap::new();
        operators.insert(UpdateOperator::Set, Map::new());
        Self { operators }
    }

    /// Put `path` under `operator`, removing it from any other operator.
    ///
    /// Returns the operator the path was moved away from, if any.
    pub fn insert(
        &mut self,
        operator: UpdateOperator,
        path: impl Into<String>,
        value: JsonValue,
    ) -> Option<UpdateOperator> {
        let path = path.into();
        let displaced = self
            .operators
            .iter()
            .find(|(op, fields)| **op != operator && fields.contains_key(&path))
            .map(|(op, _)| *op);
        if let Some(previous) = displaced {
            self.remove(previous, &path);
        }
        self.operators
            .entry(operator)
            .or_default()
            .insert(path, value);
        displaced
    }

    /// `$set` a path.
    pub fn set(&mut self, path: impl Into<String>, value: JsonValue) -> Option<UpdateOperator> {
        self.insert(UpdateOperator::Set, path, value)
    }

    /// `$unset` a path.
    pub fn unset(&mut self, path: impl Into<String>) -> Option<UpdateOperator> {
        self.insert(UpdateOperator::Unset, path, JsonValue::Bool(true))
    }

    /// `$inc` a path.
    pub fn inc(&mut self, path: impl Into<String>, delta: JsonValue) -> Option<UpdateOperator> {
        self.insert(UpdateOperator::Inc, path, delta)
    }

    /// Value stored for `path` under `operator`.
    pub fn get(&self, operator: UpdateOperator, path: &str) -> Option<&JsonValue> {
        self.operators.get(&operator).and_then(|fields| fields.get(path))
    }

    /// All paths under one operator.
    pub fn operator(&self, operator: UpdateOperator) -> Option<&Map<String, JsonValue>> {
        self.operators.get(&operator)
    }

    /// Operator a path currently lives under.
    pub fn operator_of(&self, path: &str) -> Option<UpdateOperator> {
        self.operators
            .iter()
            .find(|(_, fields)| fields.contains_key(path))
            .map(|(op, _)| *op)
    }

    /// Remove `path` from `operator`, dropping the operator once empty.
    pub fn remove(&mut self, operator: UpdateOperator, path: &str) -> Option<JsonValue> {
        let fields = self.operators.get_mut(&operator)?;
        let removed = fields.remove(path);
        if fields.is_empty() {
            self.operators.remove(&operator);
        }
        removed
    }

    /// Remove `path` from every operator.
    pub fn remove_path(&mut self, path: &str) -> bool {
        self.operator_of(path)
            .and_then(|op| self.remove(op, path))
            .is_some()
    }

    /// Merge another update, prefixing each of its paths with `prefix.`.
    ///
    /// Returns the `(path, displaced operator)` pairs of paths that moved.
    pub fn merge_prefixed(
        &mut self,
        prefix: &str,
        other: Self,
    ) -> Vec<(String, UpdateOperator)> {
        let mut moved = Vec::new();
        for (operator, fields) in other.operators {
            for (path, value) in fields {
                let full = if prefix.is_empty() {
                    path
                } else {
                    format!("{prefix}.{path}")
                };
                if let Some(previous) = self.insert(operator, full.clone(), value) {
                    moved.push((full, previous));
                }
            }
        }
        moved
    }

    /// Iterate operators and their paths in operator order.
    pub fn iter(&self) -> impl Iterator<Item = (UpdateOperator, &Map<String, JsonValue>)> {
        self.operators.iter().map(|(op, fields)| (*op, fields))
    }

    /// Number of distinct operators present.
    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    /// Total number of paths across all operators.
    pub fn path_count(&self) -> usize {
        self.operators.values().map(Map::len).sum()
    }

    /// Whether no operator carries anything.
    ///
    /// An explicit empty `$set` (see [`empty_set`](Self::empty_set)) is not
    /// considered empty.
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Render the update as a wire document.
    pub fn to_document(&self) -> JsonValue {
        let mut document = Map::new();
        for (operator, fields) in &self.operators {
            document.insert(operator.as_str().to_owned(), JsonValue::Object(fields.clone()));
        }
        JsonValue::Object(document)
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Match criteria of an update: field to value or condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(pub Map<String, JsonValue>);

impl Filter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Match a document by identifier.
    pub fn by_id(field: impl Into<String>, id: JsonValue) -> Self {
        let mut filter = Self::new();
        filter.insert(field, id);
        filter
    }

    /// Require `field` to equal `value`.
    pub fn insert(&mut self, field: impl Into<String>, value: JsonValue) {
        self.0.insert(field.into(), value);
    }

    /// Require `field` not to exist.
    pub fn require_absent(&mut self, field: impl Into<String>) {
        let mut condition = Map::new();
        condition.insert("$exists".to_owned(), JsonValue::Bool(false));
        self.0.insert(field.into(), JsonValue::Object(condition));
    }

    /// Criterion for `field`.
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    /// Iterate criteria.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    /// Render the filter as a wire document.
    pub fn to_document(&self) -> JsonValue {
        JsonValue::Object(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// One update command against a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateCommand {
    /// Target collection.
    pub collection: String,
    /// Match criteria.
    pub filter: Filter,
    /// Atomic update document.
    pub update: CompiledUpdate,
    /// Insert when nothing matches.
    pub upsert: bool,
}

impl UpdateCommand {
    /// A plain (non-upsert) update.
    pub fn new(collection: impl Into<String>, filter: Filter, update: CompiledUpdate) -> Self {
        Self {
            collection: collection.into(),
            filter,
            update,
            upsert: false,
        }
    }
}

/// One insert command against a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsertCommand {
    /// Target collection.
    pub collection: String,
    /// Full document to insert.
    pub document: Map<String, JsonValue>,
}

/// Outcome of a command, as reported by the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Number of documents the filter matched.
    pub matched_count: u64,
    /// Number of documents actually changed.
    pub modified_count: u64,
    /// Identifier of the document an upsert inserted.
    pub upserted_id: Option<JsonValue>,
}
