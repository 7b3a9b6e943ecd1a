//! Field-level change sets, collection diffs, and concurrency tokens.
//!
//! These are transient values produced by the unit of work for one flush.
//! The compiler reads them; it never mutates them.

use serde::{Deserialize, Serialize};

use crate::value::{CollectionEntry, Value};

/// Old and new value of one changed field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Value at the last synchronization.
    pub old: Value,
    /// Current value.
    pub new: Value,
}

impl FieldChange {
    /// Build a change from its two sides.
    pub const fn new(old: Value, new: Value) -> Self {
        Self { old, new }
    }
}

/// Ordered mapping from field name to its change.
///
/// Iteration follows the order in which fields were first recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    entries: Vec<(String, FieldChange)>,
}

impl ChangeSet {
    /// Create an empty change set.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Record a change. Re-recording a field replaces its change in place.
    pub fn record(&mut self, field: impl Into<String>, old: impl Into<Value>, new: impl Into<Value>) {
        let field = field.into();
        let change = FieldChange::new(old.into(), new.into());
        if let Some((_, existing)) = self.entries.iter_mut().find(|(name, _)| *name == field) {
            *existing = change;
        } else {
            self.entries.push((field, change));
        }
    }

    /// Builder form of [`record`](Self::record).
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, old: impl Into<Value>, new: impl Into<Value>) -> Self {
        self.record(field, old, new);
        self
    }

    /// Look up the change of one field.
    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.entries
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, change)| change)
    }

    /// Whether the field has a recorded change.
    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Iterate changes in recording order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldChange)> {
        self.entries.iter().map(|(name, change)| (name.as_str(), change))
    }

    /// Number of changed fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Elements inserted into and deleted from a collection since its snapshot.
///
/// Entries compare by key and value together, so moving an element to a
/// different key shows up as one deletion plus one insertion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionDiff {
    /// Elements present now but absent from the snapshot.
    pub inserted: Vec<CollectionEntry>,
    /// Elements present in the snapshot but absent now.
    pub deleted: Vec<CollectionEntry>,
}

impl CollectionDiff {
    /// Compute the diff between a snapshot and the current elements.
    pub fn between(snapshot: &[CollectionEntry], current: &[CollectionEntry]) -> Self {
        let inserted = current
            .iter()
            .filter(|entry| !snapshot.contains(entry))
            .cloned()
            .collect();
        let deleted = snapshot
            .iter()
            .filter(|entry| !current.contains(entry))
            .cloned()
            .collect();
        Self { inserted, deleted }
    }

    /// Whether the collection is unchanged.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty()
    }
}

/// Pending synchronization of a collection-valued field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionSchedule {
    /// Nothing to write.
    #[default]
    Unchanged,
    /// Elements were added or removed.
    Update,
    /// The whole collection was dropped.
    Deletion,
}

/// Expected value of a version or lock field, read at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyToken {
    /// Field name of the version or lock field.
    pub field: String,
    /// Value the stored document must still hold.
    pub expected: Value,
}
