//! Change-set provider: the arena of managed documents.
//!
//! Every managed document, embedded or not, lives in one arena addressed by
//! a [`DocumentKey`]. Embedded documents additionally record a
//! [`ParentAssociation`] naming their owner and the field (and collection
//! key) they sit under, which is what collection path resolution walks.
//!
//! ```text
//! User ──address──▶ Address ──phones.2──▶ Phone
//!  root            parent: User          parent: Address
//! ```
//!
//! The unit of work records field changes as they are made, keeping the
//! first old value of each field until the owning root is committed.

use std::collections::{BTreeMap, BTreeSet};

use docmap_types::{
    ChangeSet, CollectionDiff, CollectionEntry, CollectionSchedule, DocumentKey, ElementKey,
    Value,
};

use crate::error::PersistError;

// ---------------------------------------------------------------------------
// Managed documents
// ---------------------------------------------------------------------------

static NULL: Value = Value::Null;

/// One mapped object as known to the unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedDocument {
    /// Class name; the explicit variant tag of the object.
    pub class: String,
    /// Identifier value, once assigned.
    pub identifier: Option<Value>,
    /// Current field values by field name.
    pub fields: BTreeMap<String, Value>,
}

impl ManagedDocument {
    /// A document of the given class with no identifier and no fields.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            identifier: None,
            fields: BTreeMap::new(),
        }
    }

    /// Assign the identifier.
    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<Value>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Set a field value.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Current value of a field, if present.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Current value of a field, null when absent.
    pub fn value(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL)
    }

    /// Identifier value, treating an explicit null as unassigned.
    pub fn identifier(&self) -> Option<&Value> {
        self.identifier.as_ref().filter(|id| !id.is_null())
    }
}

/// Position of an embedded document inside its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentAssociation {
    /// Key of the owning document.
    pub parent: DocumentKey,
    /// Field name of the owner holding this document.
    pub field: String,
    /// Collection key, when held by an embedded-many field.
    pub key: Option<ElementKey>,
}

impl ParentAssociation {
    /// Stored path segment of this document relative to its owner.
    ///
    /// `stored_name` is the storage name of [`field`](Self::field).
    pub fn path_segment(&self, stored_name: &str) -> String {
        match &self.key {
            Some(key) => format!("{stored_name}.{key}"),
            None => stored_name.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Per-flush view of managed documents and their pending changes.
pub trait ChangeSetProvider {
    /// A managed document by key.
    fn document(&self, key: DocumentKey) -> Option<&ManagedDocument>;

    /// Recorded changes of a document; `None` when nothing changed.
    fn change_set(&self, key: DocumentKey) -> Option<&ChangeSet>;

    /// Whether the document is new and will be written by an insert.
    fn is_scheduled_for_insert(&self, key: DocumentKey) -> bool;

    /// Owner of an embedded document.
    fn parent_association(&self, key: DocumentKey) -> Option<&ParentAssociation>;

    /// Pending diff of a collection-valued field.
    fn collection_diff(&self, owner: DocumentKey, field: &str) -> Option<&CollectionDiff>;

    /// Pending synchronization of a collection-valued field.
    fn collection_schedule(&self, owner: DocumentKey, field: &str) -> CollectionSchedule;

    /// A managed document, or [`PersistError::UnmanagedDocument`].
    fn require_document(&self, key: DocumentKey) -> Result<&ManagedDocument, PersistError> {
        self.document(key)
            .ok_or(PersistError::UnmanagedDocument(key))
    }
}

// ---------------------------------------------------------------------------
// Unit of work
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct CollectionState {
    schedule: CollectionSchedule,
    diff: CollectionDiff,
}

/// Arena of managed documents with their change tracking state.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    documents: BTreeMap<DocumentKey, ManagedDocument>,
    change_sets: BTreeMap<DocumentKey, ChangeSet>,
    scheduled_inserts: BTreeSet<DocumentKey>,
    scheduled_upserts: BTreeSet<DocumentKey>,
    parents: BTreeMap<DocumentKey, ParentAssociation>,
    collections: BTreeMap<(DocumentKey, String), CollectionState>,
}

impl UnitOfWork {
    /// Create an empty unit of work.
    pub const fn new() -> Self {
        Self {
            documents: BTreeMap::new(),
            change_sets: BTreeMap::new(),
            scheduled_inserts: BTreeSet::new(),
            scheduled_upserts: BTreeSet::new(),
            parents: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }

    /// Manage a document loaded from the store.
    pub fn register(&mut self, document: ManagedDocument) -> DocumentKey {
        let key = DocumentKey::new();
        self.documents.insert(key, document);
        key
    }

    /// Manage a new document and schedule it for insertion.
    pub fn register_new(&mut self, document: ManagedDocument) -> DocumentKey {
        let key = self.register(document);
        self.scheduled_inserts.insert(key);
        key
    }

    /// Manage a document with a known identifier that may or may not be
    /// stored yet, and schedule it for an upsert.
    pub fn register_upsert(&mut self, document: ManagedDocument) -> DocumentKey {
        let key = self.register(document);
        self.scheduled_upserts.insert(key);
        key
    }

    /// Whether the document will be written by an upsert.
    pub fn is_scheduled_for_upsert(&self, key: DocumentKey) -> bool {
        self.scheduled_upserts.contains(&key)
    }

    /// Record that `child` is embedded in `parent` under `field`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnmanagedDocument`] if either key is unknown.
    pub fn attach(
        &mut self,
        child: DocumentKey,
        parent: DocumentKey,
        field: impl Into<String>,
        key: Option<ElementKey>,
    ) -> Result<(), PersistError> {
        self.require_document(child)?;
        self.require_document(parent)?;
        self.parents.insert(
            child,
            ParentAssociation {
                parent,
                field: field.into(),
                key,
            },
        );
        Ok(())
    }

    /// Register a loaded embedded document, attach it, and place it in the
    /// owner's field without recording a change.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnmanagedDocument`] if `parent` is unknown.
    pub fn embed(
        &mut self,
        parent: DocumentKey,
        field: impl Into<String>,
        key: Option<ElementKey>,
        document: ManagedDocument,
    ) -> Result<DocumentKey, PersistError> {
        let field = field.into();
        let child = self.register(document);
        self.attach(child, parent, field.clone(), key.clone())?;

        let owner = self
            .documents
            .get_mut(&parent)
            .ok_or(PersistError::UnmanagedDocument(parent))?;
        let slot = owner.fields.entry(field).or_default();
        match key {
            None => *slot = Value::Document(child),
            Some(key) => {
                if !matches!(slot, Value::Collection(_)) {
                    *slot = Value::Collection(Vec::new());
                }
                if let Value::Collection(entries) = slot {
                    entries.retain(|entry| entry.key != key);
                    entries.push(CollectionEntry::new(key, Value::Document(child)));
                }
            }
        }
        Ok(child)
    }

    /// Register a new embedded document and attach it in one step.
    ///
    /// The owner's field is left untouched: record the owner's change with
    /// [`record_change`](Self::record_change), or use
    /// [`set_field`](Self::set_field) when the owner is itself new.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnmanagedDocument`] if `parent` is unknown.
    pub fn embed_new(
        &mut self,
        parent: DocumentKey,
        field: impl Into<String>,
        key: Option<ElementKey>,
        document: ManagedDocument,
    ) -> Result<DocumentKey, PersistError> {
        let child = self.register_new(document);
        self.attach(child, parent, field, key)?;
        Ok(child)
    }

    /// Change a field, recording `(old, new)` in the document's change set.
    ///
    /// Changing a field twice keeps the first old value.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnmanagedDocument`] if the key is unknown.
    pub fn record_change(
        &mut self,
        key: DocumentKey,
        field: &str,
        new: impl Into<Value>,
    ) -> Result<(), PersistError> {
        let new = new.into();
        let document = self
            .documents
            .get_mut(&key)
            .ok_or(PersistError::UnmanagedDocument(key))?;
        let current = document.fields.insert(field.to_owned(), new.clone());
        let changes = self.change_sets.entry(key).or_default();
        let old = changes
            .get(field)
            .map(|change| change.old.clone())
            .or(current)
            .unwrap_or_default();
        changes.record(field, old, new);
        Ok(())
    }

    /// Overwrite a field without recording a change.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnmanagedDocument`] if the key is unknown.
    pub fn set_field(
        &mut self,
        key: DocumentKey,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<(), PersistError> {
        let document = self
            .documents
            .get_mut(&key)
            .ok_or(PersistError::UnmanagedDocument(key))?;
        document.fields.insert(field.to_owned(), value.into());
        Ok(())
    }

    /// Assign the identifier of a document.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnmanagedDocument`] if the key is unknown.
    pub fn assign_identifier(
        &mut self,
        key: DocumentKey,
        identifier: impl Into<Value>,
    ) -> Result<(), PersistError> {
        let document = self
            .documents
            .get_mut(&key)
            .ok_or(PersistError::UnmanagedDocument(key))?;
        document.identifier = Some(identifier.into());
        Ok(())
    }

    /// Schedule a collection-valued field for element synchronization.
    pub fn schedule_collection_update(
        &mut self,
        owner: DocumentKey,
        field: impl Into<String>,
        diff: CollectionDiff,
    ) {
        self.collections.insert(
            (owner, field.into()),
            CollectionState {
                schedule: CollectionSchedule::Update,
                diff,
            },
        );
    }

    /// Schedule a collection-valued field for removal.
    pub fn schedule_collection_deletion(&mut self, owner: DocumentKey, field: impl Into<String>) {
        self.collections.insert(
            (owner, field.into()),
            CollectionState {
                schedule: CollectionSchedule::Deletion,
                diff: CollectionDiff::default(),
            },
        );
    }

    /// Collection fields with a pending schedule, for one owner.
    pub fn scheduled_collections(&self, owner: DocumentKey) -> Vec<(String, CollectionSchedule)> {
        self.collections
            .iter()
            .filter(|((key, _), state)| {
                *key == owner && state.schedule != CollectionSchedule::Unchanged
            })
            .map(|((_, field), state)| (field.clone(), state.schedule))
            .collect()
    }

    /// The top-level owner of a document (itself, if not embedded).
    pub fn root_of(&self, key: DocumentKey) -> DocumentKey {
        let mut current = key;
        while let Some(parent) = self.parents.get(&current) {
            current = parent.parent;
        }
        current
    }

    /// Keys of a root and every document embedded beneath it.
    pub fn subtree_of(&self, root: DocumentKey) -> Vec<DocumentKey> {
        self.documents
            .keys()
            .copied()
            .filter(|key| self.root_of(*key) == root)
            .collect()
    }

    /// Forget the recorded field changes of a root and its embedded
    /// documents. Collection schedules are kept.
    ///
    /// Called once the owner update is confirmed, so that a flush retried
    /// after a failed collection command does not apply the same deltas twice.
    pub fn commit_changes(&mut self, root: DocumentKey) {
        for key in self.subtree_of(root) {
            self.change_sets.remove(&key);
        }
    }

    /// Record that the deleted elements of a collection are gone from the
    /// store. The collection stays scheduled if insertions remain.
    pub fn removals_applied(&mut self, owner: DocumentKey, field: &str) {
        let slot = (owner, field.to_owned());
        let Some(state) = self.collections.get_mut(&slot) else {
            return;
        };
        state.diff.deleted.clear();
        if state.schedule == CollectionSchedule::Update && state.diff.is_empty() {
            self.collections.remove(&slot);
        }
    }

    /// Forget the schedule of one collection once it is synchronized.
    pub fn complete_collection(&mut self, owner: DocumentKey, field: &str) {
        self.collections.remove(&(owner, field.to_owned()));
    }

    /// Forget all pending changes of a root and its embedded documents.
    ///
    /// Called once their write is confirmed by the store.
    pub fn commit(&mut self, root: DocumentKey) {
        for key in self.subtree_of(root) {
            self.change_sets.remove(&key);
            self.scheduled_inserts.remove(&key);
            self.scheduled_upserts.remove(&key);
            self.collections.retain(|(owner, _), _| *owner != key);
        }
    }

    /// Top-level documents awaiting an insert, in registration order.
    pub fn pending_inserts(&self) -> Vec<DocumentKey> {
        self.scheduled_inserts
            .iter()
            .copied()
            .filter(|key| !self.parents.contains_key(key))
            .collect()
    }

    /// Top-level documents awaiting an upsert, in registration order.
    pub fn pending_upserts(&self) -> Vec<DocumentKey> {
        self.scheduled_upserts
            .iter()
            .copied()
            .filter(|key| !self.parents.contains_key(key))
            .collect()
    }

    /// Stored top-level documents with changes or collection work anywhere
    /// in their subtree, in registration order.
    pub fn pending_updates(&self) -> Vec<DocumentKey> {
        let mut roots = BTreeSet::new();
        let changed = self
            .change_sets
            .iter()
            .filter(|(_, changes)| !changes.is_empty())
            .map(|(key, _)| *key);
        let collections = self
            .collections
            .iter()
            .filter(|(_, state)| state.schedule != CollectionSchedule::Unchanged)
            .map(|((owner, _), _)| *owner);

        for key in changed.chain(collections) {
            let root = self.root_of(key);
            if !self.scheduled_inserts.contains(&root) && !self.scheduled_upserts.contains(&root) {
                roots.insert(root);
            }
        }
        roots.into_iter().collect()
    }

    /// Number of managed documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether no document is managed.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl ChangeSetProvider for UnitOfWork {
    fn document(&self, key: DocumentKey) -> Option<&ManagedDocument> {
        self.documents.get(&key)
    }

    fn change_set(&self, key: DocumentKey) -> Option<&ChangeSet> {
        self.change_sets.get(&key).filter(|changes| !changes.is_empty())
    }

    fn is_scheduled_for_insert(&self, key: DocumentKey) -> bool {
        self.scheduled_inserts.contains(&key)
    }

    fn parent_association(&self, key: DocumentKey) -> Option<&ParentAssociation> {
        self.parents.get(&key)
    }

    fn collection_diff(&self, owner: DocumentKey, field: &str) -> Option<&CollectionDiff> {
        self.collections
            .get(&(owner, field.to_owned()))
            .map(|state| &state.diff)
    }

    fn collection_schedule(&self, owner: DocumentKey, field: &str) -> CollectionSchedule {
        self.collections
            .get(&(owner, field.to_owned()))
            .map_or(CollectionSchedule::Unchanged, |state| state.schedule)
    }
}
