//! Collection persister: synchronizes one collection inside its owner.
//!
//! A collection may live at any depth inside embedded documents. Its stored
//! path is found by walking parent associations up to the top-level owner,
//! whose identifier (and version, when versioned) forms the filter of every
//! command.
//!
//! ```text
//! Address.phones  ─parent─▶  User.address  ─root─▶  User
//!   path: address.phones              filter: {_id, version}
//! ```
//!
//! Commands of one collection are executed in order and never combined.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use docmap_types::{
    ClassMetadata, CollectionDiff, CollectionSchedule, CommandExecutor, CompiledUpdate, DocumentKey,
    FieldMapping, Filter, UpdateCommand,
};

use crate::association::{AssociationResolver, identifier_name, join_path};
use crate::collection_strategy::CollectionStrategyResolver;
use crate::concurrency::OptimisticConcurrencyGuard;
use crate::context::PersistContext;
use crate::error::PersistError;
use crate::metadata::MetadataProvider;
use crate::unit_of_work::ChangeSetProvider;

/// Where a collection is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionPath {
    /// Dotted stored path from the top-level owner.
    pub path: String,
    /// Top-level owner holding the collection.
    pub root: DocumentKey,
}

/// One command synchronizing part of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionWrite {
    /// The update command.
    pub command: UpdateCommand,
    /// Class of the top-level owner.
    pub class: String,
    /// Stored identifier of the top-level owner.
    pub identifier: JsonValue,
    /// Whether the filter carries the owner's version.
    pub versioned: bool,
}

/// Compiles and executes collection synchronization.
#[derive(Debug, Clone, Copy)]
pub struct CollectionPersister<'a> {
    ctx: PersistContext<'a>,
    resolver: AssociationResolver<'a>,
    strategies: CollectionStrategyResolver<'a>,
}

impl<'a> CollectionPersister<'a> {
    /// Create a persister over the given collaborators.
    pub const fn new(ctx: PersistContext<'a>) -> Self {
        Self {
            ctx,
            resolver: AssociationResolver::new(ctx),
            strategies: CollectionStrategyResolver::new(ctx),
        }
    }

    /// Commands for a field according to its pending schedule.
    ///
    /// # Errors
    ///
    /// Same as [`update`](Self::update) and [`delete`](Self::delete).
    pub fn compile(
        &self,
        owner: DocumentKey,
        field: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<CollectionWrite>, PersistError> {
        match self.ctx.documents.collection_schedule(owner, field) {
            CollectionSchedule::Unchanged => Ok(Vec::new()),
            CollectionSchedule::Deletion => self.delete(owner, field, now),
            CollectionSchedule::Update => {
                let empty = CollectionDiff::default();
                let diff = self
                    .ctx
                    .documents
                    .collection_diff(owner, field)
                    .unwrap_or(&empty);
                self.update(owner, field, diff, now)
            }
        }
    }

    /// `$unset` of the whole collection.
    ///
    /// Inverse references are never written and produce no command.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnsupportedCollectionStrategy`] for atomic
    /// strategies, which are written with their owner, and the errors of
    /// [`resolve_path`](Self::resolve_path).
    pub fn delete(
        &self,
        owner: DocumentKey,
        field: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<CollectionWrite>, PersistError> {
        let mapping = self.collection_mapping(owner, field)?;
        if !mapping.is_owning_side() {
            return Ok(Vec::new());
        }
        refuse_atomic(mapping, field)?;

        let location = self.resolve_path(owner, field)?;
        let mut update = CompiledUpdate::new();
        update.unset(location.path.clone());

        tracing::debug!(path = %location.path, "Compiled collection deletion");
        Ok(vec![self.owner_write(location.root, update, now)?])
    }

    /// The ordered commands applying `diff` to a collection.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnsupportedCollectionStrategy`] for atomic
    /// strategies, and propagates path and element resolution errors.
    pub fn update(
        &self,
        owner: DocumentKey,
        field: &str,
        diff: &CollectionDiff,
        now: DateTime<Utc>,
    ) -> Result<Vec<CollectionWrite>, PersistError> {
        let mapping = self.collection_mapping(owner, field)?;
        if !mapping.is_owning_side() || diff.is_empty() {
            return Ok(Vec::new());
        }
        refuse_atomic(mapping, field)?;

        let location = self.resolve_path(owner, field)?;
        let document = self.ctx.documents.require_document(owner)?;
        let current = document.value(field).as_collection().unwrap_or_default();

        let updates = self
            .strategies
            .compile(mapping, &location.path, current, diff)?;

        tracing::debug!(
            path = %location.path,
            commands = updates.len(),
            "Compiled collection synchronization"
        );

        updates
            .into_iter()
            .map(|update| self.owner_write(location.root, update, now))
            .collect()
    }

    /// Stored path of `owner.field` from the top-level owner.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnmanagedDocument`],
    /// [`PersistError::UnknownClass`], or [`PersistError::UnknownField`]
    /// when the parent chain is inconsistent with the metadata.
    pub fn resolve_path(&self, owner: DocumentKey, field: &str) -> Result<CollectionPath, PersistError> {
        let mapping = self.collection_mapping(owner, field)?;
        let mut path = mapping.name.clone();
        let mut current = owner;

        while let Some(parent) = self.ctx.documents.parent_association(current) {
            let document = self.ctx.documents.require_document(parent.parent)?;
            let class = self.ctx.metadata.require_class(&document.class)?;
            let holder = require_field(class, &parent.field)?;
            path = join_path(&parent.path_segment(&holder.name), &path);
            current = parent.parent;
        }

        tracing::trace!(%path, "Resolved collection path");
        Ok(CollectionPath {
            path,
            root: current,
        })
    }

    /// Run commands in order, stopping at the first failure.
    ///
    /// Returns how many commands were applied.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::OptimisticLockConflict`] when a versioned
    /// owner no longer matches, or the executor's error.
    pub fn execute<E: CommandExecutor + ?Sized>(
        executor: &mut E,
        writes: &[CollectionWrite],
    ) -> Result<usize, PersistError> {
        let mut applied: usize = 0;
        for write in writes {
            let result = executor.update(&write.command)?;
            if write.versioned && result.matched_count == 0 {
                tracing::debug!(
                    class = %write.class,
                    id = %write.identifier,
                    applied,
                    "Collection write matched no current owner version"
                );
                return Err(PersistError::OptimisticLockConflict {
                    class: write.class.clone(),
                    id: write.identifier.to_string(),
                });
            }
            applied = applied.saturating_add(1);
        }
        Ok(applied)
    }

    fn collection_mapping(&self, owner: DocumentKey, field: &str) -> Result<&'a FieldMapping, PersistError> {
        let document = self.ctx.documents.require_document(owner)?;
        let class = self.ctx.metadata.require_class(&document.class)?;
        let mapping = require_field(class, field)?;
        if !mapping.is_many() {
            return Err(PersistError::UnsupportedCollectionStrategy {
                path: field.to_owned(),
                strategy: mapping.kind.association_kind().to_string(),
            });
        }
        Ok(mapping)
    }

    /// Wrap an update in a command filtered by the owner's identity.
    fn owner_write(
        &self,
        root: DocumentKey,
        update: CompiledUpdate,
        now: DateTime<Utc>,
    ) -> Result<CollectionWrite, PersistError> {
        let document = self.ctx.documents.require_document(root)?;
        let class = self.ctx.metadata.require_class(&document.class)?;
        let identifier = self.resolver.document_identifier(root)?;

        let mut filter = Filter::by_id(
            identifier_name(class, &self.ctx.config.identifier_field),
            identifier.clone(),
        );
        let guard = OptimisticConcurrencyGuard::for_document(self.ctx.metadata, class, document, now)?;
        guard.version_filter(&mut filter)?;

        Ok(CollectionWrite {
            command: UpdateCommand::new(class.collection.clone(), filter, update),
            class: class.name.clone(),
            identifier,
            versioned: guard.version().is_some(),
        })
    }
}

fn require_field<'c>(class: &'c ClassMetadata, field: &str) -> Result<&'c FieldMapping, PersistError> {
    class
        .field_mapping(field)
        .ok_or_else(|| PersistError::UnknownField {
            class: class.name.clone(),
            field: field.to_owned(),
        })
}

fn refuse_atomic(mapping: &FieldMapping, path: &str) -> Result<(), PersistError> {
    match mapping.collection_strategy() {
        Some(strategy) if strategy.is_atomic() => Err(PersistError::UnsupportedCollectionStrategy {
            path: path.to_owned(),
            strategy: strategy.to_string(),
        }),
        _ => Ok(()),
    }
}
