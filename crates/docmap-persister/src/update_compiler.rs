//! Atomic update compilation: a document's changes to `$set`/`$unset`/`$inc`.
//!
//! The compiler walks the change set of one document and routes every field
//! by its kind. Embedded documents that were already stored are compiled
//! recursively and merged under their dotted prefix, so a change deep in an
//! embed only rewrites the changed leaf:
//!
//! ```text
//! User.change_set        {name: "a" -> "b"}
//! Address.change_set     {city: "Bonn" -> "Berlin"}
//!
//! compiled               {"$set": {"name": "b", "address.city": "Berlin"}}
//! ```
//!
//! Embeds scheduled for insertion are written in full instead. Element-level
//! synchronization of non-atomic collections is left to the
//! [`CollectionPersister`](crate::collection_persister::CollectionPersister).

use serde_json::Value as JsonValue;

use docmap_types::{
    ClassMetadata, CollectionSchedule, CompiledUpdate, DocumentKey, FieldChange, FieldKind,
    FieldMapping, UpdateOperator, Value,
};

use crate::association::{AssociationResolver, join_path, mismatched};
use crate::coercer;
use crate::context::PersistContext;
use crate::error::PersistError;
use crate::metadata::MetadataProvider;
use crate::unit_of_work::ChangeSetProvider;

/// Compiles change sets into atomic update documents.
#[derive(Debug, Clone, Copy)]
pub struct AtomicUpdateCompiler<'a> {
    ctx: PersistContext<'a>,
    resolver: AssociationResolver<'a>,
}

impl<'a> AtomicUpdateCompiler<'a> {
    /// Create a compiler over the given collaborators.
    pub const fn new(ctx: PersistContext<'a>) -> Self {
        Self {
            ctx,
            resolver: AssociationResolver::new(ctx),
        }
    }

    /// Compile the update of a stored document from its pending changes.
    ///
    /// The result is empty when nothing needs writing. Compiling the same
    /// changes twice produces identical output.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnknownField`] for an unmapped change, and
    /// propagates coercion and association errors tagged with their path.
    pub fn compile(&self, key: DocumentKey) -> Result<CompiledUpdate, PersistError> {
        self.compile_document(key, "")
    }

    /// Compile the upsert body of a document.
    ///
    /// Upserts have no stored baseline, so every saved field is written:
    /// scalars, references and nullable nulls with `$set`, increments with
    /// `$inc`. A null therefore overwrites the value of a document that
    /// already exists. The class discriminator is added.
    /// Identifier handling is left to the caller.
    ///
    /// # Errors
    ///
    /// Same as [`compile`](Self::compile).
    pub fn compile_upsert(&self, key: DocumentKey) -> Result<CompiledUpdate, PersistError> {
        let document = self.ctx.documents.require_document(key)?;
        let class = self.ctx.metadata.require_class(&document.class)?;
        let changes = self.ctx.documents.change_set(key);
        let mut update = CompiledUpdate::new();

        for mapping in &class.fields {
            if mapping.not_saved || mapping.identifier || !mapping.is_owning_side() {
                continue;
            }
            let new = document.value(&mapping.field_name);
            let path = mapping.name.as_str();

            if new.is_null() {
                if mapping.nullable && !mapping.is_many() {
                    update.set(path, JsonValue::Null);
                }
                continue;
            }

            match &mapping.kind {
                FieldKind::Increment(ty) => {
                    let delta = match changes.and_then(|c| c.get(&mapping.field_name)) {
                        Some(change) => coercer::increment_delta(*ty, &change.old, new, path)?,
                        None => coercer::increment_delta(*ty, &Value::Null, new, path)?,
                    };
                    update.inc(path, delta);
                }
                FieldKind::Scalar(_) | FieldKind::EmbedOne(_) | FieldKind::ReferenceOne(_) => {
                    if let Some(value) = self.resolver.to_storable(mapping, new, path)? {
                        update.set(path, value);
                    }
                }
                FieldKind::EmbedMany { strategy, .. } | FieldKind::ReferenceMany { strategy, .. } => {
                    if strategy.is_atomic() {
                        if let Some(value) = self.resolver.to_storable(mapping, new, path)? {
                            update.set(path, value);
                        }
                    }
                }
            }
        }

        if let Some(field) = class.discriminator_field.as_deref() {
            update.set(
                field,
                JsonValue::String(class.discriminator_value_or_name().to_owned()),
            );
        }

        tracing::debug!(
            class = %class.name,
            operators = update.operator_count(),
            paths = update.path_count(),
            "Compiled upsert"
        );
        Ok(update)
    }

    // -----------------------------------------------------------------------
    // Update walk
    // -----------------------------------------------------------------------

    /// Compile one document with paths relative to it; `base` is its own
    /// path, used only for diagnostics.
    fn compile_document(&self, key: DocumentKey, base: &str) -> Result<CompiledUpdate, PersistError> {
        let document = self.ctx.documents.require_document(key)?;
        let class = self.ctx.metadata.require_class(&document.class)?;
        let mut update = CompiledUpdate::new();

        if let Some(changes) = self.ctx.documents.change_set(key) {
            for (field, change) in changes.iter() {
                let mapping = class
                    .field_mapping(field)
                    .ok_or_else(|| PersistError::UnknownField {
                        class: class.name.clone(),
                        field: field.to_owned(),
                    })?;
                if mapping.not_saved || mapping.identifier {
                    tracing::trace!(class = %class.name, field, "Skipping unwritable field");
                    continue;
                }
                self.compile_change(&mut update, key, mapping, change, base)?;
            }
        }

        for mapping in &class.fields {
            let changed = self
                .ctx
                .documents
                .change_set(key)
                .is_some_and(|changes| changes.contains(&mapping.field_name));
            if changed || mapping.not_saved || !mapping.is_owning_side() {
                continue;
            }
            self.compile_unchanged(&mut update, key, class, mapping, base)?;
        }

        Ok(update)
    }

    /// Route one recorded change by field kind.
    fn compile_change(
        &self,
        update: &mut CompiledUpdate,
        key: DocumentKey,
        mapping: &FieldMapping,
        change: &FieldChange,
        base: &str,
    ) -> Result<(), PersistError> {
        let name = mapping.name.as_str();
        let path = join_path(base, name);
        let new = &change.new;

        match &mapping.kind {
            FieldKind::Scalar(ty) => {
                match coercer::to_storable(mapping, *ty, new, &path)? {
                    Some(value) => put(update, UpdateOperator::Set, name, value),
                    None => put(update, UpdateOperator::Unset, name, JsonValue::Bool(true)),
                }
            }

            FieldKind::Increment(ty) => {
                if new.is_null() {
                    null_out(update, mapping);
                } else {
                    let delta = coercer::increment_delta(*ty, &change.old, new, &path)?;
                    put(update, UpdateOperator::Inc, name, delta);
                }
            }

            FieldKind::EmbedOne(target) => match new {
                Value::Null => null_out(update, mapping),
                Value::Document(child) if self.ctx.documents.is_scheduled_for_insert(*child) => {
                    let document = self.resolver.embedded_document_value(target, *child, &path)?;
                    put(update, UpdateOperator::Set, name, JsonValue::Object(document));
                }
                Value::Document(child) => {
                    let nested = self.compile_document(*child, &path)?;
                    merge(update, name, nested);
                }
                other => return Err(mismatched(mapping, other, &path)),
            },

            FieldKind::EmbedMany { strategy, .. } => {
                if strategy.is_atomic() {
                    self.write_whole_collection(update, mapping, new, &path)?;
                } else {
                    self.compile_elements(update, key, mapping, new, base)?;
                }
            }

            FieldKind::ReferenceOne(_) => {
                if !mapping.is_owning_side() {
                    return Ok(());
                }
                match self.resolver.to_storable(mapping, new, &path)? {
                    Some(value) => put(update, UpdateOperator::Set, name, value),
                    None => put(update, UpdateOperator::Unset, name, JsonValue::Bool(true)),
                }
            }

            FieldKind::ReferenceMany { strategy, .. } => {
                if mapping.is_owning_side() && strategy.is_atomic() {
                    self.write_whole_collection(update, mapping, new, &path)?;
                }
            }
        }

        Ok(())
    }

    /// Visit fields absent from the change set that may still need writing:
    /// embedded documents with changes of their own, and atomic collections
    /// scheduled by the unit of work.
    fn compile_unchanged(
        &self,
        update: &mut CompiledUpdate,
        key: DocumentKey,
        class: &ClassMetadata,
        mapping: &FieldMapping,
        base: &str,
    ) -> Result<(), PersistError> {
        let document = self.ctx.documents.require_document(key)?;
        let value = document.value(&mapping.field_name);
        let name = mapping.name.as_str();
        let path = join_path(base, name);

        if self.ctx.metadata.collection_strategy(mapping).is_some_and(|s| s.is_atomic()) {
            match self.ctx.documents.collection_schedule(key, &mapping.field_name) {
                CollectionSchedule::Update => {
                    tracing::trace!(class = %class.name, path = %path, "Writing atomic collection");
                    return self.write_whole_collection(update, mapping, value, &path);
                }
                CollectionSchedule::Deletion => {
                    put(update, UpdateOperator::Unset, name, JsonValue::Bool(true));
                    return Ok(());
                }
                CollectionSchedule::Unchanged => {}
            }
        }

        match (&mapping.kind, value) {
            (FieldKind::EmbedOne(_), Value::Document(child))
                if !self.ctx.documents.is_scheduled_for_insert(*child) =>
            {
                let nested = self.compile_document(*child, &path)?;
                merge(update, name, nested);
            }
            (FieldKind::EmbedMany { .. }, _) => {
                self.compile_elements(update, key, mapping, value, base)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Recurse into stored elements of an embedded collection.
    ///
    /// New elements are skipped; they are written by the collection's own
    /// insertion. So is a collection scheduled for deletion.
    fn compile_elements(
        &self,
        update: &mut CompiledUpdate,
        owner: DocumentKey,
        mapping: &FieldMapping,
        value: &Value,
        base: &str,
    ) -> Result<(), PersistError> {
        if self.ctx.documents.collection_schedule(owner, &mapping.field_name)
            == CollectionSchedule::Deletion
        {
            return Ok(());
        }
        let Some(entries) = value.as_collection() else {
            return Ok(());
        };

        for entry in entries {
            let Value::Document(child) = entry.value else {
                continue;
            };
            if self.ctx.documents.is_scheduled_for_insert(child) {
                continue;
            }
            let prefix = format!("{}.{}", mapping.name, entry.key);
            let nested = self.compile_document(child, &join_path(base, &prefix))?;
            merge(update, &prefix, nested);
        }
        Ok(())
    }

    /// `$set` the fully materialized collection, or remove it when null.
    fn write_whole_collection(
        &self,
        update: &mut CompiledUpdate,
        mapping: &FieldMapping,
        value: &Value,
        path: &str,
    ) -> Result<(), PersistError> {
        match self.resolver.to_storable(mapping, value, path)? {
            Some(stored) => put(update, UpdateOperator::Set, &mapping.name, stored),
            None => put(update, UpdateOperator::Unset, &mapping.name, JsonValue::Bool(true)),
        }
        Ok(())
    }
}

fn put(update: &mut CompiledUpdate, operator: UpdateOperator, path: &str, value: JsonValue) {
    if let Some(previous) = update.insert(operator, path, value) {
        tracing::warn!(
            path,
            previous = %previous,
            kept = %operator,
            "Path compiled under two operators, keeping the later one"
        );
    }
}

fn merge(update: &mut CompiledUpdate, prefix: &str, nested: CompiledUpdate) {
    for (path, previous) in update.merge_prefixed(prefix, nested) {
        tracing::warn!(
            path = %path,
            previous = %previous,
            "Embedded path compiled under two operators, keeping the later one"
        );
    }
}

fn null_out(update: &mut CompiledUpdate, mapping: &FieldMapping) {
    if mapping.nullable {
        put(update, UpdateOperator::Set, &mapping.name, JsonValue::Null);
    } else {
        put(update, UpdateOperator::Unset, &mapping.name, JsonValue::Bool(true));
    }
}
